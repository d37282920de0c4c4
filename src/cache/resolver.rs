// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-or-fetch resolution for reference data.
//!
//! ```text
//! resolve(domain, Some(key)) ──► local rows for key? ──yes──► Found{Local}
//!                                        │ no
//!                                        ▼
//! resolve(domain, None) ───────► backend fetch ──ok──► write-through ──► Found{Remote}
//!                                        │ err
//!                                        ▼
//!                                  Failed{error}
//! ```
//!
//! The resolver never returns `Err`: callers get a [`Resolution`] and decide
//! whether to fall back to stale data or surface the failure.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::{CacheEntry, CacheTable, ReferenceDomain};
use crate::metrics;
use crate::remote::{CommerceApi, RemoteError, RemoteResult};
use crate::storage::{json_id, SqlStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Remote,
}

impl Source {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of a resolve call.
#[derive(Debug)]
pub enum Resolution {
    Found { source: Source, rows: Vec<Value> },
    Failed { error: ResolveError },
}

impl Resolution {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    #[must_use]
    pub fn source(&self) -> Option<Source> {
        match self {
            Self::Found { source, .. } => Some(*source),
            Self::Failed { .. } => None,
        }
    }

    /// Rows found, empty on failure.
    #[must_use]
    pub fn rows(&self) -> &[Value] {
        match self {
            Self::Found { rows, .. } => rows,
            Self::Failed { .. } => &[],
        }
    }

    pub fn into_result(self) -> Result<(Source, Vec<Value>), ResolveError> {
        match self {
            Self::Found { source, rows } => Ok((source, rows)),
            Self::Failed { error } => Err(error),
        }
    }
}

/// Render integer id fields (`id`, `id_*`) as strings, the way the backend
/// serializes them.
pub fn coerce_remote_shape(row: &mut Map<String, Value>) {
    for (field, value) in row.iter_mut() {
        if field != "id" && !field.starts_with("id_") {
            continue;
        }
        if let Some(n) = value.as_i64() {
            *value = Value::String(n.to_string());
        }
    }
}

pub struct Resolver {
    store: Arc<SqlStore>,
    api: Arc<dyn CommerceApi>,
}

impl Resolver {
    pub fn new(store: Arc<SqlStore>, api: Arc<dyn CommerceApi>) -> Self {
        Self { store, api }
    }

    fn table(&self, domain: ReferenceDomain) -> Result<CacheTable<Value>, StorageError> {
        CacheTable::new(self.store.clone(), domain.table())
    }

    /// Local first when a key is given, backend otherwise (or on a local miss).
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, domain: ReferenceDomain, key: Option<i64>) -> Resolution {
        let _timer = metrics::LatencyTimer::new("resolver", "resolve");

        if key.is_some() {
            match self.local(domain, key).await {
                Ok(rows) if !rows.is_empty() => {
                    debug!(rows = rows.len(), "Served from cache");
                    metrics::record_resolve(domain.table(), Source::Local.as_str());
                    return Resolution::Found {
                        source: Source::Local,
                        rows,
                    };
                }
                Ok(_) => debug!("Cache miss"),
                // Unreadable cache is not fatal for a read; try the backend
                Err(e) => warn!(error = %e, "Cache read failed, trying remote"),
            }
        }

        match self.fetch_remote(domain, key).await {
            Ok(rows) => {
                metrics::record_resolve(domain.table(), Source::Remote.as_str());
                Resolution::Found {
                    source: Source::Remote,
                    rows,
                }
            }
            Err(error) => {
                warn!(error = %error, "Resolve failed");
                Resolution::Failed { error }
            }
        }
    }

    /// Cached rows for `key` (or every cached row when `key` is `None`),
    /// without touching the backend.
    pub async fn local(&self, domain: ReferenceDomain, key: Option<i64>) -> Result<Vec<Value>, StorageError> {
        let table = self.table(domain)?;
        let entries = match (key, domain.lookup_field()) {
            (None, _) => table.all().await?,
            (Some(k), None) => table.get(k).await?.into_iter().collect(),
            (Some(k), Some(_)) => table.find_by("lookup", k).await?,
        };
        Ok(entries.into_iter().map(|e| e.value).collect())
    }

    /// Fetch from the backend and write every returned row through to the
    /// cache before returning them.
    pub async fn fetch_remote(&self, domain: ReferenceDomain, key: Option<i64>) -> Result<Vec<Value>, ResolveError> {
        let rows = call_remote(self.api.as_ref(), domain, key).await?;
        self.write_through(domain, key, &rows).await?;
        Ok(rows)
    }

    async fn write_through(
        &self,
        domain: ReferenceDomain,
        key: Option<i64>,
        rows: &[Value],
    ) -> Result<usize, StorageError> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(id) = json_id(row, "id") else {
                warn!(domain = %domain, "Remote row without id, not cached");
                continue;
            };
            // A keyed fetch stores its key so the same keyed read hits locally next time
            let lookup = domain
                .lookup_field()
                .and_then(|field| key.or_else(|| json_id(row, field)));
            entries.push(CacheEntry::new(id, row.clone()).with_lookup(lookup));
        }

        if entries.is_empty() {
            return Ok(0);
        }
        let written = self.table(domain)?.put_many(&entries).await?;
        metrics::record_cache_upsert(domain.table(), written);
        debug!(domain = %domain, written, "Write-through complete");
        Ok(written)
    }
}

pub(crate) async fn call_remote(
    api: &dyn CommerceApi,
    domain: ReferenceDomain,
    key: Option<i64>,
) -> RemoteResult<Vec<Value>> {
    match domain {
        ReferenceDomain::Carriers => api.fetch_carriers(key).await,
        ReferenceDomain::Deliveries => api.fetch_deliveries(key).await,
        ReferenceDomain::Categories => api.fetch_categories(key).await,
        ReferenceDomain::Products => api.fetch_products(key).await,
        ReferenceDomain::ProductStock => api.fetch_product_stock(key).await,
        ReferenceDomain::Customers => match key {
            Some(id) => api.fetch_customer(id).await,
            None => api.fetch_customers(0, 0, 0).await,
        },
    }
}
