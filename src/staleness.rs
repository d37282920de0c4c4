// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staleness policy and the catalog loader built on it.
//!
//! A domain is refreshed from the backend only when it is both stale and
//! reachable. Offline, stale data is served as-is and no error is raised.
//!
//! | Domain                      | Max age (default) |
//! |-----------------------------|-------------------|
//! | categories, products        | 25 h              |
//! | customers                   | 3 h               |
//! | carriers, deliveries, stock | 25 h              |

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{ReferenceDomain, ResolveError, Resolution, Resolver, Source};
use crate::config::EngineConfig;
use crate::cursor::{CustomerRoster, SyncCursor};
use crate::remote::CommerceApi;
use crate::storage::{SqlStore, StorageError};

/// Parse a stored sync timestamp: RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS` (UTC).
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// True when `last_synced_at` is absent, unparsable, in the future, or
/// strictly older than `max_age_hours` at `now`.
#[must_use]
pub fn is_stale(last_synced_at: Option<&str>, max_age_hours: u64, now: DateTime<Utc>) -> bool {
    let Some(synced) = last_synced_at.and_then(parse_timestamp) else {
        return true;
    };
    let age = now.signed_duration_since(synced);
    // Stamped ahead of the clock
    if age < TimeDelta::zero() {
        return true;
    }
    let Some(max_age) = i64::try_from(max_age_hours).ok().and_then(TimeDelta::try_hours) else {
        // Larger than any representable age
        return false;
    };
    age > max_age
}

/// Per-domain maximum ages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub category_hours: u64,
    pub customer_hours: u64,
    pub reference_hours: u64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl StalenessPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            category_hours: config.category_max_age_hours,
            customer_hours: config.customer_max_age_hours,
            reference_hours: config.reference_max_age_hours,
        }
    }

    #[must_use]
    pub fn for_domain(&self, domain: ReferenceDomain) -> u64 {
        match domain {
            ReferenceDomain::Categories | ReferenceDomain::Products => self.category_hours,
            ReferenceDomain::Customers => self.customer_hours,
            ReferenceDomain::Carriers | ReferenceDomain::Deliveries | ReferenceDomain::ProductStock => {
                self.reference_hours
            }
        }
    }

    #[must_use]
    pub fn is_stale(&self, domain: ReferenceDomain, last_synced_at: Option<&str>, now: DateTime<Utc>) -> bool {
        is_stale(last_synced_at, self.for_domain(domain), now)
    }
}

/// Rows served by [`CatalogLoader::load`].
#[derive(Debug)]
pub struct CatalogLoad {
    pub source: Source,
    pub rows: Vec<Value>,
    /// The domain was refreshed from the backend during this call
    pub refreshed: bool,
    /// A refresh was attempted and failed; `rows` are the cached fallback
    pub refresh_error: Option<ResolveError>,
}

/// Staleness-aware front door for reference reads.
pub struct CatalogLoader {
    store: Arc<SqlStore>,
    api: Arc<dyn CommerceApi>,
    resolver: Arc<Resolver>,
    roster: Arc<CustomerRoster>,
    policy: StalenessPolicy,
}

impl CatalogLoader {
    pub fn new(
        store: Arc<SqlStore>,
        api: Arc<dyn CommerceApi>,
        resolver: Arc<Resolver>,
        roster: Arc<CustomerRoster>,
        policy: StalenessPolicy,
    ) -> Self {
        Self {
            store,
            api,
            resolver,
            roster,
            policy,
        }
    }

    /// Rows for `domain` (optionally narrowed by `key`).
    ///
    /// - stale and reachable: bulk refresh, stamp the cursor, serve fresh rows
    /// - fresh and reachable: cache first, backend on a keyed miss
    /// - unreachable: cached rows, no error, no remote call
    ///
    /// Only local storage failures are returned as `Err`.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, domain: ReferenceDomain, key: Option<i64>) -> Result<CatalogLoad, StorageError> {
        let now = Utc::now();
        let mut cursor = SyncCursor::load(&self.store, domain.table()).await?;
        let stale = self.policy.is_stale(domain, cursor.last_synced_at.as_deref(), now);

        if !self.api.is_reachable().await {
            debug!(stale, "Backend unreachable, serving cache");
            return self.serve_local(domain, key, None).await;
        }

        if stale {
            if domain == ReferenceDomain::Customers {
                let report = self.roster.refresh(false).await?;
                let error = report.error.map(ResolveError::Remote);
                let mut load = self.serve_local(domain, key, error).await?;
                load.refreshed = report.completed;
                return Ok(load);
            }

            return match self.resolver.fetch_remote(domain, None).await {
                Ok(rows) => {
                    cursor.mark_synced(now);
                    cursor.save(&self.store).await?;
                    info!(domain = %domain, rows = rows.len(), "Domain refreshed");
                    let rows = match key {
                        None => rows,
                        Some(_) => self.resolver.local(domain, key).await?,
                    };
                    Ok(CatalogLoad {
                        source: Source::Remote,
                        rows,
                        refreshed: true,
                        refresh_error: None,
                    })
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Refresh failed, serving cache");
                    self.serve_local(domain, key, Some(e)).await
                }
            };
        }

        if key.is_none() {
            return self.serve_local(domain, key, None).await;
        }
        match self.resolver.resolve(domain, key).await {
            Resolution::Found { source, rows } => Ok(CatalogLoad {
                source,
                rows,
                refreshed: false,
                refresh_error: None,
            }),
            Resolution::Failed { error } => self.serve_local(domain, key, Some(error)).await,
        }
    }

    async fn serve_local(
        &self,
        domain: ReferenceDomain,
        key: Option<i64>,
        refresh_error: Option<ResolveError>,
    ) -> Result<CatalogLoad, StorageError> {
        let rows = self.resolver.local(domain, key).await?;
        Ok(CatalogLoad {
            source: Source::Local,
            rows,
            refreshed: false,
            refresh_error,
        })
    }
}
