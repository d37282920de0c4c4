// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental fetch progress per synchronized domain.
//!
//! A [`SyncCursor`] records how far a paged download got (last remote id,
//! last page, rows so far) and when the domain last completed a refresh. The
//! staleness checks read `last_synced_at`; the customer roster advances the
//! rest page by page so an interrupted download resumes where it stopped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::{encode_entry, CacheEntry, CacheTable, ReferenceDomain};
use crate::metrics;
use crate::remote::{CommerceApi, RemoteError};
use crate::staleness::is_stale;
use crate::storage::{json_id, Row, RowExt, SqlStore, StorageError};

const CURSOR_TABLE: &str = "sync_cursors";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub domain: String,
    pub last_remote_id: i64,
    pub last_page: u32,
    pub fetched_count: u64,
    pub last_synced_at: Option<String>,
}

impl SyncCursor {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            last_remote_id: 0,
            last_page: 0,
            fetched_count: 0,
            last_synced_at: None,
        }
    }

    /// Stored cursor for `domain`, or a fresh one if none was saved yet.
    pub async fn load(store: &SqlStore, domain: &str) -> Result<Self, StorageError> {
        let rows = store.query_rows(CURSOR_TABLE, Some("domain = ?"), &[json!(domain)]).await?;
        match rows.first() {
            None => Ok(Self::new(domain)),
            Some(row) => Ok(Self {
                domain: domain.to_string(),
                last_remote_id: row.i64_col("last_remote_id")?,
                last_page: row.i64_col("last_page")?.clamp(0, u32::MAX as i64) as u32,
                fetched_count: row.i64_col("fetched_count")?.max(0) as u64,
                last_synced_at: row.opt_str_col("last_synced_at")?,
            }),
        }
    }

    pub async fn save(&self, store: &SqlStore) -> Result<(), StorageError> {
        store.upsert_row(CURSOR_TABLE, &self.to_row(), "domain").await
    }

    /// Forget all progress for `domain`.
    pub async fn reset(store: &SqlStore, domain: &str) -> Result<(), StorageError> {
        store
            .execute("DELETE FROM sync_cursors WHERE domain = ?", &[json!(domain)])
            .await?;
        Ok(())
    }

    /// Stamp a completed refresh.
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.last_synced_at = Some(now.to_rfc3339());
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("domain".into(), json!(self.domain));
        row.insert("last_remote_id".into(), json!(self.last_remote_id));
        row.insert("last_page".into(), json!(self.last_page));
        row.insert("fetched_count".into(), json!(self.fetched_count));
        row.insert(
            "last_synced_at".into(),
            self.last_synced_at.clone().map_or(Value::Null, Value::String),
        );
        row
    }
}

/// Result of one roster refresh. Network failures are reported here rather
/// than returned as errors; rows fetched before the failure stay cached.
#[derive(Debug, Default)]
pub struct RosterReport {
    pub fetched: usize,
    pub pages: u32,
    /// The download reached the last page and stamped `last_synced_at`
    pub completed: bool,
    /// Nothing fetched because the roster was fresh or the backend unreachable
    pub skipped: bool,
    pub error: Option<RemoteError>,
}

/// Incremental, paged download of the customer roster.
pub struct CustomerRoster {
    store: Arc<SqlStore>,
    api: Arc<dyn CommerceApi>,
    page_size: u32,
    max_age_hours: u64,
}

impl CustomerRoster {
    pub fn new(store: Arc<SqlStore>, api: Arc<dyn CommerceApi>, page_size: u32, max_age_hours: u64) -> Self {
        Self {
            store,
            api,
            page_size,
            max_age_hours,
        }
    }

    fn domain() -> &'static str {
        ReferenceDomain::Customers.table()
    }

    /// Fetch customers newer than the cursor, one page at a time.
    ///
    /// Skipped when the roster is fresh (unless `force`) or the backend is
    /// unreachable. `force` also rewinds the cursor for a full re-download.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, force: bool) -> Result<RosterReport, StorageError> {
        let now = Utc::now();
        let mut report = RosterReport::default();

        if force {
            SyncCursor::reset(&self.store, Self::domain()).await?;
        }
        let mut cursor = SyncCursor::load(&self.store, Self::domain()).await?;

        if !force && !is_stale(cursor.last_synced_at.as_deref(), self.max_age_hours, now) {
            debug!("Customer roster fresh, skipping refresh");
            report.skipped = true;
            return Ok(report);
        }
        if !self.api.is_reachable().await {
            debug!("Backend unreachable, serving cached roster");
            report.skipped = true;
            return Ok(report);
        }

        loop {
            let page = cursor.last_page + 1;
            let rows = match self
                .api
                .fetch_customers(cursor.last_remote_id, page, self.page_size)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(page, error = %e, "Roster page fetch failed");
                    report.error = Some(e);
                    break;
                }
            };

            let count = rows.len();
            let max_id = rows.iter().filter_map(|r| json_id(r, "id")).max();
            let last_page = self.page_size == 0 || count < self.page_size as usize;

            let advanced = max_id.is_some_and(|id| id > cursor.last_remote_id);
            if let Some(id) = max_id {
                cursor.last_remote_id = cursor.last_remote_id.max(id);
            }
            cursor.last_page = page;
            cursor.fetched_count += count as u64;
            if last_page {
                cursor.mark_synced(now);
                cursor.last_page = 0;
            }

            self.store_page(&rows, &cursor).await?;
            metrics::record_roster_page(Self::domain(), count);
            report.fetched += count;
            report.pages += 1;

            if last_page {
                report.completed = true;
                break;
            }
            if !advanced {
                warn!(page, "Roster page did not advance the cursor, stopping");
                break;
            }
        }

        info!(
            fetched = report.fetched,
            pages = report.pages,
            completed = report.completed,
            "Customer roster refresh finished"
        );
        Ok(report)
    }

    /// Page rows and the advanced cursor commit together.
    async fn store_page(&self, rows: &[Value], cursor: &SyncCursor) -> Result<(), StorageError> {
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(id) = json_id(row, "id") {
                encoded.push(encode_entry(&CacheEntry::new(id, row.clone()))?);
            }
        }
        let cursor_row = cursor.to_row();
        let table = Self::domain();

        self.store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    for row in &encoded {
                        tx.upsert_row(table, row, "id").await?;
                    }
                    tx.upsert_row(CURSOR_TABLE, &cursor_row, "domain").await
                })
            })
            .await
    }

    /// Cached customer by id.
    pub async fn get(&self, id: i64) -> Result<Option<Value>, StorageError> {
        let table: CacheTable<Value> = CacheTable::new(self.store.clone(), Self::domain())?;
        Ok(table.get(id).await?.map(|e| e.value))
    }

    /// Every cached customer in id order.
    pub async fn list(&self) -> Result<Vec<Value>, StorageError> {
        let table: CacheTable<Value> = CacheTable::new(self.store.clone(), Self::domain())?;
        Ok(table.all().await?.into_iter().map(|e| e.value).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Endpoint, InMemoryCommerceApi};
    use crate::schema::{Migration, SchemaInitializer};
    use chrono::Duration;

    async fn setup(customers: i64) -> (Arc<SqlStore>, Arc<InMemoryCommerceApi>) {
        let store = SqlStore::in_memory().await.unwrap();
        SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
        let api = Arc::new(InMemoryCommerceApi::new());
        api.seed(
            Endpoint::Customers,
            (1..=customers)
                .map(|i| json!({"id": i.to_string(), "lastname": format!("Rossi {i}")}))
                .collect(),
        );
        (Arc::new(store), api)
    }

    #[tokio::test]
    async fn test_cursor_round_trip_and_reset() {
        let (store, _) = setup(0).await;
        let mut cursor = SyncCursor::load(&store, "customers").await.unwrap();
        assert_eq!(cursor, SyncCursor::new("customers"));

        cursor.last_remote_id = 42;
        cursor.fetched_count = 42;
        cursor.mark_synced(Utc::now());
        cursor.save(&store).await.unwrap();
        assert_eq!(SyncCursor::load(&store, "customers").await.unwrap(), cursor);

        SyncCursor::reset(&store, "customers").await.unwrap();
        assert_eq!(SyncCursor::load(&store, "customers").await.unwrap().last_remote_id, 0);
    }

    #[tokio::test]
    async fn test_refresh_pages_until_short_page() {
        let (store, api) = setup(25).await;
        let roster = CustomerRoster::new(store.clone(), api.clone(), 10, 3);

        let report = roster.refresh(false).await.unwrap();
        assert!(report.completed);
        assert_eq!(report.fetched, 25);
        assert_eq!(report.pages, 3);
        assert_eq!(roster.list().await.unwrap().len(), 25);

        let cursor = SyncCursor::load(&store, "customers").await.unwrap();
        assert_eq!(cursor.last_remote_id, 25);
        assert!(cursor.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_fresh_roster_is_not_refetched() {
        let (store, api) = setup(5).await;
        let roster = CustomerRoster::new(store, api.clone(), 10, 3);
        roster.refresh(false).await.unwrap();
        api.clear_calls();

        let report = roster.refresh(false).await.unwrap();
        assert!(report.skipped);
        assert_eq!(api.call_count(Endpoint::Customers), 0);
    }

    #[tokio::test]
    async fn test_interrupted_refresh_resumes_after_last_page() {
        let (store, api) = setup(25).await;
        let roster = CustomerRoster::new(store.clone(), api.clone(), 10, 3);

        api.fail_next(Endpoint::Customers, RemoteError::Unreachable("x".into()));
        // First page fails; nothing is stored and the cursor stays put
        let report = roster.refresh(false).await.unwrap();
        assert!(report.error.is_some());
        assert_eq!(report.fetched, 0);

        let mut cursor = SyncCursor::load(&store, "customers").await.unwrap();
        cursor.last_remote_id = 10;
        cursor.last_page = 1;
        cursor.save(&store).await.unwrap();

        let report = roster.refresh(false).await.unwrap();
        assert!(report.completed);
        assert_eq!(report.fetched, 15);
    }

    #[tokio::test]
    async fn test_stale_roster_fetches_only_new_customers() {
        let (store, api) = setup(5).await;
        let roster = CustomerRoster::new(store.clone(), api.clone(), 10, 3);
        roster.refresh(false).await.unwrap();

        let mut cursor = SyncCursor::load(&store, "customers").await.unwrap();
        cursor.mark_synced(Utc::now() - Duration::hours(4));
        cursor.save(&store).await.unwrap();
        api.seed(
            Endpoint::Customers,
            (1..=7).map(|i| json!({"id": i.to_string()})).collect(),
        );

        let report = roster.refresh(false).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(roster.list().await.unwrap().len(), 7);
        assert!(roster.get(7).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_refresh_is_skipped_without_error() {
        let (store, api) = setup(5).await;
        api.set_reachable(false);
        let roster = CustomerRoster::new(store, api.clone(), 10, 3);
        let report = roster.refresh(false).await.unwrap();
        assert!(report.skipped);
        assert!(report.error.is_none());
        assert!(api.calls().is_empty());
    }
}
