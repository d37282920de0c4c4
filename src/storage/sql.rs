// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed local relational store.
//!
//! Thin access layer over a `sqlx` pool:
//! - **Reads** (`query_rows`) run on any pooled connection and may overlap.
//! - **Writes** (`upsert_row`, `insert_row`, `execute`, transactions) are
//!   serialized through one owned mutex, so at most one write transaction is
//!   open against the database at any time.
//!
//! ```text
//! caller ──► query_rows ──────────────► pool (N readers)
//! caller ──► begin() ─► writer lock ─► BEGIN … COMMIT
//! ```
//!
//! Rows are exchanged as JSON maps (see [`Row`]); integer, real, text and
//! NULL columns round-trip as the matching JSON scalars.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Executor, Row as _, Transaction, TypeInfo, ValueRef};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::row::{check_identifier, Row, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Reference-cache tables plus the cursors that describe their freshness.
pub const CACHE_TABLES: &[&str] = &[
    "carriers",
    "deliveries",
    "categories",
    "products",
    "product_stock",
    "customers",
    "sync_cursors",
];

/// Locally authored records, children before parents.
pub const RECORD_TABLES: &[&str] = &["orders", "cart_items", "carts"];

/// Future returned by the closure given to [`SqlStore::run_in_transaction`].
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 't>>;

fn backend(context: &str, err: sqlx::Error) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, err))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        // Nested structures are stored as their JSON text
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let name = column.name();
        let decode_err = |e: sqlx::Error| StorageError::Decode {
            column: name.to_string(),
            reason: e.to_string(),
        };

        let type_name = {
            let raw = row.try_get_raw(idx).map_err(decode_err)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_ascii_uppercase())
            }
        };

        let value = match type_name.as_deref() {
            None => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::from(row.try_get::<i64, _>(idx).map_err(decode_err)?),
            Some("REAL") => {
                let f = row.try_get::<f64, _>(idx).map_err(decode_err)?;
                serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
            }
            Some("BLOB") => {
                let bytes = row.try_get::<Vec<u8>, _>(idx).map_err(decode_err)?;
                Value::Array(bytes.into_iter().map(Value::from).collect())
            }
            Some(_) => Value::String(row.try_get::<String, _>(idx).map_err(decode_err)?),
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

fn select_sql(table: &str, predicate: Option<&str>) -> Result<String, StorageError> {
    let table = check_identifier(table)?;
    Ok(match predicate {
        Some(p) => format!("SELECT * FROM {} WHERE {}", table, p),
        None => format!("SELECT * FROM {}", table),
    })
}

fn write_sql(verb: &str, table: &str, fields: &Row) -> Result<(String, Vec<Value>), StorageError> {
    let table = check_identifier(table)?;
    if fields.is_empty() {
        return Err(StorageError::Backend(format!("{} into '{}' with no columns", verb, table)));
    }
    let mut columns = Vec::with_capacity(fields.len());
    let mut values = Vec::with_capacity(fields.len());
    for (column, value) in fields {
        columns.push(check_identifier(column)?);
        values.push(value.clone());
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        table,
        columns.join(", "),
        placeholders
    );
    Ok((sql, values))
}

fn upsert_sql(table: &str, fields: &Row, unique_key: &str) -> Result<(String, Vec<Value>), StorageError> {
    if !fields.contains_key(unique_key) {
        return Err(StorageError::MissingKey {
            table: table.to_string(),
            key: unique_key.to_string(),
        });
    }
    // Whole-row replacement: columns absent from `fields` fall back to their defaults
    write_sql("INSERT OR REPLACE", table, fields)
}

async fn fetch_rows<'e, E>(executor: E, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_value(query, param);
    }
    let rows = query
        .fetch_all(executor)
        .await
        .map_err(|e| backend("query failed", e))?;
    rows.iter().map(decode_row).collect()
}

async fn execute_sql<'e, E>(executor: E, sql: &str, params: &[Value]) -> Result<u64, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_value(query, param);
    }
    let result = query
        .execute(executor)
        .await
        .map_err(|e| backend("statement failed", e))?;
    Ok(result.rows_affected())
}

/// Local SQLite store shared by every engine component.
pub struct SqlStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    location: String,
}

impl SqlStore {
    /// Open (creating if missing) the database file at `path`.
    ///
    /// Uses startup-mode retry so a locked or briefly unavailable file does
    /// not abort the app on the first attempt.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let location = path.to_string_lossy().to_string();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Backend(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        info!(path = %location, max_connections, "Opening local store");

        let pool = retry("sqlite_open", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(|e| backend("open failed", e))
            }
        })
        .await?;

        Ok(Self::from_pool(pool, location))
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| backend("bad in-memory url", e))?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| backend("open failed", e))?;

        Ok(Self::from_pool(pool, ":memory:".to_string()))
    }

    fn from_pool(pool: SqlitePool, location: String) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            location,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Where the database lives (file path or `:memory:`).
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Read all rows of `table` matching `predicate`.
    ///
    /// `predicate` is a trusted SQL boolean expression using `?` placeholders;
    /// values always travel through `params`.
    pub async fn query_rows(
        &self,
        table: &str,
        predicate: Option<&str>,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError> {
        let sql = select_sql(table, predicate)?;
        fetch_rows(&self.pool, &sql, params).await
    }

    /// Run an arbitrary read query (joins, aggregates).
    pub async fn query_sql(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        fetch_rows(&self.pool, sql, params).await
    }

    /// Insert or replace one row keyed by `unique_key`. Last writer wins.
    pub async fn upsert_row(&self, table: &str, fields: &Row, unique_key: &str) -> Result<(), StorageError> {
        let (sql, values) = upsert_sql(table, fields, unique_key)?;
        let _writer = self.writer.lock().await;
        execute_sql(&self.pool, &sql, &values).await?;
        Ok(())
    }

    /// Plain insert; fails on key conflicts.
    pub async fn insert_row(&self, table: &str, fields: &Row) -> Result<(), StorageError> {
        let (sql, values) = write_sql("INSERT", table, fields)?;
        let _writer = self.writer.lock().await;
        execute_sql(&self.pool, &sql, &values).await?;
        Ok(())
    }

    /// Execute one write statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StorageError> {
        let _writer = self.writer.lock().await;
        execute_sql(&self.pool, sql, params).await
    }

    /// Open a write transaction. Blocks until no other writer is active.
    pub async fn begin(&self) -> Result<StoreTx, StorageError> {
        let guard = self.writer.clone().lock_owned().await;
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("begin failed", e))?;
        Ok(StoreTx { tx, _writer: guard })
    }

    /// Run `work` inside one transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// ```rust,ignore
    /// store.run_in_transaction(move |tx| Box::pin(async move {
    ///     tx.insert_row("carts", &cart).await?;
    ///     for item in &items {
    ///         tx.insert_row("cart_items", item).await?;
    ///     }
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        F: for<'t> FnOnce(&'t mut StoreTx) -> TxFuture<'t, T>,
    {
        let mut tx = self.begin().await?;
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Transaction work failed, rolling back");
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Delete every row of the given tables in one transaction.
    pub async fn clear_tables(&self, tables: &[&str]) -> Result<u64, StorageError> {
        let mut tx = self.begin().await?;
        let mut removed = 0;
        for table in tables {
            let table = check_identifier(table)?;
            removed += tx.execute(&format!("DELETE FROM {}", table), &[]).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Logout wipe: drop every cached reference row and sync cursor.
    ///
    /// Carts and orders survive so unsynced work is never lost.
    pub async fn wipe_cache(&self) -> Result<u64, StorageError> {
        let removed = self.clear_tables(CACHE_TABLES).await?;
        info!(removed, "Reference cache wiped");
        Ok(removed)
    }

    /// Wipe the cache and every local cart and order.
    pub async fn wipe_all(&self) -> Result<u64, StorageError> {
        let mut tables: Vec<&str> = RECORD_TABLES.to_vec();
        tables.extend_from_slice(CACHE_TABLES);
        let removed = self.clear_tables(&tables).await?;
        warn!(removed, "Local store wiped including unsynced records");
        Ok(removed)
    }

    /// Close the pool; later calls fail with a backend error.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open write transaction holding the store's writer lock.
///
/// Dropping it without [`commit`](Self::commit) rolls everything back.
pub struct StoreTx {
    // Field order matters: the transaction is dropped (rolled back) before the lock is released
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

impl StoreTx {
    pub async fn query_rows(
        &mut self,
        table: &str,
        predicate: Option<&str>,
        params: &[Value],
    ) -> Result<Vec<Row>, StorageError> {
        let sql = select_sql(table, predicate)?;
        fetch_rows(&mut *self.tx, &sql, params).await
    }

    pub async fn query_sql(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        fetch_rows(&mut *self.tx, sql, params).await
    }

    pub async fn upsert_row(&mut self, table: &str, fields: &Row, unique_key: &str) -> Result<(), StorageError> {
        let (sql, values) = upsert_sql(table, fields, unique_key)?;
        execute_sql(&mut *self.tx, &sql, &values).await?;
        Ok(())
    }

    pub async fn insert_row(&mut self, table: &str, fields: &Row) -> Result<(), StorageError> {
        let (sql, values) = write_sql("INSERT", table, fields)?;
        execute_sql(&mut *self.tx, &sql, &values).await?;
        Ok(())
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StorageError> {
        execute_sql(&mut *self.tx, sql, params).await
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(|e| backend("commit failed", e))
    }

    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Migration, SchemaInitializer};
    use crate::storage::RowExt;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn migrated_store() -> SqlStore {
        let store = SqlStore::in_memory().await.unwrap();
        SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
        store
    }

    fn cart_row(local_id: &str) -> Row {
        row(json!({
            "local_id": local_id,
            "id_currency": 1, "id_lang": 1, "id_customer": 9,
            "id_address_delivery": 4, "id_address_invoice": 4,
            "created_at": "2026-01-01T00:00:00Z"
        }))
    }

    fn item_row(cart: &str, product: i64, quantity: i64) -> Row {
        row(json!({
            "cart_local_id": cart, "id_product": product,
            "id_product_attribute": 0, "quantity": quantity, "id_address_delivery": 4
        }))
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_one_row_with_last_values() {
        let store = migrated_store().await;
        let first = row(json!({"id": 3, "lookup": null, "payload": "{\"name\":\"old\"}", "fetched_at": "t1"}));
        let second = row(json!({"id": 3, "lookup": null, "payload": "{\"name\":\"new\"}", "fetched_at": "t2"}));

        store.upsert_row("carriers", &first, "id").await.unwrap();
        store.upsert_row("carriers", &second, "id").await.unwrap();

        let rows = store.query_rows("carriers", Some("id = ?"), &[json!(3)]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].str_col("payload").unwrap(), "{\"name\":\"new\"}");
        assert_eq!(rows[0].str_col("fetched_at").unwrap(), "t2");
    }

    #[tokio::test]
    async fn test_upsert_requires_unique_key_field() {
        let store = migrated_store().await;
        let fields = row(json!({"payload": "{}", "fetched_at": "t"}));
        let err = store.upsert_row("carriers", &fields, "id").await.unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_identifiers() {
        let store = migrated_store().await;
        let err = store.query_rows("carriers; DROP TABLE carts", None, &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));

        let fields = row(json!({"id": 1, "payload) VALUES (1); --": "x"}));
        let err = store.upsert_row("carriers", &fields, "id").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_value_types_round_trip() {
        let store = migrated_store().await;
        store.execute("CREATE TABLE typed (id INTEGER PRIMARY KEY, r REAL, t TEXT, n TEXT, b INTEGER)", &[])
            .await
            .unwrap();
        let fields = row(json!({"id": 1, "r": 2.5, "t": "hello", "n": null, "b": true}));
        store.insert_row("typed", &fields).await.unwrap();

        let rows = store.query_rows("typed", None, &[]).await.unwrap();
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["r"], json!(2.5));
        assert_eq!(rows[0]["t"], json!("hello"));
        assert_eq!(rows[0]["n"], Value::Null);
        assert_eq!(rows[0]["b"], json!(1));
    }

    #[tokio::test]
    async fn test_cart_with_items_is_all_or_nothing() {
        let store = migrated_store().await;

        // Third item violates the quantity check after the cart row is written
        let result = store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_row("carts", &cart_row("local-a")).await?;
                    tx.insert_row("cart_items", &item_row("local-a", 1, 2)).await?;
                    tx.insert_row("cart_items", &item_row("local-a", 2, 1)).await?;
                    tx.insert_row("cart_items", &item_row("local-a", 3, 0)).await?;
                    Ok(())
                })
            })
            .await;

        assert!(result.is_err());
        assert!(store.query_rows("carts", None, &[]).await.unwrap().is_empty());
        assert!(store.query_rows("cart_items", None, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_in_transaction_commits_on_success() {
        let store = migrated_store().await;
        let count = store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_row("carts", &cart_row("local-b")).await?;
                    for product in 1..=3 {
                        tx.insert_row("cart_items", &item_row("local-b", product, 1)).await?;
                    }
                    let rows = tx.query_rows("cart_items", Some("cart_local_id = ?"), &[json!("local-b")]).await?;
                    Ok(rows.len())
                })
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(store.query_rows("cart_items", None, &[]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = migrated_store().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_row("carts", &cart_row("local-c")).await.unwrap();
        }
        assert!(store.query_rows("carts", None, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dirty_invariant_enforced_by_schema() {
        let store = migrated_store().await;
        let mut clean_without_id = cart_row("local-d");
        clean_without_id.insert("dirty".into(), json!(0));
        clean_without_id.insert("sync_state".into(), json!("synced"));
        assert!(store.insert_row("carts", &clean_without_id).await.is_err());

        let mut dirty_with_id = cart_row("local-e");
        dirty_with_id.insert("remote_id".into(), json!(55));
        assert!(store.insert_row("carts", &dirty_with_id).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("local.db");
        {
            let store = SqlStore::open(&path, 2).await.unwrap();
            SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
            store.insert_row("carts", &cart_row("local-f")).await.unwrap();
            store.close().await;
        }
        let store = SqlStore::open(&path, 2).await.unwrap();
        let rows = store.query_rows("carts", Some("local_id = ?"), &[json!("local-f")]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(store.location().ends_with("local.db"));
    }

    #[tokio::test]
    async fn test_clear_tables() {
        let store = migrated_store().await;
        let fields = row(json!({"id": 1, "payload": "{}", "fetched_at": "t"}));
        store.upsert_row("carriers", &fields, "id").await.unwrap();
        store.upsert_row("products", &fields, "id").await.unwrap();

        let removed = store.clear_tables(&["carriers", "products"]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.query_rows("carriers", None, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wipe_cache_keeps_local_records() {
        let store = migrated_store().await;
        let fields = row(json!({"id": 1, "payload": "{}", "fetched_at": "t"}));
        store.upsert_row("categories", &fields, "id").await.unwrap();
        store.insert_row("carts", &cart_row("local-g")).await.unwrap();

        store.wipe_cache().await.unwrap();
        assert!(store.query_rows("categories", None, &[]).await.unwrap().is_empty());
        assert_eq!(store.query_rows("carts", None, &[]).await.unwrap().len(), 1);

        store.wipe_all().await.unwrap();
        assert!(store.query_rows("carts", None, &[]).await.unwrap().is_empty());
    }
}
