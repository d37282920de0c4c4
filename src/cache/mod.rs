// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local cache of read-mostly reference data.
//!
//! Every reference domain (carriers, delivery rates, categories, products,
//! stock levels, customers) has one cache table of identical shape:
//!
//! ```text
//! id INTEGER PRIMARY KEY | lookup INTEGER | payload TEXT | fetched_at TEXT
//! ```
//!
//! `payload` is the remote JSON verbatim, so a cached row reads back exactly
//! as the backend sent it. `lookup` is the secondary key keyed reads use
//! (the carrier of a delivery rate, the parent of a category, ...).
//!
//! [`CacheTable`] is the typed access layer; [`resolver::Resolver`] decides
//! between cache and backend.

pub mod resolver;

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::remote::Endpoint;
use crate::storage::{check_identifier, Row, RowExt, SqlStore, StorageError};

pub use resolver::{Resolution, ResolveError, Resolver, Source};

/// Reference data domains mirrored from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDomain {
    Carriers,
    Deliveries,
    Categories,
    Products,
    ProductStock,
    Customers,
}

impl ReferenceDomain {
    pub const ALL: [ReferenceDomain; 6] = [
        Self::Carriers,
        Self::Deliveries,
        Self::Categories,
        Self::Products,
        Self::ProductStock,
        Self::Customers,
    ];

    /// Cache table name; also the domain's label in logs and metrics.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Carriers => "carriers",
            Self::Deliveries => "deliveries",
            Self::Categories => "categories",
            Self::Products => "products",
            Self::ProductStock => "product_stock",
            Self::Customers => "customers",
        }
    }

    /// Payload field a lookup key refers to. `None` means the key is the
    /// row's own id.
    #[must_use]
    pub fn lookup_field(&self) -> Option<&'static str> {
        match self {
            Self::Carriers | Self::Customers => None,
            Self::Deliveries => Some("id_carrier"),
            Self::Categories => Some("id_parent"),
            Self::Products => Some("id_category_default"),
            Self::ProductStock => Some("id_product"),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Carriers => Endpoint::Carriers,
            Self::Deliveries => Endpoint::Deliveries,
            Self::Categories => Endpoint::Categories,
            Self::Products => Endpoint::Products,
            Self::ProductStock => Endpoint::ProductStock,
            Self::Customers => Endpoint::Customers,
        }
    }
}

impl std::fmt::Display for ReferenceDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// One cached value with its key and fetch time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: i64,
    pub lookup: Option<i64>,
    pub value: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(key: i64, value: T) -> Self {
        Self {
            key,
            lookup: None,
            value,
            fetched_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_lookup(mut self, lookup: Option<i64>) -> Self {
        self.lookup = lookup;
        self
    }
}

/// Typed view over one cache table.
pub struct CacheTable<T> {
    store: Arc<SqlStore>,
    table: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for CacheTable<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            table: self.table,
            _value: PhantomData,
        }
    }
}

impl<T> CacheTable<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<SqlStore>, table: &'static str) -> Result<Self, StorageError> {
        check_identifier(table)?;
        Ok(Self {
            store,
            table,
            _value: PhantomData,
        })
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        self.table
    }

    pub async fn get(&self, key: i64) -> Result<Option<CacheEntry<T>>, StorageError> {
        let rows = self.store.query_rows(self.table, Some("id = ?"), &[json!(key)]).await?;
        rows.first().map(decode_entry).transpose()
    }

    /// Entries whose `column` equals `value`, in id order.
    pub async fn find_by(&self, column: &str, value: i64) -> Result<Vec<CacheEntry<T>>, StorageError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? ORDER BY id",
            self.table,
            check_identifier(column)?
        );
        let rows = self.store.query_sql(&sql, &[json!(value)]).await?;
        rows.iter().map(decode_entry).collect()
    }

    pub async fn all(&self) -> Result<Vec<CacheEntry<T>>, StorageError> {
        let sql = format!("SELECT * FROM {} ORDER BY id", self.table);
        let rows = self.store.query_sql(&sql, &[]).await?;
        rows.iter().map(decode_entry).collect()
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        let rows = self
            .store
            .query_sql(&format!("SELECT COUNT(*) AS n FROM {}", self.table), &[])
            .await?;
        let n = rows.first().map(|r| r.i64_col("n")).transpose()?.unwrap_or(0);
        Ok(n.max(0) as usize)
    }

    /// Insert or replace one entry.
    pub async fn put(&self, entry: &CacheEntry<T>) -> Result<(), StorageError> {
        let row = encode_entry(entry)?;
        self.store.upsert_row(self.table, &row, "id").await
    }

    /// Insert or replace a batch in one transaction.
    pub async fn put_many(&self, entries: &[CacheEntry<T>]) -> Result<usize, StorageError> {
        let rows = entries.iter().map(encode_entry).collect::<Result<Vec<_>, _>>()?;
        let table = self.table;
        self.store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    for row in &rows {
                        tx.upsert_row(table, row, "id").await?;
                    }
                    Ok(rows.len())
                })
            })
            .await
    }

    pub async fn clear(&self) -> Result<u64, StorageError> {
        self.store.clear_tables(&[self.table]).await
    }
}

pub(crate) fn encode_entry<T: Serialize>(entry: &CacheEntry<T>) -> Result<Row, StorageError> {
    let payload = serde_json::to_string(&entry.value).map_err(|e| StorageError::Decode {
        column: "payload".into(),
        reason: e.to_string(),
    })?;
    let mut row = Row::new();
    row.insert("id".into(), json!(entry.key));
    row.insert("lookup".into(), entry.lookup.map_or(Value::Null, Value::from));
    row.insert("payload".into(), Value::String(payload));
    row.insert("fetched_at".into(), Value::String(entry.fetched_at.to_rfc3339()));
    Ok(row)
}

fn decode_entry<T: DeserializeOwned>(row: &Row) -> Result<CacheEntry<T>, StorageError> {
    let payload = row.str_col("payload")?;
    let value = serde_json::from_str(&payload).map_err(|e| StorageError::Decode {
        column: "payload".into(),
        reason: e.to_string(),
    })?;
    let fetched_at = row.str_col("fetched_at")?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
        .map_err(|e| StorageError::Decode {
            column: "fetched_at".into(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);
    Ok(CacheEntry {
        key: row.i64_col("id")?,
        lookup: row.opt_i64_col("lookup")?,
        value,
        fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Migration, SchemaInitializer};

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    struct Carrier {
        name: String,
        delay: String,
    }

    async fn store() -> Arc<SqlStore> {
        let store = SqlStore::in_memory().await.unwrap();
        SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
        Arc::new(store)
    }

    fn carrier(name: &str) -> Carrier {
        Carrier {
            name: name.into(),
            delay: "24h".into(),
        }
    }

    #[tokio::test]
    async fn test_put_get_typed_entry() {
        let table: CacheTable<Carrier> = CacheTable::new(store().await, "carriers").unwrap();
        let entry = CacheEntry::new(2, carrier("DHL"));
        table.put(&entry).await.unwrap();

        let got = table.get(2).await.unwrap().unwrap();
        assert_eq!(got.value, carrier("DHL"));
        assert_eq!(got.key, 2);
        assert!(table.get(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_whole_entry() {
        let table: CacheTable<Carrier> = CacheTable::new(store().await, "carriers").unwrap();
        table.put(&CacheEntry::new(2, carrier("DHL")).with_lookup(Some(1))).await.unwrap();
        table.put(&CacheEntry::new(2, carrier("UPS"))).await.unwrap();

        assert_eq!(table.count().await.unwrap(), 1);
        let got = table.get(2).await.unwrap().unwrap();
        assert_eq!(got.value.name, "UPS");
        assert_eq!(got.lookup, None);
    }

    #[tokio::test]
    async fn test_put_many_and_find_by_lookup() {
        let table: CacheTable<Value> = CacheTable::new(store().await, "categories").unwrap();
        let entries = vec![
            CacheEntry::new(3, json!({"id": "3", "name": "Wine"})).with_lookup(Some(2)),
            CacheEntry::new(4, json!({"id": "4", "name": "Beer"})).with_lookup(Some(2)),
            CacheEntry::new(9, json!({"id": "9", "name": "Food"})).with_lookup(Some(1)),
        ];
        assert_eq!(table.put_many(&entries).await.unwrap(), 3);

        let children = table.find_by("lookup", 2).await.unwrap();
        let names: Vec<_> = children.iter().map(|e| e.value["name"].clone()).collect();
        assert_eq!(names, vec![json!("Wine"), json!("Beer")]);
        assert_eq!(table.all().await.unwrap().len(), 3);

        table.clear().await.unwrap();
        assert_eq!(table.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_table_name() {
        let result: Result<CacheTable<Value>, _> = CacheTable::new(store().await, "x; --");
        assert!(matches!(result, Err(StorageError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_domain_tables_are_distinct() {
        let mut tables: Vec<_> = ReferenceDomain::ALL.iter().map(|d| d.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), ReferenceDomain::ALL.len());
    }
}
