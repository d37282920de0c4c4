//! # Offline Sync
//!
//! An offline-first local cache and synchronization engine for field-sales
//! clients that must keep working without connectivity.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      OfflineEngine                          │
//! │  • Created → Migrating → Ready → ShuttingDown               │
//! └─────────────────────────────────────────────────────────────┘
//!          │ reads                              │ writes
//!          ▼                                    ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │  CatalogLoader           │      │  LocalWriter             │
//! │  • staleness + reachable │      │  • dirty carts / orders  │
//! │  Resolver                │      │  • one tx per record     │
//! │  • cache-or-fetch        │      └──────────────────────────┘
//! │  • write-through         │                  │
//! │  CustomerRoster          │                  ▼
//! │  • paged, resumable      │      ┌──────────────────────────┐
//! └──────────────────────────┘      │  Reconciler              │
//!          │                        │  • carts before orders   │
//!          │                        │  • backoff, single-flight│
//!          ▼                        └──────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SQLite (SqlStore)                         │
//! │  • versioned migrations   • dirty ⇔ no remote id (CHECK)    │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲
//!          │  GuardedApi (circuit breaker) → CommerceApi
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{EngineConfig, InMemoryCommerceApi, OfflineEngine, ReferenceDomain};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         database_path: "./agent.db".into(),
//!         ..Default::default()
//!     };
//!     let api = Arc::new(InMemoryCommerceApi::new());
//!     let engine = OfflineEngine::open(config, api).await.expect("Failed to start");
//!
//!     // Served from cache when fresh or offline, refreshed otherwise
//!     let categories = engine.load_catalog(ReferenceDomain::Categories, None).await.unwrap();
//!     println!("{} categories from {}", categories.rows.len(), categories.source);
//!
//!     // Push whatever was created offline
//!     let report = engine.sync_now().await.unwrap();
//!     println!("{report}");
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`OfflineEngine`] facade
//! - [`storage`]: SQLite store, rows, transactions
//! - [`schema`]: versioned migrations
//! - [`cache`]: cache tables and the cache-or-fetch resolver
//! - [`staleness`]: max-age policy and the catalog loader
//! - [`cursor`]: sync cursors and the incremental customer roster
//! - [`records`]: local carts and orders, pricing
//! - [`reconcile`]: the push engine
//! - [`remote`]: backend trait, in-memory backend, breaker wrapper
//! - [`resilience`]: retry, backoff, circuit breaker

pub mod config;
pub mod storage;
pub mod schema;
pub mod resilience;
pub mod remote;
pub mod cache;
pub mod staleness;
pub mod cursor;
pub mod records;
pub mod reconcile;
pub mod coordinator;
pub mod metrics;

pub use config::{CartReusePolicy, EngineConfig};
pub use coordinator::{EngineError, EngineState, OfflineEngine, IN_MEMORY_PATH};
pub use storage::{Row, RowExt, SqlStore, StorageError, StoreTx};
pub use schema::{Migration, MigrationError, MigrationReport, SchemaInitializer};
pub use cache::{CacheEntry, CacheTable, ReferenceDomain, Resolution, ResolveError, Resolver, Source};
pub use staleness::{is_stale, CatalogLoad, CatalogLoader, StalenessPolicy};
pub use cursor::{CustomerRoster, RosterReport, SyncCursor};
pub use records::{
    Cart, CartItem, CartRef, LocalWriter, NewCart, NewOrder, Order, OrderTotals, PricedLine, SyncState, WriteError,
};
pub use reconcile::{PendingCounts, ReconcileError, Reconciler, SyncReport, SyncSession};
pub use remote::{CommerceApi, Endpoint, GuardedApi, InMemoryCommerceApi, RemoteError, RemoteResult};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::{BackoffPolicy, RetryConfig};
pub use metrics::LatencyTimer;
