// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline engine coordinator.
//!
//! The [`OfflineEngine`] ties together every component:
//! - local SQLite store and schema migrations
//! - cache-or-fetch resolver and staleness-aware catalog loader
//! - incremental customer roster
//! - dirty-record write path
//! - reconciliation engine
//!
//! All remote calls go through one [`GuardedApi`] circuit breaker.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Migrating → Ready → ShuttingDown
//! ```
//!
//! A migration failure is fatal: the engine never reaches `Ready`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{EngineConfig, EngineState, InMemoryCommerceApi, OfflineEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let api = Arc::new(InMemoryCommerceApi::new());
//! let mut engine = OfflineEngine::new(EngineConfig::default(), api);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("start failed");
//! assert!(engine.is_ready());
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use lifecycle::IN_MEMORY_PATH;
pub use types::{EngineError, EngineState};

use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::Resolver;
use crate::config::EngineConfig;
use crate::cursor::CustomerRoster;
use crate::reconcile::Reconciler;
use crate::records::LocalWriter;
use crate::remote::{CommerceApi, GuardedApi};
use crate::staleness::CatalogLoader;
use crate::storage::SqlStore;

/// Components that exist once the schema is ready.
pub(super) struct Services {
    pub(super) store: Arc<SqlStore>,
    pub(super) resolver: Arc<Resolver>,
    pub(super) catalog: CatalogLoader,
    pub(super) roster: Arc<CustomerRoster>,
    pub(super) writer: LocalWriter,
    pub(super) reconciler: Reconciler,
}

/// Offline-first cache and sync engine.
///
/// `Send + Sync`; share it behind an `Arc`. Reads may run concurrently;
/// reconciliation passes are single-flight.
pub struct OfflineEngine {
    pub(super) config: EngineConfig,

    /// Backend, behind the circuit breaker
    pub(super) api: Arc<GuardedApi>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) services: Option<Services>,
}

impl OfflineEngine {
    /// Create an engine in `Created` state. Call [`start()`](Self::start)
    /// to open the store and run migrations.
    pub fn new(config: EngineConfig, api: Arc<dyn CommerceApi>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let api = Arc::new(GuardedApi::new(api, config.circuit_config()));
        Self {
            config,
            api,
            state: state_tx,
            state_rx,
            services: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    fn services(&self) -> Result<&Services, EngineError> {
        match (&self.services, self.state()) {
            (Some(services), EngineState::Ready) => Ok(services),
            (_, state) => Err(EngineError::NotReady(state)),
        }
    }

    /// The local store, once started.
    pub fn store(&self) -> Result<&Arc<SqlStore>, EngineError> {
        Ok(&self.services()?.store)
    }
}
