//! Engine lifecycle: startup (store + migrations) and shutdown.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::cache::Resolver;
use crate::config::EngineConfig;
use crate::cursor::CustomerRoster;
use crate::reconcile::Reconciler;
use crate::records::LocalWriter;
use crate::remote::CommerceApi;
use crate::schema::{Migration, SchemaInitializer};
use crate::staleness::{CatalogLoader, StalenessPolicy};
use crate::storage::SqlStore;

use super::{EngineError, EngineState, OfflineEngine, Services};

/// `database_path` value that selects a private in-memory store.
pub const IN_MEMORY_PATH: &str = ":memory:";

impl OfflineEngine {
    /// Create and start an engine with the built-in migrations.
    pub async fn open(config: EngineConfig, api: Arc<dyn CommerceApi>) -> Result<Self, EngineError> {
        let mut engine = Self::new(config, api);
        engine.start().await?;
        Ok(engine)
    }

    /// Open the configured store and bring the schema up to date.
    ///
    /// Startup flow:
    /// 1. Open SQLite (retried, WAL journal)
    /// 2. Apply pending migrations; any failure is fatal
    /// 3. Wire up resolver, loader, writer, reconciler
    /// 4. Ready
    #[tracing::instrument(skip(self), fields(path = %self.config.database_path))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.state() != EngineState::Created {
            return Err(EngineError::NotReady(self.state()));
        }
        let store = if self.config.database_path == IN_MEMORY_PATH {
            SqlStore::in_memory().await?
        } else {
            SqlStore::open(&self.config.database_path, self.config.max_connections).await?
        };
        self.start_with(store, &Migration::builtin()).await
    }

    /// Start on an already-open store with an explicit migration list.
    pub async fn start_with(&mut self, store: SqlStore, migrations: &[Migration]) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(EngineError::NotReady(state));
        }
        let started = Instant::now();

        self.set_state(EngineState::Migrating);
        match SchemaInitializer::run(&store, migrations).await {
            Ok(report) => info!(
                applied = report.applied.len(),
                skipped = report.skipped,
                "Schema up to date"
            ),
            Err(e) => {
                error!(error = %e, "Migration failed, engine will not start");
                store.close().await;
                self.set_state(EngineState::ShuttingDown);
                return Err(e.into());
            }
        }

        let store = Arc::new(store);
        let api: Arc<dyn CommerceApi> = self.api.clone();
        let resolver = Arc::new(Resolver::new(store.clone(), api.clone()));
        let roster = Arc::new(CustomerRoster::new(
            store.clone(),
            api.clone(),
            self.config.customer_page_size,
            self.config.customer_max_age_hours,
        ));
        let catalog = CatalogLoader::new(
            store.clone(),
            api.clone(),
            resolver.clone(),
            roster.clone(),
            StalenessPolicy::from_config(&self.config),
        );
        let writer = LocalWriter::new(store.clone(), self.config.cart_reuse);
        let reconciler = Reconciler::new(store.clone(), api, self.config.backoff_policy());

        self.services = Some(Services {
            store,
            resolver,
            catalog,
            roster,
            writer,
            reconciler,
        });
        self.set_state(EngineState::Ready);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Offline engine ready");
        Ok(())
    }

    /// Close the store. Further calls fail with `NotReady`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down offline engine");
        self.set_state(EngineState::ShuttingDown);
        if let Some(services) = &self.services {
            services.store.close().await;
        }
        info!("Offline engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryCommerceApi;

    fn engine() -> OfflineEngine {
        let config = EngineConfig {
            database_path: IN_MEMORY_PATH.into(),
            ..EngineConfig::default()
        };
        OfflineEngine::new(config, Arc::new(InMemoryCommerceApi::new()))
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let mut engine = engine();
        let mut rx = engine.state_receiver();
        assert_eq!(engine.state(), EngineState::Created);

        engine.start().await.unwrap();
        assert!(engine.is_ready());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_calls_before_start_are_rejected() {
        let engine = engine();
        assert!(matches!(engine.store(), Err(EngineError::NotReady(EngineState::Created))));
    }

    #[tokio::test]
    async fn test_bad_migration_is_fatal() {
        let mut engine = engine();
        let store = SqlStore::in_memory().await.unwrap();
        let mut migrations = Migration::builtin();
        migrations.push(Migration::new("0004_broken", "CREATE TABLE ("));

        let err = engine.start_with(store, &migrations).await.unwrap_err();
        assert!(matches!(err, EngineError::Migration(_)));
        assert!(!engine.is_ready());
        assert_eq!(engine.state(), EngineState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_stops_service() {
        let mut engine = engine();
        engine.start().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
        assert!(engine.pending_counts().await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut engine = engine();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        assert!(engine.is_ready());
    }
}
