//! Public operations of the offline engine.
//!
//! Every method fails with [`EngineError::NotReady`] outside the `Ready`
//! state. Read paths degrade to cached data; write paths return structured
//! errors and never commit partially.

use serde_json::Value;

use crate::cache::{ReferenceDomain, Resolution};
use crate::cursor::RosterReport;
use crate::reconcile::{PendingCounts, SyncReport};
use crate::records::{order_totals, Cart, NewCart, NewOrder, Order, OrderTotals, PricedLine};
use crate::staleness::CatalogLoad;

use super::{EngineError, OfflineEngine};

impl OfflineEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // Reference data
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cache-or-fetch lookup, ignoring staleness.
    pub async fn resolve(&self, domain: ReferenceDomain, key: Option<i64>) -> Result<Resolution, EngineError> {
        Ok(self.services()?.resolver.resolve(domain, key).await)
    }

    /// Staleness-aware read: refreshes when stale and reachable, otherwise
    /// serves the cache.
    pub async fn load_catalog(&self, domain: ReferenceDomain, key: Option<i64>) -> Result<CatalogLoad, EngineError> {
        Ok(self.services()?.catalog.load(domain, key).await?)
    }

    /// Page through new customers. `force` re-downloads the whole roster.
    pub async fn refresh_customers(&self, force: bool) -> Result<RosterReport, EngineError> {
        Ok(self.services()?.roster.refresh(force).await?)
    }

    pub async fn customer(&self, id_customer: i64) -> Result<Option<Value>, EngineError> {
        Ok(self.services()?.roster.get(id_customer).await?)
    }

    pub async fn customers(&self) -> Result<Vec<Value>, EngineError> {
        Ok(self.services()?.roster.list().await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Local writes
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn create_cart_locally(&self, cart: NewCart) -> Result<String, EngineError> {
        Ok(self.services()?.writer.create_cart_locally(cart).await?)
    }

    pub async fn create_order_locally(&self, order: NewOrder) -> Result<String, EngineError> {
        Ok(self.services()?.writer.create_order_locally(order).await?)
    }

    /// Cart for a new order of `id_customer`, per the configured reuse policy.
    pub async fn cart_for_order(&self, id_customer: i64, cart: NewCart) -> Result<String, EngineError> {
        Ok(self.services()?.writer.cart_for_order(id_customer, cart).await?)
    }

    pub async fn cart(&self, local_id: &str) -> Result<Option<Cart>, EngineError> {
        Ok(self.services()?.writer.cart(local_id).await?)
    }

    pub async fn order(&self, local_id: &str) -> Result<Option<Order>, EngineError> {
        Ok(self.services()?.writer.order(local_id).await?)
    }

    /// Order totals with the configured tax multiplier.
    #[must_use]
    pub fn order_totals(&self, lines: &[PricedLine], shipping: f64) -> OrderTotals {
        order_totals(lines, self.config.tax_multiplier, shipping)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reconciliation
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn pending_counts(&self) -> Result<PendingCounts, EngineError> {
        Ok(self.services()?.reconciler.pending_counts().await?)
    }

    /// Run one reconciliation pass now.
    pub async fn sync_now(&self) -> Result<SyncReport, EngineError> {
        Ok(self.services()?.reconciler.reconcile().await?)
    }

    /// Re-queue permanently failed records.
    pub async fn retry_failed(&self) -> Result<u64, EngineError> {
        Ok(self.services()?.reconciler.retry_failed().await?)
    }

    /// Drop all cached reference data and sync cursors. Local carts and
    /// orders are kept so nothing unsynced is lost.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) -> Result<u64, EngineError> {
        let removed = self.services()?.store.wipe_cache().await?;
        tracing::info!(removed, "Reference cache wiped");
        Ok(removed)
    }
}
