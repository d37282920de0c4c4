// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit-breaker wrapper around any [`CommerceApi`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{CartPayload, CommerceApi, Endpoint, OrderPayload, RemoteError, RemoteResult};
use crate::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};

/// Routes every remote call through one shared [`CircuitBreaker`].
///
/// Open-circuit rejections surface as [`RemoteError::CircuitOpen`]. Only
/// network and 5xx failures count against the breaker; a 4xx rejection of one
/// bad record leaves it closed.
pub struct GuardedApi {
    inner: Arc<dyn CommerceApi>,
    breaker: CircuitBreaker,
}

impl GuardedApi {
    pub fn new(inner: Arc<dyn CommerceApi>, config: CircuitConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("commerce_api", config),
        }
    }

    async fn guard<F, Fut, T>(&self, endpoint: Endpoint, call: F) -> RemoteResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let result = self
            .breaker
            .call(RemoteError::counts_against_health, call)
            .await
            .map_err(|e| match e {
                CircuitError::Rejected => RemoteError::CircuitOpen,
                CircuitError::Inner(inner) => inner,
            });

        if let Err(e) = &result {
            debug!(endpoint = %endpoint, error = %e, "Remote call failed");
            metrics::record_remote_error(endpoint.as_str(), e.kind());
        }
        result
    }
}

#[async_trait]
impl CommerceApi for GuardedApi {
    async fn is_reachable(&self) -> bool {
        self.inner.is_reachable().await
    }

    async fn create_cart(&self, cart: &CartPayload) -> RemoteResult<i64> {
        self.guard(Endpoint::CreateCart, || self.inner.create_cart(cart)).await
    }

    async fn create_order(&self, order: &OrderPayload) -> RemoteResult<i64> {
        self.guard(Endpoint::CreateOrder, || self.inner.create_order(order)).await
    }

    async fn fetch_carriers(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Carriers, || self.inner.fetch_carriers(id_carrier)).await
    }

    async fn fetch_deliveries(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Deliveries, || self.inner.fetch_deliveries(id_carrier)).await
    }

    async fn fetch_categories(&self, id_parent: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Categories, || self.inner.fetch_categories(id_parent)).await
    }

    async fn fetch_products(&self, id_category: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Products, || self.inner.fetch_products(id_category)).await
    }

    async fn fetch_product_stock(&self, id_product: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::ProductStock, || self.inner.fetch_product_stock(id_product))
            .await
    }

    async fn fetch_customer(&self, id_customer: i64) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Customers, || self.inner.fetch_customer(id_customer)).await
    }

    async fn fetch_customers(&self, after_id: i64, page: u32, limit: u32) -> RemoteResult<Vec<Value>> {
        self.guard(Endpoint::Customers, || self.inner.fetch_customers(after_id, page, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryCommerceApi;
    use std::time::Duration;

    fn tight_config() -> CircuitConfig {
        CircuitConfig {
            window: 2,
            failure_rate: 0.5,
            half_open_probes: 1,
            open_wait: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_calls() {
        let backend = Arc::new(InMemoryCommerceApi::new());
        backend.set_reachable(false);
        let api = GuardedApi::new(backend.clone(), tight_config());

        let mut saw_open = false;
        for _ in 0..6 {
            if let Err(RemoteError::CircuitOpen) = api.fetch_carriers(None).await {
                saw_open = true;
            }
        }
        assert!(saw_open);
        // Rejected calls never reached the backend
        assert!(backend.call_count(Endpoint::Carriers) < 6);
    }

    #[tokio::test]
    async fn test_rejections_do_not_open_circuit() {
        let backend = Arc::new(InMemoryCommerceApi::new());
        let api = GuardedApi::new(backend.clone(), tight_config());

        for _ in 0..6 {
            backend.fail_next(Endpoint::Carriers, RemoteError::Rejected { message: "bad".into() });
            let err = api.fetch_carriers(None).await.unwrap_err();
            assert!(matches!(err, RemoteError::Rejected { .. }));
        }
        // Every call reached the backend
        assert_eq!(backend.call_count(Endpoint::Carriers), 6);
    }
}
