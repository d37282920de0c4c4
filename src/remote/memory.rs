// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scriptable in-memory commerce backend.
//!
//! Behaves like a small backend: assigns ids to created carts and orders and
//! serves seeded reference rows. Tests drive failure paths through a
//! reachability switch and per-endpoint failure queues, and inspect the call
//! log afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::{CartPayload, CommerceApi, Endpoint, OrderPayload, RemoteError, RemoteResult};
use crate::cache::resolver::coerce_remote_shape;
use crate::storage::json_id;

/// Remote ids start here so they never look like small local counters.
const FIRST_REMOTE_ID: i64 = 1000;

pub struct InMemoryCommerceApi {
    reachable: AtomicBool,
    latency: Mutex<Duration>,
    next_id: AtomicI64,
    reference: DashMap<Endpoint, Vec<Value>>,
    failures: DashMap<Endpoint, VecDeque<RemoteError>>,
    carts: Mutex<Vec<(i64, CartPayload)>>,
    orders: Mutex<Vec<(i64, OrderPayload)>>,
    calls: Mutex<Vec<Endpoint>>,
}

impl Default for InMemoryCommerceApi {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommerceApi {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicI64::new(FIRST_REMOTE_ID),
            reference: DashMap::new(),
            failures: DashMap::new(),
            carts: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Toggle connectivity. While unreachable every call fails with
    /// [`RemoteError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Artificial delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Replace the rows served by a fetch endpoint.
    ///
    /// Integer id fields are served as strings, like the real backend does.
    pub fn seed(&self, endpoint: Endpoint, mut rows: Vec<Value>) {
        for row in &mut rows {
            if let Value::Object(fields) = row {
                coerce_remote_shape(fields);
            }
        }
        self.reference.insert(endpoint, rows);
    }

    /// Queue an error; the next call to `endpoint` returns it instead of
    /// succeeding. Queued errors are consumed in order.
    pub fn fail_next(&self, endpoint: Endpoint, error: RemoteError) {
        self.failures.entry(endpoint).or_default().push_back(error);
    }

    /// Every endpoint called so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<Endpoint> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self, endpoint: Endpoint) -> usize {
        self.calls.lock().iter().filter(|e| **e == endpoint).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Carts created so far with their assigned ids.
    #[must_use]
    pub fn created_carts(&self) -> Vec<(i64, CartPayload)> {
        self.carts.lock().clone()
    }

    /// Orders created so far with their assigned ids.
    #[must_use]
    pub fn created_orders(&self) -> Vec<(i64, OrderPayload)> {
        self.orders.lock().clone()
    }

    async fn enter(&self, endpoint: Endpoint) -> RemoteResult<()> {
        self.calls.lock().push(endpoint);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("network unreachable".into()));
        }
        if let Some(mut queue) = self.failures.get_mut(&endpoint) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn rows(&self, endpoint: Endpoint, filter: Option<(&str, i64)>) -> Vec<Value> {
        let rows = self
            .reference
            .get(&endpoint)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        match filter {
            None => rows,
            Some((field, key)) => rows
                .into_iter()
                .filter(|row| json_id(row, field) == Some(key))
                .collect(),
        }
    }

    async fn fetch(&self, endpoint: Endpoint, filter: Option<(&str, i64)>) -> RemoteResult<Vec<Value>> {
        self.enter(endpoint).await?;
        Ok(self.rows(endpoint, filter))
    }
}

#[async_trait]
impl CommerceApi for InMemoryCommerceApi {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn create_cart(&self, cart: &CartPayload) -> RemoteResult<i64> {
        self.enter(Endpoint::CreateCart).await?;
        if cart.items.is_empty() {
            return Err(RemoteError::Rejected {
                message: "cart has no products".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.carts.lock().push((id, cart.clone()));
        Ok(id)
    }

    async fn create_order(&self, order: &OrderPayload) -> RemoteResult<i64> {
        self.enter(Endpoint::CreateOrder).await?;
        let cart_known = self.carts.lock().iter().any(|(id, _)| *id == order.id_cart);
        if !cart_known {
            return Err(RemoteError::Rejected {
                message: format!("unknown cart {}", order.id_cart),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.orders.lock().push((id, order.clone()));
        Ok(id)
    }

    async fn fetch_carriers(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::Carriers, id_carrier.map(|k| ("id", k))).await
    }

    async fn fetch_deliveries(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::Deliveries, id_carrier.map(|k| ("id_carrier", k))).await
    }

    async fn fetch_categories(&self, id_parent: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::Categories, id_parent.map(|k| ("id_parent", k))).await
    }

    async fn fetch_products(&self, id_category: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::Products, id_category.map(|k| ("id_category_default", k)))
            .await
    }

    async fn fetch_product_stock(&self, id_product: Option<i64>) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::ProductStock, id_product.map(|k| ("id_product", k)))
            .await
    }

    async fn fetch_customer(&self, id_customer: i64) -> RemoteResult<Vec<Value>> {
        self.fetch(Endpoint::Customers, Some(("id", id_customer))).await
    }

    async fn fetch_customers(&self, after_id: i64, _page: u32, limit: u32) -> RemoteResult<Vec<Value>> {
        self.enter(Endpoint::Customers).await?;
        let mut rows: Vec<(i64, Value)> = self
            .rows(Endpoint::Customers, None)
            .into_iter()
            .filter_map(|row| json_id(&row, "id").map(|id| (id, row)))
            .filter(|(id, _)| *id > after_id)
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        if limit > 0 {
            rows.truncate(limit as usize);
        }
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }
}
