// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote commerce backend, as seen by the engine.
//!
//! The HTTP client itself lives in the embedding app; the engine only needs
//! the [`CommerceApi`] trait. Implementations are expected to enforce their
//! own request timeout and report it as [`RemoteError::Timeout`].
//!
//! - [`memory::InMemoryCommerceApi`]: scriptable backend for tests and demos
//! - [`guarded::GuardedApi`]: circuit breaker wrapper used by the engine

pub mod guarded;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use guarded::GuardedApi;
pub use memory::InMemoryCommerceApi;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("Remote rejected request: {message}")]
    Rejected { message: String },
    #[error("Malformed remote response: {0}")]
    Decode(String),
    #[error("Remote circuit open, call not attempted")]
    CircuitOpen,
}

impl RemoteError {
    /// Whether retrying later may succeed without changing the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) | Self::CircuitOpen => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Rejected { .. } | Self::Decode(_) => false,
        }
    }

    /// Whether the failure says something about backend health.
    #[must_use]
    pub fn counts_against_health(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            // Callers cannot tell the two apart
            Self::Unreachable(_) | Self::Timeout(_) => "unreachable",
            Self::Server { .. } => "server",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote endpoints, used for failure scripting and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    CreateCart,
    CreateOrder,
    Carriers,
    Deliveries,
    Categories,
    Products,
    ProductStock,
    Customers,
}

impl Endpoint {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateCart => "create_cart",
            Self::CreateOrder => "create_order",
            Self::Carriers => "fetch_carriers",
            Self::Deliveries => "fetch_deliveries",
            Self::Categories => "fetch_categories",
            Self::Products => "fetch_products",
            Self::ProductStock => "fetch_product_stock",
            Self::Customers => "fetch_customers",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItemPayload {
    pub id_product: i64,
    pub id_product_attribute: i64,
    pub quantity: i64,
    pub id_address_delivery: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartPayload {
    pub id_currency: i64,
    pub id_lang: i64,
    pub id_customer: i64,
    pub id_address_delivery: i64,
    pub id_address_invoice: i64,
    pub items: Vec<CartItemPayload>,
}

/// Named fields of [`OrderPayload`]; flattened `extra` keys may not reuse them.
pub const ORDER_PAYLOAD_FIELDS: &[&str] = &[
    "id_cart",
    "id_customer",
    "id_carrier",
    "id_address_delivery",
    "id_address_invoice",
    "id_currency",
    "id_lang",
    "module",
    "payment",
    "total_products",
    "total_products_wt",
    "total_shipping",
    "total_shipping_tax_incl",
    "total_paid",
    "total_paid_real",
    "conversion_rate",
];

/// Order creation request. `id_cart` is always the backend's cart id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub id_cart: i64,
    pub id_customer: i64,
    pub id_carrier: i64,
    pub id_address_delivery: i64,
    pub id_address_invoice: i64,
    pub id_currency: i64,
    pub id_lang: i64,
    pub module: String,
    pub payment: String,
    pub total_products: f64,
    pub total_products_wt: f64,
    pub total_shipping: f64,
    pub total_shipping_tax_incl: f64,
    pub total_paid: f64,
    pub total_paid_real: f64,
    pub conversion_rate: f64,
    /// Caller-supplied fields without a dedicated column, sent verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Operations the engine needs from the commerce backend.
///
/// Fetch methods take an optional lookup key; `None` means "everything".
/// Rows are returned as the backend renders them.
#[async_trait]
pub trait CommerceApi: Send + Sync {
    /// Cheap reachability probe; must not block for long.
    async fn is_reachable(&self) -> bool;

    /// Create a cart, returning the backend cart id.
    async fn create_cart(&self, cart: &CartPayload) -> RemoteResult<i64>;

    /// Create an order, returning the backend order id.
    async fn create_order(&self, order: &OrderPayload) -> RemoteResult<i64>;

    async fn fetch_carriers(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>>;

    /// Delivery rates, optionally for one carrier.
    async fn fetch_deliveries(&self, id_carrier: Option<i64>) -> RemoteResult<Vec<Value>>;

    /// Categories, optionally the children of one parent.
    async fn fetch_categories(&self, id_parent: Option<i64>) -> RemoteResult<Vec<Value>>;

    /// Products, optionally those of one category.
    async fn fetch_products(&self, id_category: Option<i64>) -> RemoteResult<Vec<Value>>;

    async fn fetch_product_stock(&self, id_product: Option<i64>) -> RemoteResult<Vec<Value>>;

    /// One customer by id (empty when unknown).
    async fn fetch_customer(&self, id_customer: i64) -> RemoteResult<Vec<Value>>;

    /// Customers with id greater than `after_id`, ascending, at most `limit`
    /// rows (`limit == 0` means no limit). `page` is informational.
    async fn fetch_customers(&self, after_id: i64, page: u32, limit: u32) -> RemoteResult<Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unreachable_and_timeout_classified_alike() {
        let offline = RemoteError::Unreachable("no route".into());
        let slow = RemoteError::Timeout(Duration::from_secs(10));
        assert_eq!(offline.is_transient(), slow.is_transient());
        assert_eq!(offline.kind(), slow.kind());
        assert!(offline.counts_against_health() && slow.counts_against_health());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        assert!(!RemoteError::Rejected { message: "bad address".into() }.is_transient());
        assert!(!RemoteError::Server { status: 422, message: "x".into() }.is_transient());
        assert!(RemoteError::Server { status: 503, message: "x".into() }.is_transient());
        assert!(RemoteError::CircuitOpen.is_transient());
        assert!(!RemoteError::CircuitOpen.counts_against_health());
    }

    #[test]
    fn test_order_payload_flattens_extra() {
        let mut extra = Map::new();
        extra.insert("gift_message".into(), json!("thanks"));
        let payload = OrderPayload {
            id_cart: 7,
            id_customer: 1,
            id_carrier: 2,
            id_address_delivery: 3,
            id_address_invoice: 3,
            id_currency: 1,
            id_lang: 1,
            module: "ps_checkpayment".into(),
            payment: "Check".into(),
            total_products: 10.0,
            total_products_wt: 12.2,
            total_shipping: 0.0,
            total_shipping_tax_incl: 0.0,
            total_paid: 12.2,
            total_paid_real: 12.2,
            conversion_rate: 1.0,
            extra,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["id_cart"], json!(7));
        assert_eq!(value["gift_message"], json!("thanks"));
    }
}
