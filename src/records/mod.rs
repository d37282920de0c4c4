// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Locally created carts and orders ("dirty records").
//!
//! A record is born dirty with a provisional `local-…` id and no remote id.
//! The reconciler later pushes it and stamps the backend's id, at which point
//! it is clean. The store enforces `dirty = 1 ⇔ remote_id IS NULL` with a
//! `CHECK` constraint, so no code path can observe a half-synced row.
//!
//! ```text
//!   LocalOnly ──push ok──► Synced
//!      │  ▲
//!  fail│  │retry_failed
//!      ▼  │
//!   PushFailed (attempts exhausted)
//! ```

pub mod pricing;
pub mod writer;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::remote::{CartItemPayload, CartPayload, OrderPayload, ORDER_PAYLOAD_FIELDS};
use crate::storage::{Row, RowExt, StorageError};

pub use pricing::{excise_total, order_totals, OrderTotals, PricedLine};
pub use writer::LocalWriter;

/// Prefix of every provisional id; backend ids are plain integers.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WriteError {
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::Validation {
            field,
            reason: "required".into(),
        }
    }
}

/// Persisted sync state of a cart or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    LocalOnly,
    Synced,
    PushFailed,
}

impl SyncState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Synced => "synced",
            Self::PushFailed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "local_only" => Ok(Self::LocalOnly),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::PushFailed),
            other => Err(StorageError::Decode {
                column: "sync_state".into(),
                reason: format!("unknown sync state '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an order names its cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartRef {
    Local(String),
    Remote(i64),
}

/// Bookkeeping columns shared by carts and orders.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMeta {
    pub remote_id: Option<i64>,
    pub dirty: bool,
    pub state: SyncState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<String>,
    pub last_synced_at: Option<String>,
    pub created_at: String,
}

impl SyncMeta {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Self {
            remote_id: row.opt_i64_col("remote_id")?,
            dirty: row.bool_col("dirty")?,
            state: SyncState::parse(&row.str_col("sync_state")?)?,
            attempts: row.i64_col("sync_attempts")?.clamp(0, u32::MAX as i64) as u32,
            last_error: row.opt_str_col("last_sync_error")?,
            next_attempt_at: row.opt_str_col("next_attempt_at")?,
            last_synced_at: row.opt_str_col("last_synced_at")?,
            created_at: row.str_col("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id_product: i64,
    #[serde(default)]
    pub id_product_attribute: i64,
    pub quantity: i64,
    pub id_address_delivery: i64,
}

impl CartItem {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Self {
            id_product: row.i64_col("id_product")?,
            id_product_attribute: row.i64_col("id_product_attribute")?,
            quantity: row.i64_col("quantity")?,
            id_address_delivery: row.i64_col("id_address_delivery")?,
        })
    }

    #[must_use]
    pub fn to_payload(&self) -> CartItemPayload {
        CartItemPayload {
            id_product: self.id_product,
            id_product_attribute: self.id_product_attribute,
            quantity: self.quantity,
            id_address_delivery: self.id_address_delivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cart {
    pub local_id: String,
    pub id_currency: i64,
    pub id_lang: i64,
    pub id_customer: i64,
    pub id_address_delivery: i64,
    pub id_address_invoice: i64,
    pub items: Vec<CartItem>,
    pub sync: SyncMeta,
}

impl Cart {
    pub(crate) fn from_row(row: &Row, items: Vec<CartItem>) -> Result<Self, StorageError> {
        Ok(Self {
            local_id: row.str_col("local_id")?,
            id_currency: row.i64_col("id_currency")?,
            id_lang: row.i64_col("id_lang")?,
            id_customer: row.i64_col("id_customer")?,
            id_address_delivery: row.i64_col("id_address_delivery")?,
            id_address_invoice: row.i64_col("id_address_invoice")?,
            items,
            sync: SyncMeta::from_row(row)?,
        })
    }

    pub(crate) fn items_from_rows(rows: &[Row]) -> Result<Vec<CartItem>, StorageError> {
        rows.iter().map(CartItem::from_row).collect()
    }

    #[must_use]
    pub fn to_payload(&self) -> CartPayload {
        CartPayload {
            id_currency: self.id_currency,
            id_lang: self.id_lang,
            id_customer: self.id_customer,
            id_address_delivery: self.id_address_delivery,
            id_address_invoice: self.id_address_invoice,
            items: self.items.iter().map(CartItem::to_payload).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub local_id: String,
    pub cart_local_id: Option<String>,
    pub remote_cart_id: Option<i64>,
    pub id_customer: i64,
    pub id_carrier: i64,
    pub id_address_delivery: i64,
    pub id_address_invoice: i64,
    pub id_currency: i64,
    pub id_lang: i64,
    pub module: String,
    pub payment: String,
    pub totals: OrderTotals,
    pub conversion_rate: f64,
    pub extra: Map<String, Value>,
    pub sync: SyncMeta,
}

impl Order {
    pub(crate) fn from_row(row: &Row) -> Result<Self, StorageError> {
        let extra_text = row.opt_str_col("extra")?.unwrap_or_else(|| "{}".into());
        let extra = serde_json::from_str(&extra_text).map_err(|e| StorageError::Decode {
            column: "extra".into(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            local_id: row.str_col("local_id")?,
            cart_local_id: row.opt_str_col("cart_local_id")?,
            remote_cart_id: row.opt_i64_col("remote_cart_id")?,
            id_customer: row.i64_col("id_customer")?,
            id_carrier: row.i64_col("id_carrier")?,
            id_address_delivery: row.i64_col("id_address_delivery")?,
            id_address_invoice: row.i64_col("id_address_invoice")?,
            id_currency: row.i64_col("id_currency")?,
            id_lang: row.i64_col("id_lang")?,
            module: row.str_col("module")?,
            payment: row.str_col("payment")?,
            totals: OrderTotals {
                total_products: row.f64_col("total_products")?,
                total_products_wt: row.f64_col("total_products_wt")?,
                total_shipping: row.f64_col("total_shipping")?,
                total_shipping_tax_incl: row.f64_col("total_shipping_tax_incl")?,
                total_paid: row.f64_col("total_paid")?,
                total_paid_real: row.f64_col("total_paid_real")?,
            },
            conversion_rate: row.f64_col("conversion_rate")?,
            extra,
            sync: SyncMeta::from_row(row)?,
        })
    }

    /// Request body for the backend, once the cart's remote id is known.
    #[must_use]
    pub fn to_payload(&self, remote_cart_id: i64) -> OrderPayload {
        OrderPayload {
            id_cart: remote_cart_id,
            id_customer: self.id_customer,
            id_carrier: self.id_carrier,
            id_address_delivery: self.id_address_delivery,
            id_address_invoice: self.id_address_invoice,
            id_currency: self.id_currency,
            id_lang: self.id_lang,
            module: self.module.clone(),
            payment: self.payment.clone(),
            total_products: self.totals.total_products,
            total_products_wt: self.totals.total_products_wt,
            total_shipping: self.totals.total_shipping,
            total_shipping_tax_incl: self.totals.total_shipping_tax_incl,
            total_paid: self.totals.total_paid,
            total_paid_real: self.totals.total_paid_real,
            conversion_rate: self.conversion_rate,
            extra: self
                .extra
                .iter()
                .filter(|(key, _)| !ORDER_PAYLOAD_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Input for [`LocalWriter::create_cart_locally`]. Reference fields are
/// optional so a missing one is reported as a validation error, not a panic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCart {
    pub id_currency: Option<i64>,
    pub id_lang: Option<i64>,
    pub id_customer: Option<i64>,
    pub id_address_delivery: Option<i64>,
    pub id_address_invoice: Option<i64>,
    pub items: Vec<CartItem>,
}

/// Input for [`LocalWriter::create_order_locally`].
///
/// `extra` holds any further caller fields. Keys naming a known order column
/// override that column; the rest are stored and sent to the backend as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub cart: Option<CartRef>,
    pub id_customer: Option<i64>,
    pub id_carrier: Option<i64>,
    pub id_address_delivery: Option<i64>,
    pub id_address_invoice: Option<i64>,
    pub id_currency: Option<i64>,
    pub id_lang: Option<i64>,
    pub module: String,
    pub payment: String,
    pub totals: OrderTotals,
    pub conversion_rate: f64,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Default for NewOrder {
    fn default() -> Self {
        Self {
            cart: None,
            id_customer: None,
            id_carrier: None,
            id_address_delivery: None,
            id_address_invoice: None,
            id_currency: None,
            id_lang: None,
            module: "cashondelivery".into(),
            payment: "Cash on delivery".into(),
            totals: OrderTotals::default(),
            conversion_rate: 1.0,
            extra: Map::new(),
        }
    }
}
