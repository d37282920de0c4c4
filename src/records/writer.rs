// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local write path for carts and orders.
//!
//! Validation happens before the store is touched. Each record (cart plus
//! its items, or one order) is written in a single transaction.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Cart, CartItem, CartRef, NewCart, NewOrder, Order, SyncState, WriteError, LOCAL_ID_PREFIX};
use crate::config::CartReusePolicy;
use crate::storage::{Row, RowExt, SqlStore, StorageError};

/// Columns owned by the sync machinery; callers may not set them.
const SYNC_COLUMNS: &[&str] = &[
    "local_id",
    "remote_id",
    "dirty",
    "sync_state",
    "sync_attempts",
    "last_sync_error",
    "next_attempt_at",
    "last_synced_at",
    "created_at",
    "cart_local_id",
    "remote_cart_id",
    "extra",
];

const NUMERIC_ORDER_COLUMNS: &[&str] = &[
    "id_customer",
    "id_carrier",
    "id_address_delivery",
    "id_address_invoice",
    "id_currency",
    "id_lang",
    "total_products",
    "total_products_wt",
    "total_shipping",
    "total_shipping_tax_incl",
    "total_paid",
    "total_paid_real",
    "conversion_rate",
];

const TEXT_ORDER_COLUMNS: &[&str] = &["module", "payment"];

/// Set from the order's cart reference when pushing.
const CART_REFERENCE_FIELDS: &[&str] = &["id_cart"];

/// Carts that are unsynced and not yet referenced by an order.
const OPEN_CART: &str = "dirty = 1 AND sync_state = 'local_only' \
     AND NOT EXISTS (SELECT 1 FROM orders o WHERE o.cart_local_id = carts.local_id)";

/// Fresh provisional id. UUIDv7 keeps ids roughly creation-ordered.
#[must_use]
pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7())
}

fn required(value: Option<i64>, field: &'static str) -> Result<i64, WriteError> {
    match value {
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(WriteError::Validation {
            field,
            reason: format!("must be positive, got {v}"),
        }),
        None => Err(WriteError::missing(field)),
    }
}

fn validate_items(items: &[CartItem]) -> Result<(), WriteError> {
    if items.is_empty() {
        return Err(WriteError::Validation {
            field: "items",
            reason: "cart has no products".into(),
        });
    }
    for item in items {
        if item.quantity <= 0 {
            return Err(WriteError::Validation {
                field: "quantity",
                reason: format!("product {} has quantity {}", item.id_product, item.quantity),
            });
        }
        required(Some(item.id_product), "id_product")?;
    }
    Ok(())
}

fn item_rows(cart_local_id: &str, items: &[CartItem], default_address: i64) -> Vec<Row> {
    items
        .iter()
        .map(|item| {
            let mut row = Row::new();
            row.insert("cart_local_id".into(), json!(cart_local_id));
            row.insert("id_product".into(), json!(item.id_product));
            row.insert("id_product_attribute".into(), json!(item.id_product_attribute));
            row.insert("quantity".into(), json!(item.quantity));
            // Items default to the cart's delivery address
            let address = if item.id_address_delivery > 0 {
                item.id_address_delivery
            } else {
                default_address
            };
            row.insert("id_address_delivery".into(), json!(address));
            row
        })
        .collect()
}

fn sync_defaults(row: &mut Row, local_id: &str) {
    row.insert("local_id".into(), json!(local_id));
    row.insert("remote_id".into(), Value::Null);
    row.insert("dirty".into(), json!(1));
    row.insert("sync_state".into(), json!(SyncState::LocalOnly.as_str()));
    row.insert("sync_attempts".into(), json!(0));
    row.insert("last_sync_error".into(), Value::Null);
    row.insert("next_attempt_at".into(), Value::Null);
    row.insert("last_synced_at".into(), Value::Null);
    row.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
}

/// Creates dirty carts and orders in the local store.
pub struct LocalWriter {
    store: Arc<SqlStore>,
    reuse: CartReusePolicy,
}

impl LocalWriter {
    pub fn new(store: Arc<SqlStore>, reuse: CartReusePolicy) -> Self {
        Self { store, reuse }
    }

    /// Insert a dirty cart and all of its items atomically.
    #[tracing::instrument(skip_all, fields(customer = ?cart.id_customer, items = cart.items.len()))]
    pub async fn create_cart_locally(&self, cart: NewCart) -> Result<String, WriteError> {
        let id_customer = required(cart.id_customer, "id_customer")?;
        let id_address_delivery = required(cart.id_address_delivery, "id_address_delivery")?;
        let id_address_invoice = required(cart.id_address_invoice, "id_address_invoice")?;
        let id_currency = required(cart.id_currency, "id_currency")?;
        let id_lang = required(cart.id_lang, "id_lang")?;
        validate_items(&cart.items)?;

        let local_id = new_local_id();
        let mut cart_row = Row::new();
        sync_defaults(&mut cart_row, &local_id);
        cart_row.insert("id_currency".into(), json!(id_currency));
        cart_row.insert("id_lang".into(), json!(id_lang));
        cart_row.insert("id_customer".into(), json!(id_customer));
        cart_row.insert("id_address_delivery".into(), json!(id_address_delivery));
        cart_row.insert("id_address_invoice".into(), json!(id_address_invoice));

        let item_rows = item_rows(&local_id, &cart.items, id_address_delivery);

        self.store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_row("carts", &cart_row).await?;
                    for row in &item_rows {
                        tx.insert_row("cart_items", row).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(local_id = %local_id, "Cart created locally");
        Ok(local_id)
    }

    /// Insert a dirty order.
    ///
    /// Sync columns start at their defaults (`dirty = 1`, no attempts, no
    /// error, no remote id). `NewOrder::extra` keys naming an order column
    /// override it; other keys are kept verbatim for the backend.
    #[tracing::instrument(skip_all, fields(customer = ?order.id_customer))]
    pub async fn create_order_locally(&self, order: NewOrder) -> Result<String, WriteError> {
        let cart = order.cart.clone().ok_or_else(|| WriteError::missing("cart"))?;
        let mut row = Row::new();
        row.insert("id_customer".into(), json!(required(order.id_customer, "id_customer")?));
        row.insert("id_carrier".into(), json!(required(order.id_carrier, "id_carrier")?));
        row.insert(
            "id_address_delivery".into(),
            json!(required(order.id_address_delivery, "id_address_delivery")?),
        );
        row.insert(
            "id_address_invoice".into(),
            json!(required(order.id_address_invoice, "id_address_invoice")?),
        );
        row.insert("id_currency".into(), json!(required(order.id_currency, "id_currency")?));
        row.insert("id_lang".into(), json!(required(order.id_lang, "id_lang")?));
        row.insert("module".into(), json!(order.module));
        row.insert("payment".into(), json!(order.payment));
        row.insert("total_products".into(), json!(order.totals.total_products));
        row.insert("total_products_wt".into(), json!(order.totals.total_products_wt));
        row.insert("total_shipping".into(), json!(order.totals.total_shipping));
        row.insert("total_shipping_tax_incl".into(), json!(order.totals.total_shipping_tax_incl));
        row.insert("total_paid".into(), json!(order.totals.total_paid));
        row.insert("total_paid_real".into(), json!(order.totals.total_paid_real));
        row.insert("conversion_rate".into(), json!(order.conversion_rate));

        let extra = merge_caller_fields(&mut row, order.extra)?;
        let extra = serde_json::to_string(&Value::Object(extra)).map_err(|e| WriteError::Validation {
            field: "extra",
            reason: e.to_string(),
        })?;
        row.insert("extra".into(), json!(extra));

        let local_id = new_local_id();
        sync_defaults(&mut row, &local_id);

        let cart_found = match cart {
            CartRef::Remote(id) => {
                row.insert("cart_local_id".into(), Value::Null);
                row.insert("remote_cart_id".into(), json!(required(Some(id), "cart")?));
                self.store.insert_row("orders", &row).await?;
                true
            }
            CartRef::Local(cart_id) => {
                row.insert("cart_local_id".into(), json!(cart_id));
                self.store
                    .run_in_transaction(move |tx| {
                        Box::pin(async move {
                            let carts = tx
                                .query_rows("carts", Some("local_id = ?"), &[json!(cart_id)])
                                .await?;
                            let Some(cart_row) = carts.first() else {
                                return Ok(false);
                            };
                            // Cart already pushed: the order can go out on the next pass
                            if let Some(remote_cart_id) = cart_row.opt_i64_col("remote_id")? {
                                row.insert("remote_cart_id".into(), json!(remote_cart_id));
                            }
                            tx.insert_row("orders", &row).await?;
                            Ok(true)
                        })
                    })
                    .await?
            }
        };

        if !cart_found {
            let id = match order.cart {
                Some(CartRef::Local(id)) => id,
                _ => String::new(),
            };
            return Err(WriteError::NotFound { what: "cart", id });
        }

        info!(local_id = %local_id, "Order created locally");
        Ok(local_id)
    }

    /// Cart to attach a new order to, per the configured reuse policy.
    ///
    /// A reused cart gets `cart.items` appended; the cart's other fields are
    /// left as they were.
    pub async fn cart_for_order(&self, id_customer: i64, mut cart: NewCart) -> Result<String, WriteError> {
        cart.id_customer = Some(id_customer);
        if self.reuse == CartReusePolicy::ReuseOpenCart {
            validate_items(&cart.items)?;
            if let Some((local_id, id_address_delivery)) = self.open_cart_for(id_customer).await? {
                if self.append_items(&local_id, &cart.items, id_address_delivery).await? {
                    debug!(local_id = %local_id, items = cart.items.len(), "Reusing open cart");
                    return Ok(local_id);
                }
            }
        }
        self.create_cart_locally(cart).await
    }

    /// Newest unsynced cart of `id_customer` that no order references.
    async fn open_cart_for(&self, id_customer: i64) -> Result<Option<(String, i64)>, StorageError> {
        let rows = self
            .store
            .query_sql(
                &format!(
                    "SELECT local_id, id_address_delivery FROM carts \
                     WHERE id_customer = ? AND {OPEN_CART} ORDER BY rowid DESC LIMIT 1"
                ),
                &[json!(id_customer)],
            )
            .await?;
        rows.first()
            .map(|r| Ok::<_, StorageError>((r.str_col("local_id")?, r.i64_col("id_address_delivery")?)))
            .transpose()
    }

    /// Add items to `local_id` if it is still open. Returns whether it was.
    async fn append_items(
        &self,
        local_id: &str,
        items: &[CartItem],
        id_address_delivery: i64,
    ) -> Result<bool, StorageError> {
        let local_id = local_id.to_string();
        let rows = item_rows(&local_id, items, id_address_delivery);
        self.store
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    let open = tx
                        .query_sql(
                            &format!("SELECT local_id FROM carts WHERE local_id = ? AND {OPEN_CART}"),
                            &[json!(local_id)],
                        )
                        .await?;
                    if open.is_empty() {
                        return Ok(false);
                    }
                    for row in &rows {
                        tx.insert_row("cart_items", row).await?;
                    }
                    Ok(true)
                })
            })
            .await
    }

    pub async fn cart(&self, local_id: &str) -> Result<Option<Cart>, StorageError> {
        load_cart(&self.store, local_id).await
    }

    pub async fn order(&self, local_id: &str) -> Result<Option<Order>, StorageError> {
        let rows = self
            .store
            .query_rows("orders", Some("local_id = ?"), &[json!(local_id)])
            .await?;
        rows.first().map(Order::from_row).transpose()
    }
}

pub(crate) async fn load_cart(store: &SqlStore, local_id: &str) -> Result<Option<Cart>, StorageError> {
    let rows = store.query_rows("carts", Some("local_id = ?"), &[json!(local_id)]).await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let items = store
        .query_sql(
            "SELECT * FROM cart_items WHERE cart_local_id = ? ORDER BY id",
            &[json!(local_id)],
        )
        .await?;
    Ok(Some(Cart::from_row(row, Cart::items_from_rows(&items)?)?))
}

/// Fold caller-supplied fields into `row`, returning the ones with no column.
fn merge_caller_fields(row: &mut Row, fields: Map<String, Value>) -> Result<Map<String, Value>, WriteError> {
    let mut extra = Map::new();
    for (key, value) in fields {
        let key_str = key.as_str();
        if SYNC_COLUMNS.contains(&key_str) {
            return Err(WriteError::Validation {
                field: "extra",
                reason: format!("'{key}' is managed by the sync engine"),
            });
        }
        if CART_REFERENCE_FIELDS.contains(&key_str) {
            return Err(WriteError::Validation {
                field: "extra",
                reason: format!("'{key}' is set from the order's cart"),
            });
        }
        if NUMERIC_ORDER_COLUMNS.contains(&key_str) {
            if !value.is_number() {
                return Err(WriteError::Validation {
                    field: "extra",
                    reason: format!("'{key}' must be a number"),
                });
            }
            row.insert(key, value);
        } else if TEXT_ORDER_COLUMNS.contains(&key_str) {
            if !value.is_string() {
                return Err(WriteError::Validation {
                    field: "extra",
                    reason: format!("'{key}' must be a string"),
                });
            }
            row.insert(key, value);
        } else {
            extra.insert(key, value);
        }
    }
    Ok(extra)
}
