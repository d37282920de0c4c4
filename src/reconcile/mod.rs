// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation: pushing dirty carts and orders to the backend.
//!
//! # Pass structure
//!
//! ```text
//! reconcile()
//!   ├─ acquire single-flight flag ── held ──► Err(AlreadyRunning)
//!   ├─ backend unreachable? ── yes ──► every due record deferred, no attempts used
//!   ├─ cart phase:  each due dirty cart, once
//!   │     ok   ─► tx { remote_id, dirty=0, synced; orders.remote_cart_id }
//!   │     fail ─► attempts+1, last_sync_error, next_attempt_at (backoff)
//!   └─ order phase: each due dirty order, once
//!         cart has no remote id ─► blocked (skipped, no attempt used)
//!         ok / fail as above
//! ```
//!
//! A record is only ever marked synced after the backend confirmed it, in a
//! transaction of its own. A pass abandoned half-way leaves every record
//! either fully synced or untouched; an interrupted push is simply repeated
//! (at-least-once).

pub mod session;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::records::writer::load_cart;
use crate::records::{Order, SyncState};
use crate::remote::{CommerceApi, RemoteError};
use crate::resilience::retry::{retry, BackoffPolicy, RetryConfig};
use crate::staleness::parse_timestamp;
use crate::storage::{RowExt, SqlStore, StorageError};

pub use session::SyncSession;
use session::FlightGuard;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("A reconciliation pass is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Cart,
    Order,
}

impl RecordKind {
    fn table(self) -> &'static str {
        match self {
            Self::Cart => "carts",
            Self::Order => "orders",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Cart => "cart",
            Self::Order => "order",
        }
    }
}

/// Aggregate outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub carts_pushed: usize,
    pub orders_pushed: usize,
    /// Push attempts that failed this pass
    pub failed: usize,
    /// Not attempted: backoff window, open circuit, or backend offline
    pub deferred: usize,
    /// Orders whose cart has no remote id yet
    pub blocked: usize,
    /// Failures this pass that exhausted the attempt budget
    pub permanently_failed: usize,
    /// Dirty records still waiting after the pass (excluding permanent failures)
    pub pending: usize,
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pending, {} failed", self.pending, self.failed)
    }
}

/// Dirty-record counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub carts: usize,
    pub orders: usize,
    pub failed_carts: usize,
    pub failed_orders: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn pending(&self) -> usize {
        self.carts + self.orders
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed_carts + self.failed_orders
    }
}

/// A dirty record that is up for a push.
struct Candidate {
    local_id: String,
    attempts: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl Candidate {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

enum PushOutcome {
    Pushed,
    Deferred,
    Failed { permanent: bool },
}

pub struct Reconciler {
    store: Arc<SqlStore>,
    api: Arc<dyn CommerceApi>,
    backoff: BackoffPolicy,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(store: Arc<SqlStore>, api: Arc<dyn CommerceApi>, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            api,
            backoff,
            running: AtomicBool::new(false),
        }
    }

    /// Run one reconciliation pass. Only one pass runs at a time.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<SyncReport, ReconcileError> {
        let Some(_flight) = FlightGuard::acquire(&self.running) else {
            debug!("Reconciliation already running");
            return Err(ReconcileError::AlreadyRunning);
        };

        let mut session = SyncSession::begin();
        let now = session.started_at;
        let online = self.api.is_reachable().await;
        info!(session = %session.id, online, "Reconciliation pass started");

        for candidate in self.candidates(RecordKind::Cart).await? {
            let outcome = if !online || !candidate.is_due(now) {
                PushOutcome::Deferred
            } else {
                self.push_cart(&candidate, now).await?
            };
            Self::tally(&mut session, RecordKind::Cart, outcome);
        }

        for candidate in self.candidates(RecordKind::Order).await? {
            let outcome = if !online || !candidate.is_due(now) {
                Some(PushOutcome::Deferred)
            } else {
                self.push_order(&candidate, now).await?
            };
            match outcome {
                Some(outcome) => Self::tally(&mut session, RecordKind::Order, outcome),
                None => {
                    session.blocked += 1;
                    metrics::record_push(RecordKind::Order.label(), "blocked");
                }
            }
        }

        let counts = self.pending_counts().await?;
        metrics::set_pending(RecordKind::Cart.label(), counts.carts);
        metrics::set_pending(RecordKind::Order.label(), counts.orders);
        metrics::record_pass_duration(session.elapsed());

        let report = SyncReport {
            carts_pushed: session.carts_pushed,
            orders_pushed: session.orders_pushed,
            failed: session.failed,
            deferred: session.deferred,
            blocked: session.blocked,
            permanently_failed: session.permanently_failed,
            pending: counts.pending(),
        };
        info!(
            session = %session.id,
            carts_pushed = report.carts_pushed,
            orders_pushed = report.orders_pushed,
            deferred = report.deferred,
            blocked = report.blocked,
            "Reconciliation pass finished: {}",
            report
        );
        Ok(report)
    }

    /// Put permanently failed records back in the queue with a fresh attempt budget.
    pub async fn retry_failed(&self) -> Result<u64, StorageError> {
        let reset = self
            .store
            .run_in_transaction(|tx| {
                Box::pin(async move {
                    let mut reset = 0;
                    for table in ["carts", "orders"] {
                        reset += tx
                            .execute(
                                &format!(
                                    "UPDATE {table} SET sync_state = 'local_only', sync_attempts = 0, \
                                     next_attempt_at = NULL WHERE sync_state = 'failed'"
                                ),
                                &[],
                            )
                            .await?;
                    }
                    Ok(reset)
                })
            })
            .await?;
        info!(reset, "Failed records re-queued");
        Ok(reset)
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts, StorageError> {
        let mut counts = PendingCounts::default();
        for kind in [RecordKind::Cart, RecordKind::Order] {
            let sql = format!(
                "SELECT sync_state, COUNT(*) AS n FROM {} WHERE dirty = 1 GROUP BY sync_state",
                kind.table()
            );
            for row in self.store.query_sql(&sql, &[]).await? {
                let n = row.i64_col("n")?.max(0) as usize;
                let state = SyncState::parse(&row.str_col("sync_state")?)?;
                match (kind, state) {
                    (RecordKind::Cart, SyncState::PushFailed) => counts.failed_carts += n,
                    (RecordKind::Cart, _) => counts.carts += n,
                    (RecordKind::Order, SyncState::PushFailed) => counts.failed_orders += n,
                    (RecordKind::Order, _) => counts.orders += n,
                }
            }
        }
        Ok(counts)
    }

    fn tally(session: &mut SyncSession, kind: RecordKind, outcome: PushOutcome) {
        let label = match outcome {
            PushOutcome::Pushed => {
                match kind {
                    RecordKind::Cart => session.carts_pushed += 1,
                    RecordKind::Order => session.orders_pushed += 1,
                }
                "success"
            }
            PushOutcome::Deferred => {
                session.deferred += 1;
                "deferred"
            }
            PushOutcome::Failed { permanent } => {
                session.failed += 1;
                if permanent {
                    session.permanently_failed += 1;
                }
                "failure"
            }
        };
        metrics::record_push(kind.label(), label);
    }

    /// Dirty, non-failed records of `kind`, oldest first.
    async fn candidates(&self, kind: RecordKind) -> Result<Vec<Candidate>, StorageError> {
        let sql = format!(
            "SELECT local_id, sync_attempts, next_attempt_at FROM {} \
             WHERE dirty = 1 AND sync_state = 'local_only' ORDER BY rowid",
            kind.table()
        );
        self.store
            .query_sql(&sql, &[])
            .await?
            .iter()
            .map(|row| {
                Ok(Candidate {
                    local_id: row.str_col("local_id")?,
                    attempts: row.i64_col("sync_attempts")?.clamp(0, u32::MAX as i64) as u32,
                    next_attempt_at: row.opt_str_col("next_attempt_at")?.as_deref().and_then(parse_timestamp),
                })
            })
            .collect()
    }

    async fn push_cart(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<PushOutcome, StorageError> {
        let Some(cart) = load_cart(&self.store, &candidate.local_id).await? else {
            return Ok(PushOutcome::Deferred);
        };

        match self.api.create_cart(&cart.to_payload()).await {
            Ok(remote_id) => {
                self.mark_cart_synced(&cart.local_id, remote_id, now).await?;
                info!(local_id = %cart.local_id, remote_id, "Cart pushed");
                Ok(PushOutcome::Pushed)
            }
            Err(e) => self.record_failure(RecordKind::Cart, candidate, &e, now).await,
        }
    }

    /// `None` when the order's cart is not on the backend yet.
    async fn push_order(
        &self,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<Option<PushOutcome>, StorageError> {
        let rows = self
            .store
            .query_rows("orders", Some("local_id = ?"), &[json!(candidate.local_id)])
            .await?;
        let Some(order) = rows.first().map(Order::from_row).transpose()? else {
            return Ok(Some(PushOutcome::Deferred));
        };

        let Some(remote_cart_id) = self.remote_cart_id(&order).await? else {
            debug!(local_id = %order.local_id, "Order blocked on unsynced cart");
            return Ok(None);
        };

        match self.api.create_order(&order.to_payload(remote_cart_id)).await {
            Ok(remote_id) => {
                self.mark_order_synced(&order.local_id, remote_id, remote_cart_id, now)
                    .await?;
                info!(local_id = %order.local_id, remote_id, "Order pushed");
                Ok(Some(PushOutcome::Pushed))
            }
            Err(e) => self
                .record_failure(RecordKind::Order, candidate, &e, now)
                .await
                .map(Some),
        }
    }

    async fn remote_cart_id(&self, order: &Order) -> Result<Option<i64>, StorageError> {
        if order.remote_cart_id.is_some() {
            return Ok(order.remote_cart_id);
        }
        let Some(cart_local_id) = &order.cart_local_id else {
            return Ok(None);
        };
        let rows = self
            .store
            .query_sql(
                "SELECT remote_id FROM carts WHERE local_id = ? AND dirty = 0",
                &[json!(cart_local_id)],
            )
            .await?;
        Ok(rows.first().map(|r| r.opt_i64_col("remote_id")).transpose()?.flatten())
    }

    async fn mark_cart_synced(&self, local_id: &str, remote_id: i64, now: DateTime<Utc>) -> Result<(), StorageError> {
        let synced_at = now.to_rfc3339();
        retry("mark_cart_synced", &RetryConfig::query(), || {
            let local_id = local_id.to_string();
            let synced_at = synced_at.clone();
            self.store.run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.execute(
                        "UPDATE carts SET remote_id = ?, dirty = 0, sync_state = 'synced', \
                         last_synced_at = ?, last_sync_error = NULL, next_attempt_at = NULL \
                         WHERE local_id = ?",
                        &[json!(remote_id), json!(synced_at), json!(local_id)],
                    )
                    .await?;
                    tx.execute(
                        "UPDATE orders SET remote_cart_id = ? WHERE cart_local_id = ?",
                        &[json!(remote_id), json!(local_id)],
                    )
                    .await?;
                    Ok(())
                })
            })
        })
        .await
    }

    async fn mark_order_synced(
        &self,
        local_id: &str,
        remote_id: i64,
        remote_cart_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let synced_at = now.to_rfc3339();
        retry("mark_order_synced", &RetryConfig::query(), || {
            let local_id = local_id.to_string();
            let synced_at = synced_at.clone();
            self.store.run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.execute(
                        "UPDATE orders SET remote_id = ?, remote_cart_id = ?, dirty = 0, \
                         sync_state = 'synced', last_synced_at = ?, last_sync_error = NULL, \
                         next_attempt_at = NULL WHERE local_id = ?",
                        &[json!(remote_id), json!(remote_cart_id), json!(synced_at), json!(local_id)],
                    )
                    .await?;
                    Ok(())
                })
            })
        })
        .await
    }

    async fn record_failure(
        &self,
        kind: RecordKind,
        candidate: &Candidate,
        error: &RemoteError,
        now: DateTime<Utc>,
    ) -> Result<PushOutcome, StorageError> {
        if matches!(error, RemoteError::CircuitOpen) {
            debug!(local_id = %candidate.local_id, "Circuit open, push deferred");
            return Ok(PushOutcome::Deferred);
        }

        let attempts = candidate.attempts.saturating_add(1);
        let permanent = self.backoff.is_exhausted(attempts);
        let state = if permanent {
            SyncState::PushFailed
        } else {
            SyncState::LocalOnly
        };
        let next_attempt_at = if permanent {
            Value::Null
        } else {
            TimeDelta::from_std(self.backoff.delay_for(attempts))
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .map_or(Value::Null, |at| json!(at.to_rfc3339()))
        };

        let sql = format!(
            "UPDATE {} SET sync_attempts = ?, last_sync_error = ?, next_attempt_at = ?, sync_state = ? \
             WHERE local_id = ? AND dirty = 1",
            kind.table()
        );
        let params = [
            json!(attempts),
            json!(error.to_string()),
            next_attempt_at,
            json!(state.as_str()),
            json!(candidate.local_id),
        ];
        retry("record_push_failure", &RetryConfig::query(), || {
            self.store.execute(&sql, &params)
        })
        .await?;

        if permanent {
            warn!(
                kind = kind.label(),
                local_id = %candidate.local_id,
                attempts,
                error = %error,
                "Push failed permanently"
            );
        } else {
            warn!(
                kind = kind.label(),
                local_id = %candidate.local_id,
                attempts,
                error = %error,
                "Push failed, will retry"
            );
        }
        Ok(PushOutcome::Failed { permanent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CartReusePolicy;
    use crate::records::{CartItem, CartRef, LocalWriter, NewCart, NewOrder};
    use crate::remote::{Endpoint, InMemoryCommerceApi};
    use crate::schema::{Migration, SchemaInitializer};
    use std::time::Duration;

    struct Fixture {
        reconciler: Reconciler,
        writer: LocalWriter,
        api: Arc<InMemoryCommerceApi>,
    }

    async fn fixture(backoff: BackoffPolicy) -> Fixture {
        let store = SqlStore::in_memory().await.unwrap();
        SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
        let store = Arc::new(store);
        let api = Arc::new(InMemoryCommerceApi::new());
        Fixture {
            reconciler: Reconciler::new(store.clone(), api.clone(), backoff),
            writer: LocalWriter::new(store, CartReusePolicy::AlwaysNew),
            api,
        }
    }

    async fn cart_and_order(writer: &LocalWriter) -> (String, String) {
        let cart = writer
            .create_cart_locally(NewCart {
                id_currency: Some(1),
                id_lang: Some(1),
                id_customer: Some(7),
                id_address_delivery: Some(70),
                id_address_invoice: Some(70),
                items: vec![CartItem {
                    id_product: 12,
                    id_product_attribute: 0,
                    quantity: 3,
                    id_address_delivery: 70,
                }],
            })
            .await
            .unwrap();
        let order = writer
            .create_order_locally(NewOrder {
                cart: Some(CartRef::Local(cart.clone())),
                id_customer: Some(7),
                id_carrier: Some(2),
                id_address_delivery: Some(70),
                id_address_invoice: Some(70),
                id_currency: Some(1),
                id_lang: Some(1),
                ..NewOrder::default()
            })
            .await
            .unwrap();
        (cart, order)
    }

    #[tokio::test]
    async fn test_cart_then_order_in_one_pass() {
        let f = fixture(BackoffPolicy::immediate(5)).await;
        let (cart_id, order_id) = cart_and_order(&f.writer).await;

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.carts_pushed, 1);
        assert_eq!(report.orders_pushed, 1);
        assert_eq!(report.pending, 0);

        let cart = f.writer.cart(&cart_id).await.unwrap().unwrap();
        let order = f.writer.order(&order_id).await.unwrap().unwrap();
        assert!(!cart.sync.dirty);
        assert!(order.sync.last_synced_at.is_some());
        assert_eq!(order.remote_cart_id, cart.sync.remote_id);
        assert_eq!(f.api.created_orders()[0].1.id_cart, cart.sync.remote_id.unwrap());
    }

    #[tokio::test]
    async fn test_failed_cart_blocks_order_until_later_pass() {
        let f = fixture(BackoffPolicy::immediate(5)).await;
        let (cart_id, order_id) = cart_and_order(&f.writer).await;
        f.api.fail_next(Endpoint::CreateCart, RemoteError::Unreachable("no signal".into()));

        let first = f.reconciler.reconcile().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.blocked, 1);
        assert_eq!(first.to_string(), "2 pending, 1 failed");
        assert_eq!(f.api.call_count(Endpoint::CreateOrder), 0);

        let cart = f.writer.cart(&cart_id).await.unwrap().unwrap();
        assert!(cart.sync.dirty);
        assert_eq!(cart.sync.attempts, 1);
        assert!(cart.sync.last_error.unwrap().contains("no signal"));

        let second = f.reconciler.reconcile().await.unwrap();
        assert_eq!((second.carts_pushed, second.orders_pushed), (1, 1));
        let order = f.writer.order(&order_id).await.unwrap().unwrap();
        assert!(!order.sync.dirty);
    }

    #[tokio::test]
    async fn test_offline_pass_defers_without_using_attempts() {
        let f = fixture(BackoffPolicy::immediate(1)).await;
        let (cart_id, _) = cart_and_order(&f.writer).await;
        f.api.set_reachable(false);

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.deferred, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(f.api.call_count(Endpoint::CreateCart), 0);
        let cart = f.writer.cart(&cart_id).await.unwrap().unwrap();
        assert_eq!(cart.sync.attempts, 0);
    }

    #[tokio::test]
    async fn test_backoff_defers_next_pass() {
        let f = fixture(BackoffPolicy::default()).await;
        let (cart_id, _) = cart_and_order(&f.writer).await;
        f.api.fail_next(
            Endpoint::CreateCart,
            RemoteError::Server { status: 503, message: "maintenance".into() },
        );

        f.reconciler.reconcile().await.unwrap();
        let cart = f.writer.cart(&cart_id).await.unwrap().unwrap();
        assert!(cart.sync.next_attempt_at.is_some());

        let second = f.reconciler.reconcile().await.unwrap();
        // Cart waits out its backoff; the order stays blocked behind it
        assert_eq!(second.deferred, 1);
        assert_eq!(second.blocked, 1);
        assert_eq!(f.api.call_count(Endpoint::CreateCart), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_become_permanent_until_retry_failed() {
        let f = fixture(BackoffPolicy::immediate(2)).await;
        let (cart_id, _) = cart_and_order(&f.writer).await;
        for _ in 0..2 {
            f.api.fail_next(Endpoint::CreateCart, RemoteError::Rejected { message: "bad address".into() });
        }

        f.reconciler.reconcile().await.unwrap();
        let second = f.reconciler.reconcile().await.unwrap();
        assert_eq!(second.permanently_failed, 1);

        let cart = f.writer.cart(&cart_id).await.unwrap().unwrap();
        assert_eq!(cart.sync.state, SyncState::PushFailed);
        assert!(cart.sync.dirty);
        let counts = f.reconciler.pending_counts().await.unwrap();
        assert_eq!(counts.failed_carts, 1);

        // Excluded from later passes
        let third = f.reconciler.reconcile().await.unwrap();
        assert_eq!(third.failed + third.carts_pushed, 0);
        assert_eq!(f.api.call_count(Endpoint::CreateCart), 2);

        assert_eq!(f.reconciler.retry_failed().await.unwrap(), 1);
        let fourth = f.reconciler.reconcile().await.unwrap();
        assert_eq!((fourth.carts_pushed, fourth.orders_pushed), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_pass_rejected() {
        let f = fixture(BackoffPolicy::immediate(5)).await;
        cart_and_order(&f.writer).await;
        f.api.set_latency(Duration::from_millis(50));

        let (a, b) = tokio::join!(f.reconciler.reconcile(), f.reconciler.reconcile());
        assert!(a.is_ok());
        assert!(matches!(b, Err(ReconcileError::AlreadyRunning)));
        assert_eq!(f.api.call_count(Endpoint::CreateCart), 1);

        // Flag released once the pass finished
        assert!(f.reconciler.reconcile().await.is_ok());
    }
}
