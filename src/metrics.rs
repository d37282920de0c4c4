// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the offline sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding app is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `domain`: carriers, deliveries, categories, products, product_stock, customers
//! - `kind`: cart, order
//! - `source`: local, remote
//! - `outcome`: success, failure, deferred, blocked, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record which side answered a resolve call
pub fn record_resolve(domain: &str, source: &str) {
    counter!(
        "offline_sync_resolve_total",
        "domain" => domain.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a failed remote call, labelled by error class
pub fn record_remote_error(endpoint: &str, error_type: &str) {
    counter!(
        "offline_sync_remote_errors_total",
        "endpoint" => endpoint.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record rows written through into a cache table
pub fn record_cache_upsert(domain: &str, count: usize) {
    counter!(
        "offline_sync_cache_rows_written_total",
        "domain" => domain.to_string()
    )
    .increment(count as u64);
}

/// Record one push attempt outcome
pub fn record_push(kind: &str, outcome: &str) {
    counter!(
        "offline_sync_push_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of unsynced records of one kind
pub fn set_pending(kind: &str, count: usize) {
    gauge!(
        "offline_sync_pending_records",
        "kind" => kind.to_string()
    )
    .set(count as f64);
}

/// Record a migration script run
pub fn record_migration(name: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "offline_sync_migrations_total",
        "name" => name.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a reconciliation pass duration
pub fn record_pass_duration(duration: Duration) {
    histogram!("offline_sync_reconcile_seconds").record(duration.as_secs_f64());
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "offline_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record rows fetched by an incremental roster refresh
pub fn record_roster_page(domain: &str, rows: usize) {
    counter!(
        "offline_sync_roster_rows_total",
        "domain" => domain.to_string()
    )
    .increment(rows as u64);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_push_counter_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_push("cart", "success");
            record_push("cart", "success");
            record_push("order", "failure");
        });

        let total: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "offline_sync_push_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => v,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_resolve("categories", "local");
        record_remote_error("create_cart", "unreachable");
        record_cache_upsert("products", 12);
        set_pending("order", 2);
        record_migration("0001_reference_cache", true);
        record_pass_duration(Duration::from_millis(20));
        record_circuit_call("commerce_api", "rejected");
        record_roster_page("customers", 100);
        set_engine_state("Ready");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("resolver", "resolve");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
