// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pass state and the single-flight guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Counters for one reconciliation pass. Created per pass, never shared.
#[derive(Debug)]
pub struct SyncSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub carts_pushed: usize,
    pub orders_pushed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub blocked: usize,
    pub permanently_failed: usize,
}

impl SyncSession {
    #[must_use]
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            carts_pushed: 0,
            orders_pushed: 0,
            failed: 0,
            deferred: 0,
            blocked: 0,
            permanently_failed: 0,
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

/// Holds the "pass running" flag; clears it on drop, including on panic or
/// when the pass future is dropped mid-way.
pub(crate) struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    /// `None` if another pass holds the flag.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
