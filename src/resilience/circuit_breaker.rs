// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around the remote commerce API, built on `recloser`.
//!
//! When the backend keeps failing (field agent in a dead zone, server down)
//! the breaker opens and calls fail fast instead of each waiting out its
//! network timeout. Reads then fall back to the local cache and pushes are
//! deferred to a later pass without consuming a retry attempt.
//!
//! States:
//! - Closed: calls pass through, outcomes fill a sliding window
//! - Open: calls are rejected without touching the network
//! - HalfOpen: a few probe calls decide whether to close again

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls remembered while closed
    pub window: usize,
    /// Failure ratio over the window that trips the breaker (0.0 - 1.0)
    pub failure_rate: f32,
    /// Probe calls allowed while half-open
    pub half_open_probes: usize,
    /// How long the breaker stays open before probing
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            failure_rate: 0.5,
            half_open_probes: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            window: 2,
            failure_rate: 0.5,
            half_open_probes: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker; the name labels its logs and metrics.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate.clamp(0.0, 1.0))
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_probes.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
        }
    }

    /// Execute an async operation through the breaker. Only errors for which
    /// `is_failure` returns true count against the backend; a validation
    /// rejection from a healthy server must not open the circuit.
    pub async fn call<P, F, Fut, T, E>(&self, is_failure: P, f: F) -> Result<T, CircuitError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inner.call_with(is_failure, f()).await {
            Ok(result) => {
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }
}
