// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff.
//!
//! Two flavours live here:
//! - [`retry`] + [`RetryConfig`]: in-process retry loops for local operations
//!   that may hit a transiently locked database (opening the store,
//!   committing a push result).
//! - [`BackoffPolicy`]: cross-pass backoff for record pushes. Nothing sleeps;
//!   the policy computes when a failed record becomes eligible again and the
//!   reconciler skips it until then.
//!
//! # Example
//!
//! ```
//! use offline_sync::resilience::retry::{BackoffPolicy, RetryConfig};
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, 5);
//!
//! let policy = BackoffPolicy::default();
//! assert_eq!(policy.base_delay(1), Duration::from_secs(30));
//! assert_eq!(policy.base_delay(2), Duration::from_secs(60));
//! assert!(policy.is_exhausted(8));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// In-process retry settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl RetryConfig {
    /// Opening the local store: 5 attempts, giving up after roughly 5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single local write that must not be lost (3 quick attempts).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= config.max_retries {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_retries, err, delay
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// Exponential backoff with jitter keyed by a record's `sync_attempts`.
///
/// After the `n`-th consecutive failure the record waits
/// `initial_delay * factor^(n-1)` (capped at `max_delay`), scaled by a random
/// factor in `[1 - jitter, 1 + jitter]`. Reaching `max_attempts` failures
/// marks the record permanently failed.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            factor: 2.0,
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between passes; records become eligible again immediately.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            max_attempts,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay after `attempts` consecutive failures.
    #[must_use]
    pub fn base_delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Jittered delay, never above `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_delay(attempts);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(scale).min(self.max_delay)
    }

    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            max_attempts: 8,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(60), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy {
            jitter: 0.2,
            ..BackoffPolicy::default()
        };
        for _ in 0..200 {
            let d = policy.delay_for(1).as_secs_f64();
            assert!((24.0..=36.0).contains(&d), "delay {d} outside jitter band");
        }
        // Jitter never pushes past the cap
        for _ in 0..200 {
            assert!(policy.delay_for(30) <= policy.max_delay);
        }
    }

    #[test]
    fn test_exhaustion() {
        let policy = BackoffPolicy::immediate(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert_eq!(policy.delay_for(2), Duration::ZERO);
    }
}
