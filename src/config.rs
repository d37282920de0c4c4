//! Configuration for the offline sync engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::{CartReusePolicy, EngineConfig};
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.category_max_age_hours, 25);
//! assert_eq!(config.customer_max_age_hours, 3);
//!
//! // Tuned for a device that reuses the open cart
//! let config = EngineConfig {
//!     database_path: "/data/agent.db".into(),
//!     cart_reuse: CartReusePolicy::ReuseOpenCart,
//!     push_max_attempts: 5,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::BackoffPolicy;

/// Which cart an order is attached to when the caller does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartReusePolicy {
    /// Every order gets a freshly created cart.
    #[default]
    AlwaysNew,
    /// Reuse the customer's newest unsynced cart that no order references yet.
    ReuseOpenCart,
}

/// Configuration for the offline sync engine.
///
/// All fields have defaults suitable for a phone-class device.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum age of the category/product tree before a refresh
    #[serde(default = "default_category_max_age_hours")]
    pub category_max_age_hours: u64,
    /// Maximum age of the customer roster before a refresh
    #[serde(default = "default_customer_max_age_hours")]
    pub customer_max_age_hours: u64,
    /// Maximum age of other reference data (carriers, delivery rates, stock)
    #[serde(default = "default_reference_max_age_hours")]
    pub reference_max_age_hours: u64,

    /// Customers fetched per page during roster refresh
    #[serde(default = "default_customer_page_size")]
    pub customer_page_size: u32,

    /// Push backoff
    #[serde(default = "default_push_backoff_initial_ms")]
    pub push_backoff_initial_ms: u64,
    #[serde(default = "default_push_backoff_max_ms")]
    pub push_backoff_max_ms: u64,
    #[serde(default = "default_push_backoff_factor")]
    pub push_backoff_factor: f64,
    /// Failed pushes before a record is marked permanently failed
    #[serde(default = "default_push_max_attempts")]
    pub push_max_attempts: u32,
    /// Jitter fraction applied to each backoff delay (0.0 - 1.0)
    #[serde(default = "default_push_jitter")]
    pub push_jitter: f64,

    #[serde(default)]
    pub cart_reuse: CartReusePolicy,

    /// VAT multiplier applied to the per-unit excise
    #[serde(default = "default_tax_multiplier")]
    pub tax_multiplier: f64,

    /// Remote API circuit breaker
    #[serde(default = "default_remote_circuit_window")]
    pub remote_circuit_window: usize,
    #[serde(default = "default_remote_circuit_failure_rate")]
    pub remote_circuit_failure_rate: f32,
    #[serde(default = "default_remote_circuit_open_secs")]
    pub remote_circuit_open_secs: u64,
}

fn default_database_path() -> String { "./offline_sync.db".to_string() }
fn default_max_connections() -> u32 { 4 }
fn default_category_max_age_hours() -> u64 { 25 }
fn default_customer_max_age_hours() -> u64 { 3 }
fn default_reference_max_age_hours() -> u64 { 25 }
fn default_customer_page_size() -> u32 { 100 }
fn default_push_backoff_initial_ms() -> u64 { 30_000 }
fn default_push_backoff_max_ms() -> u64 { 3_600_000 } // 1 hour
fn default_push_backoff_factor() -> f64 { 2.0 }
fn default_push_max_attempts() -> u32 { 8 }
fn default_push_jitter() -> f64 { 0.2 }
fn default_tax_multiplier() -> f64 { 1.22 }
fn default_remote_circuit_window() -> usize { 10 }
fn default_remote_circuit_failure_rate() -> f32 { 0.5 }
fn default_remote_circuit_open_secs() -> u64 { 30 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            category_max_age_hours: default_category_max_age_hours(),
            customer_max_age_hours: default_customer_max_age_hours(),
            reference_max_age_hours: default_reference_max_age_hours(),
            customer_page_size: default_customer_page_size(),
            push_backoff_initial_ms: default_push_backoff_initial_ms(),
            push_backoff_max_ms: default_push_backoff_max_ms(),
            push_backoff_factor: default_push_backoff_factor(),
            push_max_attempts: default_push_max_attempts(),
            push_jitter: default_push_jitter(),
            cart_reuse: CartReusePolicy::default(),
            tax_multiplier: default_tax_multiplier(),
            remote_circuit_window: default_remote_circuit_window(),
            remote_circuit_failure_rate: default_remote_circuit_failure_rate(),
            remote_circuit_open_secs: default_remote_circuit_open_secs(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.push_backoff_initial_ms),
            max_delay: Duration::from_millis(self.push_backoff_max_ms),
            factor: self.push_backoff_factor,
            max_attempts: self.push_max_attempts,
            jitter: self.push_jitter,
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            window: self.remote_circuit_window,
            failure_rate: self.remote_circuit_failure_rate,
            open_wait: Duration::from_secs(self.remote_circuit_open_secs),
            ..CircuitConfig::default()
        }
    }
}
