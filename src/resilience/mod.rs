// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry, backoff and circuit breaking.
//!
//! - [`retry`]: in-process retries for local writes, and the per-record push
//!   backoff policy
//! - [`circuit_breaker`]: shared breaker in front of the commerce backend

pub mod circuit_breaker;
pub mod retry;
