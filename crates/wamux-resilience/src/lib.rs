// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience primitives for the Wamux session orchestrator.
//!
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: fail fast on a degrading dependency.
//! - [`BackoffPolicy`]: delay curves with jitter, shared by reconnection and queue retries.
//! - [`RateLimiter`]: per (session, recipient) sliding window.

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod registry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{BreakerSettings, BreakerStats, CircuitBreaker};
pub use rate_limit::RateLimiter;
pub use registry::BreakerRegistry;
