// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric registration and recording helpers.
//!
//! Everything goes through the metrics-rs facade, so calls are no-ops until
//! a recorder is installed.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use wamux_core::{PoolStats, SessionState};

/// Register all Wamux metric descriptions.
pub fn register_metrics() {
    describe_counter!("wamux_sessions_created_total", "Session records created");
    describe_counter!(
        "wamux_sessions_destroyed_total",
        "Session records removed, by cause"
    );
    describe_counter!(
        "wamux_session_transitions_total",
        "Session state transitions"
    );
    describe_counter!(
        "wamux_reconnect_attempts_total",
        "Reconnection attempts, by outcome"
    );
    describe_counter!("wamux_health_probes_total", "Health probes, by outcome");
    describe_counter!(
        "wamux_breaker_calls_total",
        "Guarded calls, by breaker and outcome"
    );
    describe_counter!(
        "wamux_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!("wamux_jobs_total", "Queue job outcomes");
    describe_histogram!(
        "wamux_job_delivery_seconds",
        "Time from enqueue to successful delivery"
    );
    describe_gauge!("wamux_pool_sessions", "Session records by category");
    describe_gauge!("wamux_pool_capacity", "Configured pool capacity");
    describe_gauge!("wamux_queue_jobs", "Queue jobs by status");
}

pub fn record_session_created() {
    metrics::counter!("wamux_sessions_created_total").increment(1);
}

pub fn record_session_destroyed(cause: &'static str) {
    metrics::counter!("wamux_sessions_destroyed_total", "cause" => cause).increment(1);
}

pub fn record_transition(from: SessionState, to: SessionState) {
    metrics::counter!(
        "wamux_session_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// `outcome` is one of `scheduled`, `succeeded`, `failed`, `exhausted`.
pub fn record_reconnect(outcome: &'static str) {
    metrics::counter!("wamux_reconnect_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_probe(healthy: bool) {
    let outcome = if healthy { "healthy" } else { "unhealthy" };
    metrics::counter!("wamux_health_probes_total", "outcome" => outcome).increment(1);
}

/// `outcome` is one of `success`, `failure`, `timeout`, `rejected`, `fallback`.
pub fn record_breaker_call(name: &str, outcome: &'static str) {
    metrics::counter!(
        "wamux_breaker_calls_total",
        "breaker" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_breaker_transition(name: &str, to: &'static str) {
    metrics::counter!(
        "wamux_breaker_transitions_total",
        "breaker" => name.to_string(),
        "to" => to
    )
    .increment(1);
}

/// `outcome` is one of `delivered`, `retried`, `rate_limited`, `dead_lettered`.
pub fn record_job(queue: &str, outcome: &'static str) {
    metrics::counter!("wamux_jobs_total", "queue" => queue.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_delivery_latency(queue: &str, seconds: f64) {
    metrics::histogram!("wamux_job_delivery_seconds", "queue" => queue.to_string())
        .record(seconds);
}

pub fn set_pool_stats(stats: &PoolStats) {
    for (kind, value) in [
        ("total", stats.total),
        ("active", stats.active),
        ("ready", stats.ready),
        ("attached", stats.attached),
    ] {
        metrics::gauge!("wamux_pool_sessions", "kind" => kind).set(value as f64);
    }
    metrics::gauge!("wamux_pool_capacity").set(stats.capacity as f64);
}

pub fn set_queue_depth(queue: &str, pending: usize, in_flight: usize, dead: usize) {
    for (status, value) in [
        ("pending", pending),
        ("in_flight", in_flight),
        ("dead_lettered", dead),
    ] {
        metrics::gauge!("wamux_queue_jobs", "queue" => queue.to_string(), "status" => status)
            .set(value as f64);
    }
}
