// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker guarding calls into a degrading dependency.
//!
//! - `Closed`: calls run under a timeout. The breaker opens after
//!   `failure_threshold` consecutive failures, or when the failure ratio over
//!   the rolling window reaches `failure_rate_threshold` once at least
//!   `minimum_requests` outcomes were recorded.
//! - `Open`: calls fail with [`WamuxError::CircuitOpen`] until `next_attempt_at`.
//! - `HalfOpen`: exactly one trial call runs. Success closes the breaker,
//!   failure re-opens it with the (optionally grown) cooldown.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use wamux_bus::{EventBus, WamuxEvent};
use wamux_config::BreakerConfig;
use wamux_core::{CircuitState, WamuxError};

/// Thresholds and timings for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub minimum_requests: u32,
    pub window_size: usize,
    pub cooldown: Duration,
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
    pub call_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failure_rate_threshold: config.failure_rate_threshold,
            minimum_requests: config.minimum_requests,
            window_size: config.window_size.max(1),
            cooldown: config.cooldown(),
            cooldown_multiplier: config.cooldown_multiplier.max(1.0),
            max_cooldown: config.max_cooldown().max(config.cooldown()),
            call_timeout: config.call_timeout(),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Failure ratio over the rolling window, `0.0` when empty.
    pub failure_rate: f64,
    pub window_len: usize,
    /// Time until the next half-open trial, when open.
    pub retry_in: Option<Duration>,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub fallbacks: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// `true` for failure.
    window: VecDeque<bool>,
    next_attempt_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

#[derive(Debug, Default)]
struct Counters {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    fallbacks: AtomicU64,
}

/// How a guarded call ended, as far as the breaker is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Error that does not reflect dependency health (rate limit, validation).
    Neutral,
}

/// A single named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    counters: Counters,
    bus: Option<EventBus>,
}

/// Releases the half-open trial slot if the guarded future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let cooldown = settings.cooldown;
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                next_attempt_at: None,
                cooldown,
                trial_in_flight: false,
            }),
            counters: Counters::default(),
            bus: None,
        }
    }

    /// Publishes transitions on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `f` under the breaker and the call timeout.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, WamuxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WamuxError>>,
    {
        let trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let result = match tokio::time::timeout(self.settings.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                wamux_prometheus::record_breaker_call(&self.name, "timeout");
                Err(WamuxError::Timeout {
                    operation: self.name.clone(),
                    duration: self.settings.call_timeout,
                })
            }
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.counts_against_breaker() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        guard.armed = false;
        self.record(outcome, trial);
        result
    }

    /// Like [`execute`](Self::execute), but calls `fallback` instead of
    /// failing when the breaker rejects the call.
    pub async fn execute_with_fallback<T, F, Fut, G, FutG>(
        &self,
        f: F,
        fallback: G,
    ) -> Result<T, WamuxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WamuxError>>,
        G: FnOnce(WamuxError) -> FutG,
        FutG: Future<Output = Result<T, WamuxError>>,
    {
        match self.execute(f).await {
            Err(err @ WamuxError::CircuitOpen { .. }) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                wamux_prometheus::record_breaker_call(&self.name, "fallback");
                fallback(err).await
            }
            other => other,
        }
    }

    /// Forces the breaker back to `Closed` and clears its window.
    pub fn reset(&self) {
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.window.clear();
            inner.next_attempt_at = None;
            inner.cooldown = self.settings.cooldown;
            inner.trial_in_flight = false;
            from
        };
        tracing::info!(breaker = %self.name, %from, "circuit breaker reset");
        if from != CircuitState::Closed {
            self.announce(from, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        let failures_in_window = inner.window.iter().filter(|failed| **failed).count();
        let failure_rate = if inner.window.is_empty() {
            0.0
        } else {
            failures_in_window as f64 / inner.window.len() as f64
        };
        let retry_in = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_rate,
            window_len: inner.window.len(),
            retry_in,
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a call may run. `Ok(true)` marks the half-open trial.
    fn admit(&self) -> Result<bool, WamuxError> {
        let now = Instant::now();
        let mut transition = None;
        let verdict = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => match inner.next_attempt_at {
                    Some(at) if now < at => Err(at - now),
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(true)
                    }
                },
                CircuitState::HalfOpen if inner.trial_in_flight => Err(Duration::ZERO),
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        };

        if let Some((from, to)) = transition {
            tracing::info!(breaker = %self.name, "circuit breaker half-open, allowing trial call");
            self.announce(from, to);
        }

        verdict.map_err(|retry_in| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            wamux_prometheus::record_breaker_call(&self.name, "rejected");
            WamuxError::CircuitOpen {
                operation: self.name.clone(),
                retry_in,
            }
        })
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        match outcome {
            Outcome::Success => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                wamux_prometheus::record_breaker_call(&self.name, "success");
            }
            Outcome::Failure => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                wamux_prometheus::record_breaker_call(&self.name, "failure");
            }
            Outcome::Neutral => {}
        }

        let now = Instant::now();
        let transition = {
            let mut inner = self.lock();
            if trial {
                inner.trial_in_flight = false;
            }
            match (inner.state, outcome) {
                (_, Outcome::Neutral) => None,
                (CircuitState::HalfOpen, Outcome::Success) if trial => {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.window.clear();
                    inner.next_attempt_at = None;
                    inner.cooldown = self.settings.cooldown;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                (CircuitState::HalfOpen, Outcome::Failure) if trial => {
                    let grown = inner.cooldown.mul_f64(self.settings.cooldown_multiplier);
                    inner.cooldown = grown.min(self.settings.max_cooldown);
                    inner.state = CircuitState::Open;
                    inner.next_attempt_at = Some(now + inner.cooldown);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                (CircuitState::Closed, outcome) => {
                    let failed = outcome == Outcome::Failure;
                    inner.window.push_back(failed);
                    while inner.window.len() > self.settings.window_size {
                        inner.window.pop_front();
                    }
                    if failed {
                        inner.consecutive_failures += 1;
                    } else {
                        inner.consecutive_failures = 0;
                    }
                    if failed && self.should_trip(&inner) {
                        inner.state = CircuitState::Open;
                        inner.next_attempt_at = Some(now + inner.cooldown);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                // Late results from calls admitted before a transition.
                _ => None,
            }
        };

        if let Some((from, to)) = transition {
            match to {
                CircuitState::Open => {
                    let cooldown = self.lock().cooldown;
                    tracing::warn!(
                        breaker = %self.name,
                        %from,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
                _ => tracing::info!(breaker = %self.name, %from, %to, "circuit breaker transition"),
            }
            self.announce(from, to);
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.settings.failure_threshold {
            return true;
        }
        let total = inner.window.len();
        if total == 0 || (total as u32) < self.settings.minimum_requests {
            return false;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        failures as f64 / total as f64 >= self.settings.failure_rate_threshold
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        wamux_prometheus::record_breaker_transition(&self.name, state_label(to));
        if let Some(bus) = &self.bus {
            bus.publish(WamuxEvent::BreakerStateChanged {
                name: self.name.clone(),
                from,
                to,
                at: chrono::Utc::now(),
            });
        }
    }
}

fn state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}
