// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Wamux session orchestrator.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Wamux configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WamuxConfig {
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Session pool capacity and external call timeouts.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Automatic reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Circuit breaker thresholds shared by every named breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Periodic health probing.
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-recipient outbound throttling.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Session/credential checkpointing to the key-value store.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Metrics recorder settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Named delivery queues.
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,
}

impl Default for WamuxConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            pool: PoolConfig::default(),
            reconnect: ReconnectConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            checkpoint: CheckpointConfig::default(),
            metrics: MetricsConfig::default(),
            queues: default_queues(),
        }
    }
}

impl WamuxConfig {
    /// Looks up a queue definition by name.
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Session pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of session records (and therefore live external clients).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Timeout for creating and attaching an external client.
    #[serde(default = "default_create_timeout_ms")]
    pub create_timeout_ms: u64,

    /// Timeout for tearing an external client down.
    #[serde(default = "default_destroy_timeout_ms")]
    pub destroy_timeout_ms: u64,

    /// Timeout for a single send on an external client.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Credential challenges tolerated before the session fails.
    #[serde(default = "default_max_credential_attempts")]
    pub max_credential_attempts: u32,

    /// Idle time after which an unleased session is evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            create_timeout_ms: default_create_timeout_ms(),
            destroy_timeout_ms: default_destroy_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_credential_attempts: default_max_credential_attempts(),
            idle_timeout_secs: default_idle_timeout_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

fn default_capacity() -> usize {
    100
}

fn default_create_timeout_ms() -> u64 {
    30_000
}

fn default_destroy_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    15_000
}

fn default_max_credential_attempts() -> u32 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_eviction_interval_secs() -> u64 {
    60
}

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * multiplier^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Fixed,
}

/// Backoff curve parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default)]
    pub kind: BackoffKind,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Symmetric jitter fraction in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

/// Automatic reconnection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failed attempts before the session is marked failed.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,

    /// How long an attempt waits for the recreated client to report ready.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Interval of the sweep that reschedules stranded disconnected sessions.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: default_reconnect_max_attempts(),
            ready_timeout_ms: default_ready_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ReconnectConfig {
    /// The exponential curve described by this section.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            kind: BackoffKind::Exponential,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_secs() -> u64 {
    30
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failure ratio over the rolling window that opens the circuit.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Outcomes required in the window before the ratio is considered.
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,

    /// Number of recent outcomes kept in the rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Time the circuit stays open before a half-open trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cooldown growth factor applied after each failed trial. `1.0` disables growth.
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,

    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,

    /// Timeout applied to every guarded call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_requests: default_minimum_requests(),
            window_size: default_window_size(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_minimum_requests() -> u32 {
    10
}

fn default_window_size() -> usize {
    20
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_cooldown_multiplier() -> f64 {
    1.0
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

fn default_call_timeout_ms() -> u64 {
    15_000
}

/// Health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

/// Per-recipient rate limit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sends allowed per (session, recipient) within one window.
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_window: default_max_per_window(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_max_per_window() -> u32 {
    20
}

fn default_window_ms() -> u64 {
    60_000
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix prepended to every key, e.g. `wamux:session:<tenant>`.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Credential challenges (QR codes) expire quickly on the external side.
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: default_key_prefix(),
            session_ttl_secs: default_session_ttl_secs(),
            challenge_ttl_secs: default_challenge_ttl_secs(),
        }
    }
}

impl CheckpointConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }
}

fn default_key_prefix() -> String {
    "wamux".to_string()
}

fn default_session_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_challenge_ttl_secs() -> u64 {
    60
}

/// Metrics recorder configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder at startup.
    #[serde(default)]
    pub enabled: bool,
}

/// A named delivery queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    pub name: String,

    /// Number of workers pulling from this queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delivery attempts before a job is dead-lettered.
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,

    /// Delay failed jobs in place so later jobs never overtake them.
    #[serde(default)]
    pub ordered: bool,

    /// How long a worker waits for pool capacity when acquiring the target session.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: default_concurrency(),
            max_attempts: default_queue_max_attempts(),
            ordered: false,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_max_attempts() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

/// Name of the queue used when a send does not name one.
pub const DEFAULT_QUEUE: &str = "outbound";

fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new(DEFAULT_QUEUE),
        QueueConfig {
            concurrency: 2,
            max_attempts: 3,
            backoff: BackoffConfig {
                base_delay_ms: 2_000,
                ..BackoffConfig::default()
            },
            ..QueueConfig::new("media")
        },
        QueueConfig {
            concurrency: 1,
            max_attempts: 8,
            ordered: true,
            backoff: BackoffConfig {
                kind: BackoffKind::Fixed,
                base_delay_ms: 500,
                ..BackoffConfig::default()
            },
            ..QueueConfig::new("priority")
        },
    ]
}
