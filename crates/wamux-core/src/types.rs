// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared by the registry, scheduler, queue and engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WamuxError;
use crate::state::SessionState;

/// Maximum accepted length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Stable identifier of a tenant, and therefore of its session slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validates and wraps a raw tenant identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, WamuxError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(WamuxError::Validation("tenant id must not be empty".into()));
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(WamuxError::Validation(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} bytes"
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(WamuxError::Validation(format!(
                "tenant id `{raw}` contains whitespace or control characters"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = WamuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Unique identifier of a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Health status reported by external client probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational but experiencing issues.
    Degraded(String),
    /// Not operational.
    Unhealthy(String),
}

impl HealthStatus {
    /// Degraded handles still carry traffic; only `Unhealthy` fails a probe.
    pub fn is_alive(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// Why the external client dropped its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Network,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    RestartRequired,
    /// The health monitor's probe failed.
    ProbeFailed,
    /// A reconnection attempt by the scheduler failed.
    RecoveryFailed,
    /// The account explicitly logged out. Never retried.
    LoggedOut,
    /// The account was banned or blocked. Never retried.
    Banned,
    Other(String),
}

impl DisconnectReason {
    /// Whether the reconnection scheduler should try to recover from this reason.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DisconnectReason::LoggedOut | DisconnectReason::Banned)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Network => f.write_str("network"),
            DisconnectReason::ConnectionLost => f.write_str("connection_lost"),
            DisconnectReason::ConnectionReplaced => f.write_str("connection_replaced"),
            DisconnectReason::TimedOut => f.write_str("timed_out"),
            DisconnectReason::RestartRequired => f.write_str("restart_required"),
            DisconnectReason::ProbeFailed => f.write_str("probe_failed"),
            DisconnectReason::RecoveryFailed => f.write_str("recovery_failed"),
            DisconnectReason::LoggedOut => f.write_str("logged_out"),
            DisconnectReason::Banned => f.write_str("banned"),
            DisconnectReason::Other(reason) => write!(f, "other({reason})"),
        }
    }
}

impl FromStr for DisconnectReason {
    type Err = std::convert::Infallible;

    /// Parses the reason codes external clients report (`"NETWORK"`, `"logged_out"`, ...).
    /// Unknown codes map to [`DisconnectReason::Other`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Ok(match normalized.as_str() {
            "network" => DisconnectReason::Network,
            "connection_lost" | "connection_closed" => DisconnectReason::ConnectionLost,
            "connection_replaced" => DisconnectReason::ConnectionReplaced,
            "timed_out" | "timeout" => DisconnectReason::TimedOut,
            "restart_required" => DisconnectReason::RestartRequired,
            "probe_failed" => DisconnectReason::ProbeFailed,
            "recovery_failed" => DisconnectReason::RecoveryFailed,
            "logged_out" | "logout" => DisconnectReason::LoggedOut,
            "banned" | "forbidden" => DisconnectReason::Banned,
            _ => DisconnectReason::Other(s.trim().to_string()),
        })
    }
}

/// Outbound message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text {
        body: String,
    },
    Media {
        media_type: String,
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Json {
        value: serde_json::Value,
    },
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Payload::Text { body: body.into() }
    }

    /// Rejects payloads that can never be delivered.
    pub fn validate(&self) -> Result<(), WamuxError> {
        match self {
            Payload::Text { body } if body.trim().is_empty() => {
                Err(WamuxError::Validation("text payload body is empty".into()))
            }
            Payload::Media { url, .. } if url.trim().is_empty() => {
                Err(WamuxError::Validation("media payload url is empty".into()))
            }
            Payload::Media { media_type, .. } if media_type.trim().is_empty() => {
                Err(WamuxError::Validation("media payload type is empty".into()))
            }
            Payload::Json {
                value: serde_json::Value::Null,
            } => {
                Err(WamuxError::Validation("json payload is null".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Result of a successful external send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Message identifier assigned by the external channel.
    pub message_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub reconnections: u64,
}

/// Serializable projection of a session record.
///
/// This is the only view of a session handed to callers and to the
/// checkpoint store; the external handle lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: TenantId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub credential_attempts: u32,
    pub metrics: SessionMetrics,
}

/// Aggregate pool utilization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Records in the registry.
    pub total: usize,
    /// Records currently leased by at least one caller.
    pub active: usize,
    /// Records in the `Ready` state.
    pub ready: usize,
    /// Records with an attached external handle.
    pub attached: usize,
    pub capacity: usize,
}
