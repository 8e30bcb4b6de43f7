// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event types carried on the bus.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use wamux_core::{CircuitState, DeliveryReceipt, DisconnectReason, JobId, SessionState, TenantId};

/// Why a session record left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyCause {
    /// Caller or operator asked for it.
    Requested,
    /// Removed by the idle sweep.
    Idle,
    /// Removed to make room for a new tenant at capacity.
    Capacity,
    /// Engine shutdown.
    Shutdown,
    /// Creation or attach failed before the record became usable.
    CreateFailed,
}

impl DestroyCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DestroyCause::Requested => "requested",
            DestroyCause::Idle => "idle",
            DestroyCause::Capacity => "capacity",
            DestroyCause::Shutdown => "shutdown",
            DestroyCause::CreateFailed => "create_failed",
        }
    }
}

impl std::fmt::Display for DestroyCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WamuxEvent {
    SessionCreated {
        tenant: TenantId,
        at: DateTime<Utc>,
    },
    SessionStateChanged {
        tenant: TenantId,
        from: SessionState,
        to: SessionState,
        /// Set when `to` is `Disconnected` or the failure came from a disconnect.
        reason: Option<DisconnectReason>,
        at: DateTime<Utc>,
    },
    CredentialChallenge {
        tenant: TenantId,
        data: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    SessionDestroyed {
        tenant: TenantId,
        cause: DestroyCause,
        at: DateTime<Utc>,
    },
    ReconnectScheduled {
        tenant: TenantId,
        /// Zero-based attempt number.
        attempt: u32,
        delay: Duration,
        at: DateTime<Utc>,
    },
    /// The reconnection budget ran out and the session was failed.
    ReconnectExhausted {
        tenant: TenantId,
        attempts: u32,
        at: DateTime<Utc>,
    },
    MessageDelivered {
        job_id: JobId,
        queue: String,
        tenant: TenantId,
        receipt: DeliveryReceipt,
        attempts: u32,
    },
    MessageRetrying {
        job_id: JobId,
        queue: String,
        attempts: u32,
        delay: Duration,
        error: String,
    },
    MessageDeadLettered {
        job_id: JobId,
        queue: String,
        tenant: TenantId,
        reason: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    BreakerStateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
}

impl WamuxEvent {
    pub fn session_created(tenant: TenantId) -> Self {
        WamuxEvent::SessionCreated {
            tenant,
            at: Utc::now(),
        }
    }

    pub fn state_changed(
        tenant: TenantId,
        from: SessionState,
        to: SessionState,
        reason: Option<DisconnectReason>,
    ) -> Self {
        WamuxEvent::SessionStateChanged {
            tenant,
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }

    pub fn destroyed(tenant: TenantId, cause: DestroyCause) -> Self {
        WamuxEvent::SessionDestroyed {
            tenant,
            cause,
            at: Utc::now(),
        }
    }

    /// Short name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WamuxEvent::SessionCreated { .. } => "session_created",
            WamuxEvent::SessionStateChanged { .. } => "session_state_changed",
            WamuxEvent::CredentialChallenge { .. } => "credential_challenge",
            WamuxEvent::SessionDestroyed { .. } => "session_destroyed",
            WamuxEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            WamuxEvent::ReconnectExhausted { .. } => "reconnect_exhausted",
            WamuxEvent::MessageDelivered { .. } => "message_delivered",
            WamuxEvent::MessageRetrying { .. } => "message_retrying",
            WamuxEvent::MessageDeadLettered { .. } => "message_dead_lettered",
            WamuxEvent::BreakerStateChanged { .. } => "breaker_state_changed",
        }
    }

    /// The tenant the event concerns, if any.
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            WamuxEvent::SessionCreated { tenant, .. }
            | WamuxEvent::SessionStateChanged { tenant, .. }
            | WamuxEvent::CredentialChallenge { tenant, .. }
            | WamuxEvent::SessionDestroyed { tenant, .. }
            | WamuxEvent::ReconnectScheduled { tenant, .. }
            | WamuxEvent::ReconnectExhausted { tenant, .. }
            | WamuxEvent::MessageDelivered { tenant, .. }
            | WamuxEvent::MessageDeadLettered { tenant, .. } => Some(tenant),
            WamuxEvent::MessageRetrying { .. } | WamuxEvent::BreakerStateChanged { .. } => None,
        }
    }
}
