// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and response shapes of the engine's inbound calls.

use std::time::Duration;

use serde::Serialize;
use wamux_core::{SessionState, WamuxError};

/// Result of `create_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSessionOutcome {
    /// Current state, or `None` if no record exists after the call.
    pub status: Option<SessionState>,
    /// Whether a failed call is worth retrying.
    pub retryable: bool,
    /// The call created the record (as opposed to finding it).
    pub created: bool,
    pub error: Option<String>,
}

impl CreateSessionOutcome {
    pub(crate) fn ok(status: SessionState, created: bool) -> Self {
        Self {
            status: Some(status),
            retryable: false,
            created,
            error: None,
        }
    }

    pub(crate) fn failed(status: Option<SessionState>, err: &WamuxError) -> Self {
        Self {
            status,
            retryable: err.is_retryable(),
            created: false,
            error: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Options for `send_message`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Target queue. Defaults to the `outbound` queue.
    pub queue: Option<String>,
    pub priority: i32,
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl SendOptions {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
            ..Self::default()
        }
    }
}

/// What `Engine::shutdown` managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every queue worker stopped within the drain timeout.
    pub drained: bool,
    pub sessions_destroyed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_outcome_carries_retryability() {
        let capacity = WamuxError::CapacityExceeded { capacity: 2 };
        let outcome = CreateSessionOutcome::failed(None, &capacity);
        assert!(outcome.retryable);
        assert!(!outcome.is_ok());

        let invalid = WamuxError::Validation("bad id".into());
        assert!(!CreateSessionOutcome::failed(None, &invalid).retryable);
    }

    #[test]
    fn outcome_serializes_state_in_snake_case() {
        let json = serde_json::to_value(CreateSessionOutcome::ok(SessionState::WaitingCredential, true)).unwrap();
        assert_eq!(json["status"], "waiting_credential");
        assert_eq!(json["created"], true);
    }
}
