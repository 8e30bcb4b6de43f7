// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Wamux session orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::state::SessionState;

/// The primary error type used across the registry, scheduler, breaker and queue.
#[derive(Debug, Error)]
pub enum WamuxError {
    /// The pool is full and no idle record could be evicted.
    #[error("session pool at capacity ({capacity}) with no idle session to evict")]
    CapacityExceeded { capacity: usize },

    /// The caller-supplied wait for pool capacity elapsed.
    #[error("timed out after {waited:?} waiting to acquire session {tenant}")]
    AcquireTimeout { tenant: String, waited: Duration },

    /// The session exists but cannot serve the request in its current state.
    #[error("session {tenant} is unhealthy ({state}): {reason}")]
    SessionUnhealthy {
        tenant: String,
        state: SessionState,
        reason: String,
    },

    /// The circuit breaker guarding `operation` is open.
    #[error("circuit `{operation}` is open, next attempt in {retry_in:?}")]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    /// The per-recipient sliding window is exhausted.
    #[error("rate limited on {key}, retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    /// A reconnection or delivery budget was exhausted.
    #[error("{subject} exhausted {attempts} attempts, last error: {last_error}")]
    MaxRetriesExceeded {
        subject: String,
        attempts: u32,
        last_error: String,
    },

    /// Malformed job or session request.
    #[error("validation error: {0}")]
    Validation(String),

    /// Opaque failure surfaced by the external chat client.
    #[error("external client error: {message}")]
    ExternalClient {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An external call did not complete in time.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// A state change not permitted by the session state machine.
    #[error("illegal transition for session {tenant}: {from} -> {to}")]
    InvalidTransition {
        tenant: String,
        from: SessionState,
        to: SessionState,
    },

    /// A referenced session, queue or job does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store errors.
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WamuxError {
    /// Shorthand for an [`ExternalClient`](Self::ExternalClient) error without a source.
    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalClient {
            message: message.into(),
            source: None,
        }
    }

    /// Whether a retry of the same request may succeed later.
    ///
    /// A `Failed` session stays failed until it is destroyed, so
    /// `SessionUnhealthy` is only retryable for the other states.
    pub fn is_retryable(&self) -> bool {
        if let Self::SessionUnhealthy { state, .. } = self {
            return *state != SessionState::Failed;
        }
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::AcquireTimeout { .. }
                | Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::ExternalClient { .. }
                | Self::Timeout { .. }
                | Self::Storage { .. }
        )
    }

    /// Whether a circuit breaker should record this error as a failure.
    ///
    /// Throttling and malformed requests say nothing about the health of the
    /// guarded dependency.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::RateLimited { .. } | Self::Validation(_))
    }

    /// Short machine-readable name of the error kind, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AcquireTimeout { .. } => "acquire_timeout",
            Self::SessionUnhealthy { .. } => "session_unhealthy",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::Validation(_) => "validation",
            Self::ExternalClient { .. } => "external_client",
            Self::Timeout { .. } => "timeout",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::Config(_) => "config",
            Self::Storage { .. } => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let rate = WamuxError::RateLimited {
            key: "a:b".into(),
            retry_after: Duration::from_secs(1),
        };
        let open = WamuxError::CircuitOpen {
            operation: "send".into(),
            retry_in: Duration::from_secs(1),
        };
        assert!(rate.is_retryable());
        assert!(open.is_retryable());
        assert!(WamuxError::external("boom").is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!WamuxError::Validation("empty".into()).is_retryable());
        assert!(
            !WamuxError::MaxRetriesExceeded {
                subject: "job".into(),
                attempts: 3,
                last_error: "boom".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn failed_sessions_are_not_retryable() {
        let unhealthy = |state| WamuxError::SessionUnhealthy {
            tenant: "t1".into(),
            state,
            reason: "test".into(),
        };
        assert!(!unhealthy(SessionState::Failed).is_retryable());
        assert!(unhealthy(SessionState::Disconnected).is_retryable());
        assert!(unhealthy(SessionState::Recovering).is_retryable());
    }

    #[test]
    fn exhausted_budget_names_the_last_error() {
        let err = WamuxError::MaxRetriesExceeded {
            subject: "job 42".into(),
            attempts: 3,
            last_error: "external client error: down".into(),
        };
        assert_eq!(
            err.to_string(),
            "job 42 exhausted 3 attempts, last error: external client error: down"
        );
    }

    #[test]
    fn rate_limit_does_not_trip_breakers() {
        let rate = WamuxError::RateLimited {
            key: "a:b".into(),
            retry_after: Duration::from_millis(10),
        };
        assert!(!rate.counts_against_breaker());
        assert!(!WamuxError::Validation("x".into()).counts_against_breaker());
        assert!(WamuxError::external("down").counts_against_breaker());
    }

    #[test]
    fn display_includes_context() {
        let err = WamuxError::InvalidTransition {
            tenant: "t1".into(),
            from: SessionState::Failed,
            to: SessionState::Ready,
        };
        assert_eq!(
            err.to_string(),
            "illegal transition for session t1: failed -> ready"
        );
    }
}
