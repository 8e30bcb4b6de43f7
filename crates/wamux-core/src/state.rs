// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle state machine for a single tenant session.
//!
//! ```text
//! Initializing -> WaitingCredential -> Authenticated -> Ready
//!                      ^   |                              |
//!                      +---+                         Disconnected <-+
//!                                                         |         |
//!                                                    Recovering ----+
//!                                                         |
//!                                                       Ready
//! ```
//!
//! Every non-terminal state may also move straight to `Failed`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States of a session record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Record created, external client being created and attached.
    Initializing,
    /// External client issued a credential challenge (e.g. a pairing QR code).
    WaitingCredential,
    /// Credential accepted, channel not yet fully operational.
    Authenticated,
    /// Channel fully operational.
    Ready,
    /// External client signalled a drop. No handle is attached.
    Disconnected,
    /// A reconnection attempt is in progress.
    Recovering,
    /// Terminal until the record is destroyed and acquired again.
    Failed,
}

impl SessionState {
    /// All states, in lifecycle order.
    pub const ALL: [SessionState; 7] = [
        SessionState::Initializing,
        SessionState::WaitingCredential,
        SessionState::Authenticated,
        SessionState::Ready,
        SessionState::Disconnected,
        SessionState::Recovering,
        SessionState::Failed,
    ];

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Initializing` and `Recovering` may skip the credential step when the
    /// external client resumes from stored credentials.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self == Failed {
            return false;
        }
        if next == Failed {
            return true;
        }

        matches!(
            (self, next),
            (Initializing, WaitingCredential | Authenticated | Ready | Disconnected)
                | (WaitingCredential, WaitingCredential | Authenticated | Disconnected)
                | (Authenticated, Ready | Disconnected)
                | (Ready, Disconnected)
                | (Disconnected, Recovering)
                | (
                    Recovering,
                    WaitingCredential | Authenticated | Ready | Disconnected
                )
        )
    }

    /// States in which an external handle must be attached.
    pub fn requires_handle(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Authenticated)
    }

    /// States in which no external handle may be attached.
    pub fn forbids_handle(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }

    /// Whether the channel can carry outbound traffic.
    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }

    /// Whether the health monitor should probe a record in this state.
    pub fn is_probeable(self) -> bool {
        self.requires_handle()
    }

    /// Whether the state only leaves via destroy.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Failed
    }
}

/// States of a circuit breaker.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}
