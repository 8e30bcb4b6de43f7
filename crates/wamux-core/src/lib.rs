// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Wamux session orchestrator.
//!
//! This crate provides the error taxonomy, the session state machine, shared
//! identifier and projection types, and the traits for the external
//! collaborators (chat client, checkpoint store) the orchestrator drives.

pub mod error;
pub mod state;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::WamuxError;
pub use state::{CircuitState, SessionState};
pub use types::{
    DeliveryReceipt, DisconnectReason, HealthStatus, JobId, Payload, PoolStats, SessionMetrics,
    SessionSnapshot, TenantId,
};

pub use traits::{ChatClient, ClientEvent, ClientEventKind, ClientEventSink, ClientHandle, KvStore};
