// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session pool for the Wamux orchestrator.
//!
//! - [`SessionRegistry`] owns every tenant session, enforces capacity and
//!   serializes per-tenant access; callers hold a [`SessionLease`].
//! - [`ReconnectScheduler`] recovers disconnected sessions with backoff.
//! - [`HealthMonitor`] probes live sessions and evicts idle ones.
//! - [`Checkpointer`] mirrors session projections into a [`wamux_core::KvStore`].

pub mod checkpoint;
pub mod lease;
pub mod memory;
pub mod monitor;
pub mod registry;
pub mod scheduler;

pub use checkpoint::Checkpointer;
pub use lease::SessionLease;
pub use memory::InMemoryKvStore;
pub use monitor::{HealthMonitor, HealthReport, MonitorSettings};
pub use registry::{AcquireOptions, RecoveryOutcome, RegistrySettings, SessionRegistry};
pub use scheduler::{PendingReconnect, ReconnectScheduler, SchedulerSettings};
