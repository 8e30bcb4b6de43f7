// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Wamux engine: one handle over the session pool, the reconnection
//! scheduler, the health monitor and the delivery queues.

pub mod engine;
pub mod outcome;

pub use engine::Engine;
pub use outcome::{CreateSessionOutcome, SendOptions, ShutdownReport};
