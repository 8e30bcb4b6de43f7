// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Priority delivery queues with retry, dead-lettering and per-queue
//! worker pools for the Wamux session orchestrator.

pub mod job;
pub mod manager;
pub mod queue;

pub use job::{DeadLetter, EnqueueOptions, Job, JobRequest, JobStatus};
pub use manager::{DeliveryContext, DeliveryQueues, send_breaker_name};
pub use queue::QueueStats;
