// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Jobs and dead letters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use wamux_core::{JobId, Payload, TenantId, WamuxError};

/// What to deliver, and to whom.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub tenant: TenantId,
    pub recipient: String,
    pub payload: Payload,
}

impl JobRequest {
    pub fn new(tenant: TenantId, recipient: impl Into<String>, payload: Payload) -> Self {
        Self {
            tenant,
            recipient: recipient.into(),
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), WamuxError> {
        if self.recipient.trim().is_empty() {
            return Err(WamuxError::Validation("recipient must not be empty".into()));
        }
        self.payload.validate()
    }
}

/// Per-job overrides of the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first. Equal priorities run in enqueue order.
    pub priority: i32,
    pub max_attempts: Option<u32>,
    /// Hold the job back for this long before its first attempt.
    pub delay: Option<Duration>,
}

/// A unit of outbound work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub tenant: TenantId,
    pub recipient: String,
    pub payload: Payload,
    /// Completed (failed) attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) seq: u64,
    #[serde(skip)]
    pub(crate) not_before: Instant,
    #[serde(skip)]
    pub(crate) enqueued: Instant,
}

impl Job {
    pub(crate) fn new(
        queue: &str,
        request: JobRequest,
        max_attempts: u32,
        priority: i32,
        seq: u64,
        delay: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: JobId::new(),
            queue: queue.to_string(),
            tenant: request.tenant,
            recipient: request.recipient,
            payload: request.payload,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            priority,
            enqueued_at: Utc::now(),
            last_error: None,
            seq,
            not_before: now + delay,
            enqueued: now,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.not_before <= now
    }
}

/// A job that exhausted its attempts, with its failure context.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: Job,
    /// Queue the job was dead-lettered from.
    pub queue: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Where a job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Completed,
    DeadLettered,
}
