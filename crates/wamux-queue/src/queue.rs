// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage for one named queue: pending jobs, in-flight jobs and the DLQ.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use wamux_config::QueueConfig;
use wamux_core::{JobId, WamuxError};
use wamux_resilience::BackoffPolicy;

use crate::job::{DeadLetter, EnqueueOptions, Job, JobRequest, JobStatus};

/// How many completed job ids a queue remembers for status lookups.
const COMPLETED_HISTORY: usize = 1024;

type Key = (Reverse<i32>, u64);

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    /// Jobs waiting for a worker, including ones in backoff.
    pub pending: usize,
    /// Pending jobs whose next attempt is not due yet.
    pub delayed: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: usize,
    pub paused: bool,
    pub concurrency: usize,
}

/// What a worker should do next.
#[derive(Debug)]
pub(crate) enum Next {
    Run(Job),
    /// Nothing runnable. Wake at the instant, or on notify if `None`.
    Wait(Option<Instant>),
}

#[derive(Debug, Default)]
struct State {
    pending: BTreeMap<Key, Job>,
    in_flight: HashMap<JobId, Job>,
    dead: Vec<DeadLetter>,
    recent: VecDeque<JobId>,
    completed: u64,
    retried: u64,
    next_seq: u64,
    paused: bool,
    closed: bool,
}

impl State {
    fn insert(&mut self, job: Job) {
        self.pending.insert((Reverse(job.priority), job.seq), job);
    }

    fn position(&self, id: JobId) -> Option<Key> {
        self.pending
            .iter()
            .find(|(_, job)| job.id == id)
            .map(|(key, _)| *key)
    }
}

#[derive(Debug)]
pub(crate) struct Queue {
    config: QueueConfig,
    policy: BackoffPolicy,
    state: Mutex<State>,
    pub(crate) notify: Notify,
}

impl Queue {
    pub(crate) fn new(config: QueueConfig) -> Self {
        let policy = BackoffPolicy::from(&config.backoff);
        Self {
            config,
            policy,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Delay before the attempt following `attempts` failed ones.
    pub(crate) fn retry_delay(&self, attempts: u32) -> Duration {
        self.policy.delay(attempts.saturating_sub(1))
    }

    pub(crate) fn push(
        &self,
        request: JobRequest,
        options: &EnqueueOptions,
    ) -> Result<Job, WamuxError> {
        let mut state = self.state();
        if state.closed {
            return Err(WamuxError::Internal(format!(
                "queue {} is shut down",
                self.config.name
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let job = Job::new(
            &self.config.name,
            request,
            options.max_attempts.unwrap_or(self.config.max_attempts),
            options.priority,
            seq,
            options.delay.unwrap_or_default(),
        );
        state.insert(job.clone());
        drop(state);
        self.notify.notify_waiters();
        Ok(job)
    }

    /// Moves the next runnable job to in-flight.
    ///
    /// Ordered queues only ever look at the head, so a job in backoff holds
    /// back everything behind it.
    pub(crate) fn take_next(&self, now: Instant) -> Next {
        let mut state = self.state();
        if state.paused || state.closed {
            return Next::Wait(None);
        }

        let key = if self.config.ordered {
            match state.pending.iter().next() {
                Some((_, job)) if state.in_flight.is_empty() && !job.is_due(now) => {
                    return Next::Wait(Some(job.not_before));
                }
                Some((key, _)) if state.in_flight.is_empty() => Some(*key),
                _ => None,
            }
        } else {
            state
                .pending
                .iter()
                .find(|(_, job)| job.is_due(now))
                .map(|(key, _)| *key)
        };

        match key.and_then(|key| state.pending.remove(&key)) {
            Some(job) => {
                state.in_flight.insert(job.id, job.clone());
                Next::Run(job)
            }
            None if self.config.ordered => Next::Wait(None),
            None => Next::Wait(state.pending.values().map(|job| job.not_before).min()),
        }
    }

    pub(crate) fn complete(&self, id: JobId) {
        let mut state = self.state();
        state.in_flight.remove(&id);
        state.completed += 1;
        state.recent.push_back(id);
        if state.recent.len() > COMPLETED_HISTORY {
            state.recent.pop_front();
        }
    }

    /// Returns an in-flight job to pending, eligible again after `delay`.
    pub(crate) fn requeue(&self, mut job: Job, delay: Duration, counted: bool) {
        let mut state = self.state();
        state.in_flight.remove(&job.id);
        if counted {
            state.retried += 1;
        }
        job.not_before = Instant::now() + delay;
        state.insert(job);
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn dead_letter(&self, job: Job, error: String) -> DeadLetter {
        let letter = DeadLetter {
            queue: self.config.name.clone(),
            attempts: job.attempts,
            failed_at: Utc::now(),
            error,
            job,
        };
        let mut state = self.state();
        state.in_flight.remove(&letter.job.id);
        state.dead.push(letter.clone());
        letter
    }

    pub(crate) fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead.clone()
    }

    /// Moves a dead letter back to pending with a fresh attempt budget.
    pub(crate) fn revive(&self, id: JobId) -> Option<Job> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        let index = state.dead.iter().position(|letter| letter.job.id == id)?;
        let mut job = state.dead.remove(index).job;
        job.attempts = 0;
        job.last_error = None;
        job.not_before = Instant::now();
        state.insert(job.clone());
        drop(state);
        self.notify.notify_waiters();
        Some(job)
    }

    pub(crate) fn purge_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.state().dead)
    }

    /// Returns whether the pause flag changed.
    pub(crate) fn set_paused(&self, paused: bool) -> bool {
        let mut state = self.state();
        if state.paused == paused {
            return false;
        }
        state.paused = paused;
        drop(state);
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    /// Puts jobs abandoned mid-flight back at the front of their priority band.
    pub(crate) fn reclaim_in_flight(&self) -> usize {
        let mut state = self.state();
        let jobs: Vec<Job> = state.in_flight.drain().map(|(_, job)| job).collect();
        let count = jobs.len();
        for job in jobs {
            state.insert(job);
        }
        count
    }

    pub(crate) fn status(&self, id: JobId) -> Option<JobStatus> {
        let state = self.state();
        if state.in_flight.contains_key(&id) {
            Some(JobStatus::InFlight)
        } else if state.position(id).is_some() {
            Some(JobStatus::Pending)
        } else if state.dead.iter().any(|letter| letter.job.id == id) {
            Some(JobStatus::DeadLettered)
        } else if state.recent.contains(&id) {
            Some(JobStatus::Completed)
        } else {
            None
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let state = self.state();
        QueueStats {
            name: self.config.name.clone(),
            pending: state.pending.len(),
            delayed: state.pending.values().filter(|job| !job.is_due(now)).count(),
            in_flight: state.in_flight.len(),
            completed: state.completed,
            retried: state.retried,
            dead_lettered: state.dead.len(),
            paused: state.paused,
            concurrency: self.config.concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use wamux_core::{Payload, TenantId};

    use super::*;

    fn request(body: &str) -> JobRequest {
        JobRequest::new(TenantId::parse("t").unwrap(), "bob", Payload::text(body))
    }

    fn body(job: &Job) -> String {
        match &job.payload {
            Payload::Text { body } => body.clone(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    fn run(queue: &Queue) -> Job {
        match queue.take_next(Instant::now()) {
            Next::Run(job) => job,
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_first_then_fifo() {
        let queue = Queue::new(QueueConfig::new("q"));
        queue.push(request("a"), &EnqueueOptions::default()).unwrap();
        queue.push(request("b"), &EnqueueOptions::default()).unwrap();
        let urgent = EnqueueOptions {
            priority: 5,
            ..EnqueueOptions::default()
        };
        queue.push(request("c"), &urgent).unwrap();

        assert_eq!(body(&run(&queue)), "c");
        assert_eq!(body(&run(&queue)), "a");
        assert_eq!(body(&run(&queue)), "b");
        assert!(matches!(queue.take_next(Instant::now()), Next::Wait(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_are_skipped_until_due() {
        let queue = Queue::new(QueueConfig::new("q"));
        let later = EnqueueOptions {
            delay: Some(Duration::from_secs(5)),
            ..EnqueueOptions::default()
        };
        queue.push(request("late"), &later).unwrap();
        queue.push(request("now"), &EnqueueOptions::default()).unwrap();

        assert_eq!(body(&run(&queue)), "now");
        match queue.take_next(Instant::now()) {
            Next::Wait(Some(at)) => assert_eq!(at, Instant::now() + Duration::from_secs(5)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.stats().delayed, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(body(&run(&queue)), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_queue_never_lets_later_jobs_overtake() {
        let queue = Queue::new(QueueConfig {
            concurrency: 1,
            ordered: true,
            ..QueueConfig::new("ordered")
        });
        queue.push(request("first"), &EnqueueOptions::default()).unwrap();
        queue.push(request("second"), &EnqueueOptions::default()).unwrap();

        let first = run(&queue);
        assert!(matches!(queue.take_next(Instant::now()), Next::Wait(None)));

        queue.requeue(first, Duration::from_secs(2), true);
        assert!(matches!(queue.take_next(Instant::now()), Next::Wait(Some(_))));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(body(&run(&queue)), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn every_job_lives_in_exactly_one_place() {
        let queue = Queue::new(QueueConfig::new("q"));
        let a = queue.push(request("a"), &EnqueueOptions::default()).unwrap();
        let b = queue.push(request("b"), &EnqueueOptions::default()).unwrap();
        assert_eq!(queue.status(a.id), Some(JobStatus::Pending));

        let job = run(&queue);
        assert_eq!(queue.status(job.id), Some(JobStatus::InFlight));
        queue.complete(job.id);
        assert_eq!(queue.status(a.id), Some(JobStatus::Completed));

        let job = run(&queue);
        queue.dead_letter(job, "boom".into());
        assert_eq!(queue.status(b.id), Some(JobStatus::DeadLettered));

        let stats = queue.stats();
        assert_eq!((stats.pending, stats.in_flight, stats.completed, stats.dead_lettered), (0, 0, 1, 1));

        let revived = queue.revive(b.id).unwrap();
        assert_eq!(revived.attempts, 0);
        assert_eq!(queue.status(b.id), Some(JobStatus::Pending));
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_and_closed_queues_hand_out_nothing() {
        let queue = Queue::new(QueueConfig::new("q"));
        queue.push(request("a"), &EnqueueOptions::default()).unwrap();
        assert!(queue.set_paused(true));
        assert!(!queue.set_paused(true));
        assert!(matches!(queue.take_next(Instant::now()), Next::Wait(None)));
        assert!(queue.set_paused(false));

        let job = run(&queue);
        assert_eq!(queue.reclaim_in_flight(), 1);
        assert_eq!(queue.status(job.id), Some(JobStatus::Pending));

        queue.close();
        assert!(matches!(queue.take_next(Instant::now()), Next::Wait(None)));
        assert!(queue.push(request("b"), &EnqueueOptions::default()).is_err());
    }
}
