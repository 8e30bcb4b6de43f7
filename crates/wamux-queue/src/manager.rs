// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named delivery queues and their worker pools.
//!
//! Each queue runs `concurrency` workers. A worker takes the next runnable
//! job, acquires the target session from the registry, waits for it to be
//! `Ready`, and sends through the tenant's circuit breaker. Failures are
//! retried with the queue's backoff until `max_attempts`, then dead-lettered.
//! Rate-limited sends are deferred without spending an attempt.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wamux_bus::{EventBus, WamuxEvent};
use wamux_config::QueueConfig;
use wamux_core::{DeliveryReceipt, JobId, WamuxError};
use wamux_resilience::{BreakerRegistry, RateLimiter};
use wamux_session::{AcquireOptions, SessionRegistry};

use crate::job::{DeadLetter, EnqueueOptions, Job, JobRequest, JobStatus};
use crate::queue::{Next, Queue, QueueStats};

/// Name of the circuit breaker guarding sends for a tenant.
pub fn send_breaker_name(tenant: &wamux_core::TenantId) -> String {
    format!("send.{tenant}")
}

/// Shared collaborators for delivery.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub registry: SessionRegistry,
    pub breakers: BreakerRegistry,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bus: EventBus,
}

struct Inner {
    ctx: DeliveryContext,
    queues: BTreeMap<String, Arc<Queue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// The set of configured queues.
#[derive(Clone)]
pub struct DeliveryQueues {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeliveryQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueues")
            .field("queues", &self.inner.queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DeliveryQueues {
    pub fn new(configs: &[QueueConfig], ctx: DeliveryContext) -> Self {
        let queues = configs
            .iter()
            .map(|config| (config.name.clone(), Arc::new(Queue::new(config.clone()))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                ctx,
                queues,
                workers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the worker pools. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }
        for queue in self.inner.queues.values() {
            let concurrency = queue.config().concurrency.max(1);
            for index in 0..concurrency {
                let worker = Worker {
                    inner: self.inner.clone(),
                    queue: queue.clone(),
                    index,
                };
                workers.push(tokio::spawn(worker.run()));
            }
            info!(queue = queue.name(), concurrency, "queue workers started");
        }
        if let Some(limiter) = &self.inner.ctx.rate_limiter {
            let rx = self.inner.ctx.bus.subscribe();
            workers.push(tokio::spawn(prune_rate_limits(
                limiter.clone(),
                rx,
                self.inner.shutdown.clone(),
            )));
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.queues.keys().cloned().collect()
    }

    fn queue(&self, name: &str) -> Result<&Arc<Queue>, WamuxError> {
        self.inner.queues.get(name).ok_or_else(|| WamuxError::NotFound {
            kind: "queue",
            id: name.to_string(),
        })
    }

    /// Validates and enqueues a send. The job is durable in memory from here
    /// until it is delivered or dead-lettered.
    pub fn enqueue(
        &self,
        queue: &str,
        request: JobRequest,
        options: EnqueueOptions,
    ) -> Result<JobId, WamuxError> {
        request.validate()?;
        let target = self.queue(queue)?;
        let tenant = request.tenant.clone();
        let job = target.push(request, &options)?;
        self.inner.ctx.registry.work_enqueued(&tenant);
        debug!(
            job_id = %job.id,
            queue,
            tenant = %tenant,
            priority = job.priority,
            "job enqueued"
        );
        export_depth(target);
        Ok(job.id)
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.inner.queues.values().map(|queue| queue.stats()).collect()
    }

    pub fn queue_stats(&self, name: &str) -> Result<QueueStats, WamuxError> {
        Ok(self.queue(name)?.stats())
    }

    pub fn dead_letters(&self, name: &str) -> Result<Vec<DeadLetter>, WamuxError> {
        Ok(self.queue(name)?.dead_letters())
    }

    /// Drops every dead letter in the queue. Returns how many were removed.
    pub fn purge_dead_letters(&self, name: &str) -> Result<usize, WamuxError> {
        let queue = self.queue(name)?;
        let purged = queue.purge_dead_letters().len();
        export_depth(queue);
        Ok(purged)
    }

    /// Moves a dead letter back to pending with its attempt count reset.
    pub fn retry_dead_letter(&self, name: &str, job_id: JobId) -> Result<JobId, WamuxError> {
        let queue = self.queue(name)?;
        let job = queue.revive(job_id).ok_or_else(|| WamuxError::NotFound {
            kind: "dead letter",
            id: job_id.to_string(),
        })?;
        self.inner.ctx.registry.work_enqueued(&job.tenant);
        info!(job_id = %job.id, queue = name, "dead letter requeued");
        export_depth(queue);
        Ok(job.id)
    }

    /// Stops handing out jobs. In-flight jobs still complete.
    pub fn pause(&self, name: &str) -> Result<bool, WamuxError> {
        let changed = self.queue(name)?.set_paused(true);
        if changed {
            info!(queue = name, "queue paused");
        }
        Ok(changed)
    }

    pub fn resume(&self, name: &str) -> Result<bool, WamuxError> {
        let changed = self.queue(name)?.set_paused(false);
        if changed {
            info!(queue = name, "queue resumed");
        }
        Ok(changed)
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.inner
            .queues
            .values()
            .find_map(|queue| queue.status(job_id))
    }

    /// Waits until every queue has no pending or in-flight jobs.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.queues.values().all(|queue| queue.is_idle()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops all workers after their current job.
    ///
    /// Workers still busy at `timeout` are aborted and their jobs returned to
    /// pending. Returns `true` if every worker stopped in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown.cancel();
        for queue in self.inner.queues.values() {
            queue.close();
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        let clean = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !clean {
            aborts.iter().for_each(|handle| handle.abort());
            for queue in self.inner.queues.values() {
                let reclaimed = queue.reclaim_in_flight();
                if reclaimed > 0 {
                    warn!(queue = queue.name(), reclaimed, "drain timed out, in-flight jobs returned to pending");
                }
            }
        }
        for queue in self.inner.queues.values() {
            export_depth(queue);
        }
        info!(clean, "delivery queues stopped");
        clean
    }
}

/// Keeps the rate limiter bounded: keys of destroyed sessions are dropped
/// at once, and keys with no sends in the window on every window tick.
async fn prune_rate_limits(
    limiter: Arc<RateLimiter>,
    mut rx: broadcast::Receiver<WamuxEvent>,
    shutdown: CancellationToken,
) {
    let period = limiter.window().max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = limiter.purge_idle();
                if purged > 0 {
                    debug!(purged, remaining = limiter.tracked_keys(), "idle rate limit keys purged");
                }
            }
            event = rx.recv() => match event {
                Ok(WamuxEvent::SessionDestroyed { tenant, .. }) => limiter.forget_tenant(&tenant),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    limiter.purge_idle();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn export_depth(queue: &Queue) {
    let stats = queue.stats();
    wamux_prometheus::set_queue_depth(
        queue.name(),
        stats.pending,
        stats.in_flight,
        stats.dead_lettered,
    );
}

struct Worker {
    inner: Arc<Inner>,
    queue: Arc<Queue>,
    index: usize,
}

impl Worker {
    async fn run(self) {
        debug!(queue = self.queue.name(), worker = self.index, "worker started");
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.shutdown.is_cancelled() {
                break;
            }

            match self.queue.take_next(Instant::now()) {
                Next::Run(job) => {
                    export_depth(&self.queue);
                    self.process(job).await;
                    export_depth(&self.queue);
                }
                Next::Wait(until) => {
                    let sleep = async {
                        match until {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => break,
                        _ = &mut notified => {}
                        _ = sleep => {}
                    }
                }
            }
        }
        debug!(queue = self.queue.name(), worker = self.index, "worker stopped");
    }

    async fn process(&self, mut job: Job) {
        match self.deliver(&job).await {
            Ok(receipt) => {
                let queue = self.queue.name();
                job.attempts += 1;
                self.queue.complete(job.id);
                self.inner.ctx.registry.work_finished(&job.tenant);
                let latency = job.enqueued.elapsed();
                info!(
                    job_id = %job.id,
                    queue,
                    tenant = %job.tenant,
                    attempts = job.attempts,
                    latency_ms = latency.as_millis() as u64,
                    "message delivered"
                );
                wamux_prometheus::record_job(queue, "delivered");
                wamux_prometheus::record_delivery_latency(queue, latency.as_secs_f64());
                self.inner.ctx.bus.publish(WamuxEvent::MessageDelivered {
                    job_id: job.id,
                    queue: queue.to_string(),
                    tenant: job.tenant.clone(),
                    receipt,
                    attempts: job.attempts,
                });
            }
            Err(WamuxError::RateLimited { retry_after, key }) => {
                debug!(
                    job_id = %job.id,
                    queue = self.queue.name(),
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "send deferred by rate limit"
                );
                wamux_prometheus::record_job(self.queue.name(), "rate_limited");
                self.inner.ctx.bus.publish(WamuxEvent::MessageRetrying {
                    job_id: job.id,
                    queue: self.queue.name().to_string(),
                    attempts: job.attempts,
                    delay: retry_after,
                    error: format!("rate limited for key {key}"),
                });
                job.last_error = Some(format!("rate limited for key {key}"));
                self.queue.requeue(job, retry_after, false);
            }
            Err(err) => self.fail(job, err),
        }
    }

    fn fail(&self, mut job: Job, err: WamuxError) {
        let queue = self.queue.name();
        job.attempts += 1;
        let reason = err.to_string();
        job.last_error = Some(reason.clone());

        if job.attempts < job.max_attempts && err.is_retryable() {
            let delay = self.queue.retry_delay(job.attempts);
            warn!(
                job_id = %job.id,
                queue,
                tenant = %job.tenant,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "delivery failed, retrying"
            );
            wamux_prometheus::record_job(queue, "retried");
            self.inner.ctx.bus.publish(WamuxEvent::MessageRetrying {
                job_id: job.id,
                queue: queue.to_string(),
                attempts: job.attempts,
                delay,
                error: reason,
            });
            self.queue.requeue(job, delay, true);
            return;
        }

        let err = if err.is_retryable() {
            WamuxError::MaxRetriesExceeded {
                subject: format!("job {}", job.id),
                attempts: job.attempts,
                last_error: reason,
            }
        } else {
            err
        };
        let reason = err.to_string();
        warn!(
            job_id = %job.id,
            queue,
            tenant = %job.tenant,
            attempts = job.attempts,
            error = %err,
            "delivery failed permanently, dead-lettering"
        );
        let tenant = job.tenant.clone();
        let letter = self.queue.dead_letter(job, reason);
        self.inner.ctx.registry.work_finished(&tenant);
        wamux_prometheus::record_job(queue, "dead_lettered");
        self.inner.ctx.bus.publish(WamuxEvent::MessageDeadLettered {
            job_id: letter.job.id,
            queue: letter.queue,
            tenant,
            reason: letter.error,
            attempts: letter.attempts,
            at: letter.failed_at,
        });
    }

    async fn deliver(&self, job: &Job) -> Result<DeliveryReceipt, WamuxError> {
        let wait = self.queue.config().acquire_timeout();
        let lease = self
            .inner
            .ctx
            .registry
            .acquire(&job.tenant, AcquireOptions::wait(wait))
            .await?;
        lease.wait_ready(wait).await?;

        if let Some(limiter) = &self.inner.ctx.rate_limiter {
            limiter.check(&job.tenant, &job.recipient)?;
        }

        let breaker = send_breaker_name(&job.tenant);
        self.inner
            .ctx
            .breakers
            .execute(&breaker, || lease.send(&job.recipient, &job.payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use wamux_bus::EventBus;
    use wamux_config::BackoffConfig;
    use wamux_core::{Payload, SessionState, TenantId};
    use wamux_resilience::BreakerSettings;
    use wamux_session::{Checkpointer, RegistrySettings};
    use tracing_test::traced_test;
    use wamux_test_utils::MockClient;

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn fast_queue(name: &str, max_attempts: u32) -> QueueConfig {
        QueueConfig {
            concurrency: 2,
            max_attempts,
            acquire_timeout_ms: 1_000,
            backoff: BackoffConfig {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                jitter: 0.0,
                ..BackoffConfig::default()
            },
            ..QueueConfig::new(name)
        }
    }

    fn queues(client: &MockClient, configs: &[QueueConfig]) -> DeliveryQueues {
        let bus = EventBus::default();
        let registry = SessionRegistry::new(
            Arc::new(client.clone()),
            RegistrySettings::default(),
            bus.clone(),
            Checkpointer::disabled(),
        );
        let breakers = BreakerRegistry::new(BreakerSettings::default());
        DeliveryQueues::new(
            configs,
            DeliveryContext {
                registry,
                breakers,
                rate_limiter: None,
                bus,
            },
        )
    }

    fn send(queues: &DeliveryQueues, queue: &str, to: &str, body: &str) -> JobId {
        queues
            .enqueue(
                queue,
                JobRequest::new(tenant("t"), to, Payload::text(body)),
                EnqueueOptions::default(),
            )
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_releases_pending_work() {
        let client = MockClient::new();
        let queues = queues(&client, &[fast_queue("q", 3)]);
        queues.start();

        let id = send(&queues, "q", "bob", "hello");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(queues.job_status(id), Some(JobStatus::Completed));
        assert_eq!(client.sent_count(), 1);
        let stats = queues.queue_stats("q").unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(queues.inner.ctx.registry.pending_work(&tenant("t")), 0);
        assert_eq!(queues.inner.ctx.registry.state(&tenant("t")), Some(SessionState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_is_dead_lettered_with_error() {
        let client = MockClient::new();
        client.fail_all_sends(true);
        let queues = queues(&client, &[fast_queue("q", 3)]);
        let mut events = queues.inner.ctx.bus.subscribe();
        queues.start();

        let id = send(&queues, "q", "bob", "doomed");
        assert!(queues.wait_idle(Duration::from_secs(30)).await);

        let letters = queues.dead_letters("q").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job.id, id);
        assert_eq!(letters[0].attempts, 3);
        assert!(letters[0].error.contains("exhausted 3 attempts"));
        assert!(letters[0].error.contains("mock send to bob failed"));
        assert_eq!(queues.queue_stats("q").unwrap().retried, 2);
        assert_eq!(queues.inner.ctx.registry.pending_work(&tenant("t")), 0);

        let mut retrying = 0;
        let mut dead = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                WamuxEvent::MessageRetrying { .. } => retrying += 1,
                WamuxEvent::MessageDeadLettered { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    dead += 1;
                }
                _ => {}
            }
        }
        assert_eq!((retrying, dead), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn job_for_failed_session_is_dead_lettered_without_retry() {
        let client = MockClient::new();
        let queues = queues(&client, &[fast_queue("q", 5)]);
        let registry = queues.inner.ctx.registry.clone();
        drop(registry.acquire(&tenant("t"), AcquireOptions::default()).await.unwrap());
        assert!(registry.fail(&tenant("t")).await.unwrap());
        assert_eq!(registry.state(&tenant("t")), Some(SessionState::Failed));
        queues.start();

        let id = send(&queues, "q", "bob", "unreachable");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);

        let letters = queues.dead_letters("q").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job.id, id);
        assert_eq!(letters[0].attempts, 1);
        assert!(!letters[0].error.contains("exhausted"));
        assert_eq!(queues.queue_stats("q").unwrap().retried, 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn dead_lettering_is_logged_with_job_context() {
        let client = MockClient::new();
        client.fail_all_sends(true);
        let queues = queues(&client, &[fast_queue("q", 1)]);
        queues.start();

        let id = send(&queues, "q", "bob", "logged");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert!(logs_contain("delivery failed permanently"));
        assert!(logs_contain(&id.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_retry_resets_attempts() {
        let client = MockClient::new();
        client.fail_all_sends(true);
        let queues = queues(&client, &[fast_queue("q", 1)]);
        queues.start();

        let id = send(&queues, "q", "bob", "again");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(queues.job_status(id), Some(JobStatus::DeadLettered));

        client.fail_all_sends(false);
        assert_eq!(queues.retry_dead_letter("q", id).unwrap(), id);
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(queues.job_status(id), Some(JobStatus::Completed));
        assert!(queues.dead_letters("q").unwrap().is_empty());
        assert!(queues.retry_dead_letter("q", id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let client = MockClient::new();
        client.fail_next_sends(&tenant("t"), 1);
        let queues = queues(&client, &[fast_queue("q", 3)]);
        queues.start();

        let id = send(&queues, "q", "bob", "eventually");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(queues.job_status(id), Some(JobStatus::Completed));
        assert_eq!(queues.queue_stats("q").unwrap().retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_queue_holds_jobs_until_resumed() {
        let client = MockClient::new();
        let queues = queues(&client, &[fast_queue("q", 3)]);
        queues.start();
        assert!(queues.pause("q").unwrap());

        let id = send(&queues, "q", "bob", "held");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queues.job_status(id), Some(JobStatus::Pending));
        assert!(queues.queue_stats("q").unwrap().paused);

        assert!(queues.resume("q").unwrap());
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(client.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_queue_preserves_enqueue_order_across_retries() {
        let client = MockClient::new();
        client.fail_next_sends(&tenant("t"), 2);
        let config = QueueConfig {
            concurrency: 1,
            ordered: true,
            ..fast_queue("ordered", 5)
        };
        let queues = queues(&client, &[config]);
        queues.start();

        for body in ["one", "two", "three"] {
            send(&queues, "ordered", "bob", body);
        }
        assert!(queues.wait_idle(Duration::from_secs(10)).await);

        let bodies: Vec<String> = client
            .sent()
            .into_iter()
            .map(|message| match message.payload {
                Payload::Text { body } => body,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_send_is_deferred_not_failed() {
        let client = MockClient::new();
        let bus = EventBus::default();
        let registry = SessionRegistry::new(
            Arc::new(client.clone()),
            RegistrySettings::default(),
            bus.clone(),
            Checkpointer::disabled(),
        );
        let queues = DeliveryQueues::new(
            &[QueueConfig {
                concurrency: 1,
                ..fast_queue("q", 1)
            }],
            DeliveryContext {
                registry,
                breakers: BreakerRegistry::new(BreakerSettings::default()),
                rate_limiter: Some(Arc::new(RateLimiter::new(1, Duration::from_secs(10)))),
                bus: bus.clone(),
            },
        );
        let mut events = bus.subscribe();
        queues.start();

        let first = send(&queues, "q", "bob", "one");
        let second = send(&queues, "q", "bob", "two");
        assert!(queues.wait_idle(Duration::from_secs(30)).await);

        assert_eq!(queues.job_status(first), Some(JobStatus::Completed));
        assert_eq!(queues.job_status(second), Some(JobStatus::Completed));
        assert!(queues.dead_letters("q").unwrap().is_empty());

        let mut rate_limited = false;
        while let Ok(event) = events.try_recv() {
            if let WamuxEvent::MessageRetrying { job_id, error, attempts, .. } = event {
                assert_eq!(job_id, second);
                assert_eq!(attempts, 0);
                assert!(error.contains("rate limited"));
                rate_limited = true;
            }
        }
        assert!(rate_limited);
    }

    fn limited_queues(client: &MockClient, limiter: Arc<RateLimiter>) -> DeliveryQueues {
        let bus = EventBus::default();
        let registry = SessionRegistry::new(
            Arc::new(client.clone()),
            RegistrySettings::default(),
            bus.clone(),
            Checkpointer::disabled(),
        );
        DeliveryQueues::new(
            &[fast_queue("q", 1)],
            DeliveryContext {
                registry,
                breakers: BreakerRegistry::new(BreakerSettings::default()),
                rate_limiter: Some(limiter),
                bus,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_keys_are_purged_once_idle() {
        let client = MockClient::new();
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(10)));
        let queues = limited_queues(&client, limiter.clone());
        queues.start();

        send(&queues, "q", "bob", "one");
        send(&queues, "q", "carol", "two");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_session_drops_its_rate_limit_keys() {
        let client = MockClient::new();
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let queues = limited_queues(&client, limiter.clone());
        queues.start();

        send(&queues, "q", "bob", "one");
        assert!(queues.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(limiter.tracked_keys(), 1);

        let registry = &queues.inner.ctx.registry;
        assert!(registry.destroy(&tenant("t"), wamux_bus::DestroyCause::Requested).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_validates_request_and_queue() {
        let client = MockClient::new();
        let queues = queues(&client, &[fast_queue("q", 3)]);
        let request = JobRequest::new(tenant("t"), "bob", Payload::text("hi"));

        let missing = queues.enqueue("nope", request.clone(), EnqueueOptions::default());
        assert!(matches!(missing, Err(WamuxError::NotFound { kind: "queue", .. })));

        let blank = JobRequest::new(tenant("t"), "", Payload::text("hi"));
        assert!(matches!(
            queues.enqueue("q", blank, EnqueueOptions::default()),
            Err(WamuxError::Validation(_))
        ));
        assert_eq!(queues.inner.ctx.registry.pending_work(&tenant("t")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_finishes_in_flight_and_rejects_new_work() {
        let client = MockClient::new();
        client.set_send_delay(Some(Duration::from_millis(500)));
        let queues = queues(&client, &[fast_queue("q", 3)]);
        queues.start();

        let id = send(&queues, "q", "bob", "last");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(queues.job_status(id), Some(JobStatus::InFlight));

        assert!(queues.shutdown(Duration::from_secs(5)).await);
        assert_eq!(queues.job_status(id), Some(JobStatus::Completed));
        let late = queues.enqueue(
            "q",
            JobRequest::new(tenant("t"), "bob", Payload::text("late")),
            EnqueueOptions::default(),
        );
        assert!(late.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_returns_jobs_to_pending() {
        let client = MockClient::new();
        client.set_send_delay(Some(Duration::from_secs(60)));
        let queues = queues(&client, &[fast_queue("q", 3)]);
        queues.start();

        let id = send(&queues, "q", "bob", "stuck");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!queues.shutdown(Duration::from_secs(1)).await);
        assert_eq!(queues.job_status(id), Some(JobStatus::Pending));
    }
}
