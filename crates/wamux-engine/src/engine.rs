// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Component wiring and the inbound call surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wamux_bus::{DestroyCause, EventBus, WamuxEvent};
use wamux_config::{DEFAULT_QUEUE, WamuxConfig};
use wamux_core::{
    ChatClient, JobId, KvStore, Payload, PoolStats, SessionSnapshot, SessionState, TenantId,
    WamuxError,
};
use wamux_queue::{
    DeadLetter, DeliveryContext, DeliveryQueues, EnqueueOptions, JobRequest, JobStatus, QueueStats,
};
use wamux_resilience::{BreakerRegistry, BreakerSettings, BreakerStats, RateLimiter};
use wamux_session::{
    AcquireOptions, Checkpointer, HealthMonitor, MonitorSettings, PendingReconnect,
    ReconnectScheduler, RegistrySettings, SchedulerSettings, SessionRegistry,
};

use crate::outcome::{CreateSessionOutcome, SendOptions, ShutdownReport};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 1024;

/// The orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    config: Arc<WamuxConfig>,
    bus: EventBus,
    registry: SessionRegistry,
    scheduler: ReconnectScheduler,
    monitor: HealthMonitor,
    breakers: BreakerRegistry,
    queues: DeliveryQueues,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    started: Arc<AtomicBool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.registry.len())
            .field("queues", &self.queues.names())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds every component from `config`. Nothing runs until [`Engine::start`].
    ///
    /// Checkpointing needs a `store`; without one it is off regardless of
    /// `[checkpoint] enabled`.
    pub fn new(
        config: WamuxConfig,
        client: Arc<dyn ChatClient>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Self {
        let bus = EventBus::new(EVENT_CAPACITY);
        let checkpointer = match store {
            Some(store) => Checkpointer::new(store, &config.checkpoint),
            None => Checkpointer::disabled(),
        };
        let registry = SessionRegistry::new(
            client,
            RegistrySettings::from(&config.pool),
            bus.clone(),
            checkpointer,
        );
        let scheduler =
            ReconnectScheduler::new(registry.clone(), SchedulerSettings::from(&config.reconnect));
        let monitor = HealthMonitor::new(
            registry.clone(),
            MonitorSettings::from_config(&config.health, &config.pool),
        );
        let breakers =
            BreakerRegistry::new(BreakerSettings::from(&config.breaker)).with_bus(bus.clone());
        let queues = DeliveryQueues::new(
            &config.queues,
            DeliveryContext {
                registry: registry.clone(),
                breakers: breakers.clone(),
                rate_limiter: RateLimiter::from_config(&config.rate_limit).map(Arc::new),
                bus: bus.clone(),
            },
        );

        Self {
            config: Arc::new(config),
            bus,
            registry,
            scheduler,
            monitor,
            breakers,
            queues,
            tasks: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the scheduler, the health monitor and the queue workers.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("engine already started");
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(self.scheduler.spawn());
        tasks.push(self.monitor.spawn());
        self.queues.start();
        info!(
            capacity = self.config.pool.capacity,
            queues = self.config.queues.len(),
            "engine started"
        );
    }

    pub fn config(&self) -> &WamuxConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ReconnectScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn queues(&self) -> &DeliveryQueues {
        &self.queues
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WamuxEvent> {
        self.bus.subscribe()
    }

    // --- Sessions ---

    /// Creates (or finds) the session for `tenant`.
    ///
    /// Never waits for capacity: a full pool with nothing evictable comes
    /// back as a retryable failure.
    pub async fn create_session(&self, tenant: &TenantId) -> CreateSessionOutcome {
        let existed = self.registry.contains(tenant);
        match self.registry.acquire(tenant, AcquireOptions::default()).await {
            Ok(lease) => {
                let outcome = CreateSessionOutcome::ok(lease.state(), !existed);
                lease.release();
                outcome
            }
            Err(err) => {
                warn!(tenant = %tenant, error = %err, "create session failed");
                CreateSessionOutcome::failed(self.registry.state(tenant), &err)
            }
        }
    }

    /// Tears the session down and deletes its checkpoint.
    pub async fn destroy_session(&self, tenant: &TenantId) -> bool {
        self.registry.destroy(tenant, DestroyCause::Requested).await
    }

    pub fn get_session_status(&self, tenant: &TenantId) -> Option<SessionState> {
        self.registry.state(tenant)
    }

    pub fn session_snapshot(&self, tenant: &TenantId) -> Option<SessionSnapshot> {
        self.registry.snapshot(tenant)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.list()
    }

    /// Re-acquires a checkpointed session after a restart.
    ///
    /// Returns the resulting state, or `None` when there was nothing to restore.
    pub async fn restore_session(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<SessionState>, WamuxError> {
        let lease = self.registry.restore(tenant).await?;
        Ok(lease.map(|lease| lease.state()))
    }

    /// The last credential challenge published for `tenant`, if still stored.
    pub async fn pending_challenge(&self, tenant: &TenantId) -> Option<String> {
        self.registry.pending_challenge(tenant).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.registry.pool_stats()
    }

    // --- Reconnection ---

    pub fn cancel_reconnection(&self, tenant: &TenantId) -> bool {
        self.scheduler.cancel_reconnection(tenant)
    }

    /// Lifts a cancellation and schedules an attempt if the session is
    /// still disconnected. Returns the delay of that attempt.
    pub async fn resume_reconnection(&self, tenant: &TenantId) -> Option<Duration> {
        self.scheduler.resume_reconnection(tenant).await
    }

    pub fn pending_reconnection(&self, tenant: &TenantId) -> Option<PendingReconnect> {
        self.scheduler.pending_for(tenant)
    }

    // --- Delivery ---

    pub fn send_message(
        &self,
        tenant: &TenantId,
        recipient: &str,
        payload: Payload,
        options: SendOptions,
    ) -> Result<JobId, WamuxError> {
        let queue = options.queue.as_deref().unwrap_or(DEFAULT_QUEUE);
        self.queues.enqueue(
            queue,
            JobRequest::new(tenant.clone(), recipient, payload),
            EnqueueOptions {
                priority: options.priority,
                max_attempts: options.max_attempts,
                delay: options.delay,
            },
        )
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.queues.job_status(job_id)
    }

    pub fn get_queue_stats(&self) -> Vec<QueueStats> {
        self.queues.stats()
    }

    pub fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, WamuxError> {
        self.queues.dead_letters(queue)
    }

    pub fn retry_dead_letter(&self, queue: &str, job_id: JobId) -> Result<JobId, WamuxError> {
        self.queues.retry_dead_letter(queue, job_id)
    }

    pub fn purge_dead_letters(&self, queue: &str) -> Result<usize, WamuxError> {
        self.queues.purge_dead_letters(queue)
    }

    pub fn pause_queue(&self, queue: &str) -> Result<bool, WamuxError> {
        self.queues.pause(queue)
    }

    pub fn resume_queue(&self, queue: &str) -> Result<bool, WamuxError> {
        self.queues.resume(queue)
    }

    // --- Breakers ---

    pub fn reset_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name)
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.stats()
    }

    // --- Lifecycle ---

    /// Stops background work, drains the queues and destroys every session.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        info!(drain_timeout = ?drain_timeout, "engine shutting down");
        self.scheduler.shutdown();
        self.monitor.shutdown();

        let drained = self.queues.shutdown(drain_timeout).await;
        let sessions_destroyed = self.registry.shutdown().await;

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await
                && err.is_panic()
            {
                warn!(error = %err, "background task panicked");
            }
        }

        let report = ShutdownReport {
            drained,
            sessions_destroyed,
        };
        info!(
            drained = report.drained,
            sessions = report.sessions_destroyed,
            "engine stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use wamux_config::PoolConfig;
    use wamux_test_utils::MockClient;

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn engine(client: &MockClient, capacity: usize) -> Engine {
        let config = WamuxConfig {
            pool: PoolConfig {
                capacity,
                ..PoolConfig::default()
            },
            ..WamuxConfig::default()
        };
        Engine::new(config, Arc::new(client.clone()), None)
    }

    #[tokio::test(start_paused = true)]
    async fn create_session_reports_creation_once() {
        let client = MockClient::new();
        let engine = engine(&client, 4);

        let first = engine.create_session(&tenant("a")).await;
        assert!(first.is_ok());
        assert!(first.created);

        let second = engine.create_session(&tenant("a")).await;
        assert!(second.is_ok());
        assert!(!second.created);
        assert_eq!(client.creations(&tenant("a")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_is_retryable_and_leaves_no_record() {
        let client = MockClient::new();
        client.fail_next_creates(&tenant("a"), 1);
        let engine = engine(&client, 4);

        let outcome = engine.create_session(&tenant("a")).await;
        assert!(!outcome.is_ok());
        assert!(outcome.retryable);
        assert_eq!(outcome.status, None);
        assert_eq!(engine.get_session_status(&tenant("a")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unknown_queue_is_not_found() {
        let client = MockClient::new();
        let engine = engine(&client, 4);
        let result = engine.send_message(
            &tenant("a"),
            "bob",
            Payload::text("hi"),
            SendOptions::queue("nope"),
        );
        assert!(matches!(result, Err(WamuxError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn default_queues_are_reported() {
        let client = MockClient::new();
        let engine = engine(&client, 4);
        let names: Vec<String> = engine.get_queue_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["media", "outbound", "priority"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_destroys_sessions_and_stops_tasks() {
        let client = MockClient::new();
        let engine = engine(&client, 4);
        engine.start();
        engine.start();
        engine.create_session(&tenant("a")).await;
        engine.create_session(&tenant("b")).await;

        let report = engine.shutdown(Duration::from_secs(1)).await;
        assert!(report.drained);
        assert_eq!(report.sessions_destroyed, 2);
        assert!(engine.list_sessions().is_empty());
        assert_eq!(client.live_handles(), 0);
    }
}
