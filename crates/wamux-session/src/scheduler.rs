// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Automatic reconnection of disconnected sessions.
//!
//! The scheduler watches the event bus for sessions entering
//! `Disconnected` and arms one cancellable timer per tenant. When a timer
//! fires the registry runs a recovery attempt; a failed attempt puts the
//! session back in `Disconnected`, which arms the next timer. Once
//! `retry_count` reaches the budget the session is failed instead.
//!
//! A periodic sweep (and a sweep after any bus lag) re-arms sessions left
//! `Disconnected` without a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wamux_bus::WamuxEvent;
use wamux_config::ReconnectConfig;
use wamux_core::{SessionState, TenantId};
use wamux_resilience::BackoffPolicy;

use crate::registry::{RecoveryOutcome, SessionRegistry};

/// Scheduler tunables, usually taken from `[reconnect]`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub policy: BackoffPolicy,
    /// Attempts before the session is failed.
    pub max_attempts: u32,
    /// How long a reconnected client may take to report ready.
    pub ready_timeout: Duration,
    pub sweep_interval: Duration,
}

impl From<&ReconnectConfig> for SchedulerSettings {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            policy: BackoffPolicy::from(&config.backoff()),
            max_attempts: config.max_attempts,
            ready_timeout: config.ready_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

/// A reconnection timer that has not fired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReconnect {
    /// Zero-based attempt number.
    pub attempt: u32,
    pub due_in: Duration,
}

struct Pending {
    seq: u64,
    token: CancellationToken,
    attempt: u32,
    due: Instant,
}

struct SchedulerInner {
    registry: SessionRegistry,
    settings: SchedulerSettings,
    pending: DashMap<TenantId, Pending>,
    cancelled: DashSet<TenantId>,
    last_delay: DashMap<TenantId, Duration>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

/// Backoff-driven recovery of `Disconnected` sessions.
#[derive(Clone)]
pub struct ReconnectScheduler {
    inner: Arc<SchedulerInner>,
}

impl ReconnectScheduler {
    pub fn new(registry: SessionRegistry, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                settings,
                pending: DashMap::new(),
                cancelled: DashSet::new(),
                last_delay: DashMap::new(),
                next_seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Subscribes to the bus and runs the event loop on a new task.
    ///
    /// The subscription is taken before this returns, so no event published
    /// afterwards is missed.
    pub fn spawn(&self) -> JoinHandle<()> {
        let rx = self.inner.registry.bus().subscribe();
        let this = self.clone();
        tokio::spawn(async move { this.run(rx).await })
    }

    async fn run(self, mut rx: broadcast::Receiver<WamuxEvent>) {
        let period = self.inner.settings.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            max_attempts = self.inner.settings.max_attempts,
            "reconnection scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                event = rx.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "reconnection scheduler lagged behind the event bus");
                        self.sweep().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("reconnection scheduler stopped");
    }

    async fn on_event(&self, event: WamuxEvent) {
        match event {
            WamuxEvent::SessionStateChanged { tenant, to, .. } => match to {
                SessionState::Disconnected => {
                    self.schedule(&tenant).await;
                }
                SessionState::Ready => {
                    self.inner.last_delay.remove(&tenant);
                }
                SessionState::Failed => self.forget(&tenant, false),
                _ => {}
            },
            WamuxEvent::SessionDestroyed { tenant, .. } => self.forget(&tenant, true),
            _ => {}
        }
    }

    fn forget(&self, id: &TenantId, clear_cancellation: bool) {
        if let Some((_, pending)) = self.inner.pending.remove(id) {
            pending.token.cancel();
            debug!(tenant = %id, "pending reconnection dropped");
        }
        self.inner.last_delay.remove(id);
        if clear_cancellation {
            self.inner.cancelled.remove(id);
        }
    }

    /// Arms a reconnection timer for `id` if it is `Disconnected` and has
    /// none yet. Fails the session once its attempts are exhausted.
    ///
    /// Returns the scheduled delay.
    pub async fn schedule(&self, id: &TenantId) -> Option<Duration> {
        if self.inner.shutdown.is_cancelled() {
            return None;
        }
        if self.inner.cancelled.contains(id) {
            debug!(tenant = %id, "reconnection cancelled by operator, not scheduling");
            return None;
        }
        let snapshot = self.inner.registry.snapshot(id)?;
        if snapshot.state != SessionState::Disconnected {
            return None;
        }

        let attempt = snapshot.retry_count;
        let settings = &self.inner.settings;
        if attempt >= settings.max_attempts {
            self.exhaust(id, attempt).await;
            return None;
        }

        let previous = self.inner.last_delay.get(id).map(|delay| *delay);
        let delay = settings.policy.delay_after(attempt, previous);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        match self.inner.pending.entry(id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(Pending {
                    seq,
                    token: token.clone(),
                    attempt,
                    due: Instant::now() + delay,
                });
            }
        }
        self.inner.last_delay.insert(id.clone(), delay);

        info!(tenant = %id, attempt, delay = ?delay, "reconnection scheduled");
        wamux_prometheus::record_reconnect("scheduled");
        self.inner.registry.bus().publish(WamuxEvent::ReconnectScheduled {
            tenant: id.clone(),
            attempt,
            delay,
            at: Utc::now(),
        });

        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if this
                .inner
                .pending
                .remove_if(&id, |_, pending| pending.seq == seq)
                .is_none()
            {
                return;
            }
            if this.inner.cancelled.contains(&id) {
                return;
            }
            this.attempt(&id, attempt).await;
        });
        Some(delay)
    }

    async fn attempt(&self, id: &TenantId, attempt: u32) {
        debug!(tenant = %id, attempt, "attempting reconnection");
        let ready_timeout = self.inner.settings.ready_timeout;
        let cancelled = || self.inner.cancelled.contains(id);
        match self
            .inner
            .registry
            .recover_unless(id, ready_timeout, cancelled)
            .await
        {
            Ok(RecoveryOutcome::Recovered) => {
                info!(tenant = %id, attempt, "session reconnected");
                wamux_prometheus::record_reconnect("succeeded");
                self.inner.last_delay.remove(id);
            }
            Ok(RecoveryOutcome::AwaitingCredential) => {
                info!(tenant = %id, attempt, "reconnected session needs a new credential");
                self.inner.last_delay.remove(id);
            }
            Ok(RecoveryOutcome::Failed { reason }) => {
                warn!(tenant = %id, attempt, %reason, "reconnection attempt failed");
                wamux_prometheus::record_reconnect("failed");
            }
            Ok(RecoveryOutcome::Skipped(state)) => {
                debug!(tenant = %id, %state, "session no longer disconnected, attempt skipped");
            }
            Ok(RecoveryOutcome::Aborted) => {
                debug!(tenant = %id, attempt, "reconnection cancelled before the attempt started");
            }
            Err(e) => debug!(tenant = %id, error = %e, "reconnection target vanished"),
        }
    }

    async fn exhaust(&self, id: &TenantId, attempts: u32) {
        match self.inner.registry.fail(id).await {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        warn!(tenant = %id, attempts, "reconnection attempts exhausted, session failed");
        wamux_prometheus::record_reconnect("exhausted");
        self.inner.last_delay.remove(id);
        self.inner.registry.bus().publish(WamuxEvent::ReconnectExhausted {
            tenant: id.clone(),
            attempts,
            at: Utc::now(),
        });
    }

    /// Stops any pending timer for `id` and suppresses further automatic
    /// attempts until [`resume_reconnection`](Self::resume_reconnection).
    ///
    /// Returns whether a timer was pending.
    pub fn cancel_reconnection(&self, id: &TenantId) -> bool {
        self.inner.cancelled.insert(id.clone());
        let stopped = match self.inner.pending.remove(id) {
            Some((_, pending)) => {
                pending.token.cancel();
                true
            }
            None => false,
        };
        info!(tenant = %id, stopped, "reconnection cancelled");
        stopped
    }

    /// Re-enables automatic attempts for `id` and schedules one if it is
    /// still `Disconnected`.
    pub async fn resume_reconnection(&self, id: &TenantId) -> Option<Duration> {
        if self.inner.cancelled.remove(id).is_some() {
            info!(tenant = %id, "reconnection resumed");
        }
        self.schedule(id).await
    }

    /// Arms timers for `Disconnected` sessions that have none.
    pub async fn sweep(&self) -> usize {
        let mut armed = 0;
        for id in self.inner.registry.ids_in(SessionState::Disconnected) {
            if self.inner.pending.contains_key(&id) || self.inner.cancelled.contains(&id) {
                continue;
            }
            if self.schedule(&id).await.is_some() {
                armed += 1;
            }
        }
        if armed > 0 {
            info!(armed, "sweep re-armed stranded reconnections");
        }
        armed
    }

    pub fn pending_for(&self, id: &TenantId) -> Option<PendingReconnect> {
        self.inner.pending.get(id).map(|pending| PendingReconnect {
            attempt: pending.attempt,
            due_in: pending.due.saturating_duration_since(Instant::now()),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_cancelled(&self, id: &TenantId) -> bool {
        self.inner.cancelled.contains(id)
    }

    /// Stops the event loop and every pending timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pending.clear();
    }
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("pending", &self.inner.pending.len())
            .field("cancelled", &self.inner.cancelled.len())
            .finish()
    }
}
