// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session registry: one authoritative table of tenant sessions.
//!
//! Each tenant owns a [`Slot`]. The slot's async `core` lock serializes every
//! operation that touches the external handle (attach, send, probe,
//! teardown), so unrelated tenants proceed in parallel while one tenant's
//! create, recover and destroy never interleave. The record behind the
//! slot's sync lock holds the serializable projection; it is only ever held
//! for short, non-async sections. Lock order is `core` before `record`.
//!
//! Capacity is a semaphore with one permit per slot. A permit lives inside
//! its slot and returns to the pool when the slot is removed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{
    Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, watch,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wamux_bus::{DestroyCause, EventBus, WamuxEvent};
use wamux_config::PoolConfig;
use wamux_core::{
    ChatClient, ClientEvent, ClientEventKind, ClientEventSink, ClientHandle, DisconnectReason,
    HealthStatus, PoolStats, SessionMetrics, SessionSnapshot, SessionState, TenantId, WamuxError,
};

use crate::checkpoint::Checkpointer;
use crate::lease::SessionLease;

/// Registry tunables, usually taken from `[pool]`.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub capacity: usize,
    pub create_timeout: Duration,
    pub destroy_timeout: Duration,
    /// Upper bound on one `SessionLease::send`.
    pub send_timeout: Duration,
    /// Challenges accepted before the session fails.
    pub max_credential_attempts: u32,
}

impl From<&PoolConfig> for RegistrySettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            capacity: config.capacity,
            create_timeout: config.create_timeout(),
            destroy_timeout: config.destroy_timeout(),
            send_timeout: config.send_timeout(),
            max_credential_attempts: config.max_credential_attempts,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

/// Per-call acquisition options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// How long to wait for capacity. `None` fails immediately with
    /// `CapacityExceeded` when the pool is full and nothing is evictable.
    pub wait: Option<Duration>,
}

impl AcquireOptions {
    pub fn wait(wait: Duration) -> Self {
        Self { wait: Some(wait) }
    }
}

/// Result of one reconnection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// The client asked for a fresh credential; the attempt is over.
    AwaitingCredential,
    Failed { reason: String },
    /// The session was not `Disconnected` when the attempt started.
    Skipped(SessionState),
    /// The attempt was called off before it touched the session.
    Aborted,
}

pub(crate) struct Attachment {
    handle: Box<dyn ClientHandle>,
    generation: u64,
    listener: CancellationToken,
}

#[derive(Default)]
pub(crate) struct Core {
    pub(crate) attachment: Option<Attachment>,
}

impl Core {
    pub(crate) fn handle(&self) -> Option<&dyn ClientHandle> {
        self.attachment.as_ref().map(|a| a.handle.as_ref())
    }

    fn generation(&self) -> Option<u64> {
        self.attachment.as_ref().map(|a| a.generation)
    }
}

pub(crate) struct Record {
    pub(crate) state: SessionState,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
    credential_attempts: u32,
    pub(crate) metrics: SessionMetrics,
    attached: Option<u64>,
    recovering: bool,
    last_touch: Instant,
}

impl Record {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: SessionState::Initializing,
            created_at: now,
            last_active_at: now,
            ready_at: None,
            retry_count: 0,
            credential_attempts: 0,
            metrics: SessionMetrics::default(),
            attached: None,
            recovering: false,
            last_touch: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.last_touch = Instant::now();
    }

    fn snapshot(&self, id: &TenantId) -> SessionSnapshot {
        SessionSnapshot {
            id: id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            ready_at: self.ready_at,
            retry_count: self.retry_count,
            credential_attempts: self.credential_attempts,
            metrics: self.metrics.clone(),
        }
    }
}

pub(crate) struct Slot {
    pub(crate) id: TenantId,
    pub(crate) core: Mutex<Core>,
    record: StdMutex<Record>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    leases: AtomicUsize,
    pub(crate) removed: AtomicBool,
    permit: StdMutex<Option<OwnedSemaphorePermit>>,
    checkpoint_lock: Mutex<()>,
}

impl Slot {
    fn new(id: TenantId, permit: OwnedSemaphorePermit) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        Self {
            id,
            core: Mutex::new(Core::default()),
            record: StdMutex::new(Record::new()),
            state_tx,
            leases: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            permit: StdMutex::new(Some(permit)),
            checkpoint_lock: Mutex::new(()),
        }
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.record().snapshot(&self.id)
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    fn release_permit(&self) {
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fence {
    Any,
    Generation(u64),
}

/// A requested state change and the bookkeeping that comes with it.
#[derive(Debug, Clone)]
struct Change {
    to: SessionState,
    fence: Fence,
    reason: Option<DisconnectReason>,
    detach: bool,
}

impl Change {
    fn to(to: SessionState) -> Self {
        Self {
            to,
            fence: Fence::Any,
            reason: None,
            detach: false,
        }
    }

    fn fenced(mut self, generation: u64) -> Self {
        self.fence = Fence::Generation(generation);
        self
    }

    fn because(mut self, reason: DisconnectReason) -> Self {
        self.reason = Some(reason);
        self
    }

    fn detaching(mut self) -> Self {
        self.detach = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    /// Waits for the slot lock and removes regardless of use.
    Force(DestroyCause),
    /// Removes only if the slot is unused, idle for at least the given
    /// duration, and not locked by anyone.
    IfIdle(DestroyCause, Duration),
}

impl Removal {
    fn cause(self) -> DestroyCause {
        match self {
            Removal::Force(cause) | Removal::IfIdle(cause, _) => cause,
        }
    }
}

struct Inner {
    client: Arc<dyn ChatClient>,
    bus: EventBus,
    settings: RegistrySettings,
    checkpointer: Checkpointer,
    slots: DashMap<TenantId, Arc<Slot>>,
    permits: Arc<Semaphore>,
    next_generation: AtomicU64,
    released: Notify,
    pending_work: DashMap<TenantId, usize>,
}

/// Owns every session record, enforces capacity and serializes per-tenant access.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("client", &self.inner.client.name())
            .field("sessions", &self.inner.slots.len())
            .field("capacity", &self.inner.settings.capacity)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(
        client: Arc<dyn ChatClient>,
        settings: RegistrySettings,
        bus: EventBus,
        checkpointer: Checkpointer,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.capacity));
        Self {
            inner: Arc::new(Inner {
                client,
                bus,
                settings,
                checkpointer,
                slots: DashMap::new(),
                permits,
                next_generation: AtomicU64::new(0),
                released: Notify::new(),
                pending_work: DashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub fn capacity(&self) -> usize {
        self.inner.settings.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn contains(&self, id: &TenantId) -> bool {
        self.inner.slots.contains_key(id)
    }

    pub(crate) fn slot(&self, id: &TenantId) -> Option<Arc<Slot>> {
        self.inner.slots.get(id).map(|entry| entry.value().clone())
    }

    /// Returns a lease on `id`, creating the session if needed.
    ///
    /// Concurrent callers for the same id share one creation: latecomers wait
    /// on the slot lock until attach finishes. At capacity the least recently
    /// used idle session is evicted; without one the call fails with
    /// `CapacityExceeded`, or waits up to `options.wait` and then fails with
    /// `AcquireTimeout`.
    pub async fn acquire(
        &self,
        id: &TenantId,
        options: AcquireOptions,
    ) -> Result<SessionLease, WamuxError> {
        let deadline = options.wait.map(|wait| Instant::now() + wait);
        let timed_out = || WamuxError::AcquireTimeout {
            tenant: id.to_string(),
            waited: options.wait.unwrap_or_default(),
        };

        loop {
            if let Some(slot) = self.slot(id) {
                let core = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, slot.core.lock())
                        .await
                        .map_err(|_| timed_out())?,
                    None => slot.core.lock().await,
                };
                if slot.is_removed() {
                    continue;
                }
                let state = slot.record().state;
                if state == SessionState::Failed {
                    return Err(WamuxError::SessionUnhealthy {
                        tenant: id.to_string(),
                        state,
                        reason: "session failed; destroy it before acquiring again".into(),
                    });
                }
                let lease = self.lease(slot.clone());
                drop(core);
                return Ok(lease);
            }

            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let permit = match self.inner.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(shut_down()),
                Err(TryAcquireError::NoPermits) => {
                    if self.contains(id) || self.evict_lru().await {
                        continue;
                    }
                    let Some(deadline) = deadline else {
                        debug!(tenant = %id, "pool at capacity with nothing to evict");
                        return Err(WamuxError::CapacityExceeded {
                            capacity: self.inner.settings.capacity,
                        });
                    };
                    tokio::select! {
                        permit = self.inner.permits.clone().acquire_owned() => {
                            permit.map_err(|_| shut_down())?
                        }
                        _ = &mut released => continue,
                        _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
                    }
                }
            };

            let slot = Arc::new(Slot::new(id.clone(), permit));
            let mut core = slot.core.lock().await;
            match self.inner.slots.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(slot.clone());
                }
            }

            info!(tenant = %id, "session created");
            wamux_prometheus::record_session_created();
            self.inner.bus.publish(WamuxEvent::session_created(id.clone()));

            if let Err(e) = self.attach(&slot, &mut core).await {
                warn!(tenant = %id, error = %e, "session creation failed");
                slot.removed.store(true, Ordering::Release);
                self.inner
                    .slots
                    .remove_if(id, |_, current| Arc::ptr_eq(current, &slot));
                slot.release_permit();
                drop(core);
                slot.state_tx.send_modify(|_| {});
                wamux_prometheus::record_session_destroyed(DestroyCause::CreateFailed.as_str());
                self.inner
                    .bus
                    .publish(WamuxEvent::destroyed(id.clone(), DestroyCause::CreateFailed));
                self.inner.released.notify_waiters();
                return Err(e);
            }
            let lease = self.lease(slot.clone());
            drop(core);
            self.checkpoint(&slot).await;
            return Ok(lease);
        }
    }

    fn lease(&self, slot: Arc<Slot>) -> SessionLease {
        slot.leases.fetch_add(1, Ordering::AcqRel);
        slot.record().touch();
        SessionLease::new(self.clone(), slot)
    }

    /// Called once per lease when it is dropped.
    pub(crate) fn end_lease(&self, slot: &Slot) {
        let previous = slot
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            slot.record().touch();
            self.inner.released.notify_waiters();
        }
    }

    /// Marks `id` idle and eligible for eviction, overriding outstanding leases.
    ///
    /// Returns `false` (and changes nothing) if `id` is unknown or holds no
    /// lease, so releasing a never-acquired id is a no-op.
    pub fn release(&self, id: &TenantId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if slot.leases.swap(0, Ordering::AcqRel) == 0 {
            return false;
        }
        slot.record().touch();
        self.inner.released.notify_waiters();
        debug!(tenant = %id, "session released");
        true
    }

    /// Tears down the external client and removes the record.
    ///
    /// Teardown errors are logged, never returned. Returns whether a record
    /// existed. Only a requested destroy deletes the checkpoint.
    pub async fn destroy(&self, id: &TenantId, cause: DestroyCause) -> bool {
        match self.slot(id) {
            Some(slot) => self.remove_slot(&slot, Removal::Force(cause)).await,
            None => {
                if cause == DestroyCause::Requested {
                    self.inner.checkpointer.clear(id).await;
                }
                false
            }
        }
    }

    /// Destroys every record. Used on shutdown.
    pub async fn destroy_all(&self, cause: DestroyCause) -> usize {
        let slots: Vec<Arc<Slot>> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut destroyed = 0;
        for slot in slots {
            if self.remove_slot(&slot, Removal::Force(cause)).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Stops accepting new sessions and destroys the existing ones.
    pub async fn shutdown(&self) -> usize {
        self.inner.permits.close();
        let destroyed = self.destroy_all(DestroyCause::Shutdown).await;
        info!(destroyed, "session registry shut down");
        destroyed
    }

    /// Destroys records untouched for `max_idle` that hold no lease and no
    /// queued work. Locked records are skipped until the next sweep.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<TenantId> {
        let now = Instant::now();
        let candidates: Vec<Arc<Slot>> = self
            .inner
            .slots
            .iter()
            .filter(|entry| {
                let slot = entry.value();
                self.is_idle(slot) && now.duration_since(slot.record().last_touch) >= max_idle
            })
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = Vec::new();
        for slot in candidates {
            if self
                .remove_slot(&slot, Removal::IfIdle(DestroyCause::Idle, max_idle))
                .await
            {
                evicted.push(slot.id.clone());
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle sessions");
        }
        evicted
    }

    fn is_idle(&self, slot: &Slot) -> bool {
        slot.leases() == 0 && self.pending_work(&slot.id) == 0
    }

    async fn evict_lru(&self) -> bool {
        let mut candidates: Vec<(Instant, Arc<Slot>)> = self
            .inner
            .slots
            .iter()
            .filter(|entry| self.is_idle(entry.value()))
            .map(|entry| (entry.value().record().last_touch, entry.value().clone()))
            .collect();
        candidates.sort_by_key(|(touched, _)| *touched);

        for (_, slot) in candidates {
            if self
                .remove_slot(&slot, Removal::IfIdle(DestroyCause::Capacity, Duration::ZERO))
                .await
            {
                return true;
            }
        }
        false
    }

    async fn remove_slot(&self, slot: &Arc<Slot>, removal: Removal) -> bool {
        let mut core = match removal {
            Removal::Force(_) => slot.core.lock().await,
            Removal::IfIdle(..) => match slot.core.try_lock() {
                Ok(core) => core,
                Err(_) => return false,
            },
        };
        if let Removal::IfIdle(_, max_idle) = removal {
            let idle_for = Instant::now().duration_since(slot.record().last_touch);
            if !self.is_idle(slot) || idle_for < max_idle {
                return false;
            }
        }
        if slot.removed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let cause = removal.cause();
        let attachment = core.attachment.take();
        slot.record().attached = None;
        if let Some(attachment) = attachment {
            self.teardown(&slot.id, attachment).await;
        }
        self.inner
            .slots
            .remove_if(&slot.id, |_, current| Arc::ptr_eq(current, slot));
        slot.release_permit();
        drop(core);
        slot.state_tx.send_modify(|_| {});

        if cause == DestroyCause::Requested {
            let _guard = slot.checkpoint_lock.lock().await;
            self.inner.checkpointer.clear(&slot.id).await;
        }
        info!(tenant = %slot.id, %cause, "session destroyed");
        wamux_prometheus::record_session_destroyed(cause.as_str());
        self.inner
            .bus
            .publish(WamuxEvent::destroyed(slot.id.clone(), cause));
        self.inner.released.notify_waiters();
        true
    }

    async fn attach(&self, slot: &Arc<Slot>, core: &mut Core) -> Result<u64, WamuxError> {
        if core.attachment.is_some() {
            error!(
                tenant = %slot.id,
                state = %slot.record().state,
                "attach requested while a handle is already attached"
            );
            return Err(WamuxError::Internal(format!(
                "session {} already has an attached handle",
                slot.id
            )));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let create_timeout = self.inner.settings.create_timeout;
        let mut handle =
            match tokio::time::timeout(create_timeout, self.inner.client.create(&slot.id)).await {
                Ok(handle) => handle?,
                Err(_) => {
                    return Err(WamuxError::Timeout {
                        operation: format!("create session {}", slot.id),
                        duration: create_timeout,
                    });
                }
            };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = handle.attach_listeners(ClientEventSink::new(slot.id.clone(), generation, tx))
        {
            self.destroy_handle(&slot.id, handle).await;
            return Err(e);
        }

        slot.record().attached = Some(generation);
        let listener = CancellationToken::new();
        core.attachment = Some(Attachment {
            handle,
            generation,
            listener: listener.clone(),
        });
        self.spawn_listener(rx, listener);
        debug!(tenant = %slot.id, generation, "external client attached");
        Ok(generation)
    }

    async fn teardown(&self, id: &TenantId, attachment: Attachment) {
        attachment.listener.cancel();
        self.destroy_handle(id, attachment.handle).await;
    }

    async fn destroy_handle(&self, id: &TenantId, mut handle: Box<dyn ClientHandle>) {
        let destroy_timeout = self.inner.settings.destroy_timeout;
        match tokio::time::timeout(destroy_timeout, handle.destroy()).await {
            Ok(Ok(())) => debug!(tenant = %id, "external client destroyed"),
            Ok(Err(e)) => warn!(tenant = %id, error = %e, "external client teardown failed"),
            Err(_) => warn!(
                tenant = %id,
                timeout = ?destroy_timeout,
                "external client teardown timed out"
            ),
        }
    }

    fn spawn_listener(&self, mut rx: mpsc::UnboundedReceiver<ClientEvent>, token: CancellationToken) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                SessionRegistry { inner }.on_client_event(event).await;
            }
        });
    }

    /// Applies a state change under the record lock.
    ///
    /// Returns `Ok(false)` for stale or repeated changes. Bus publication
    /// happens under the same lock so observers see one tenant's changes in
    /// order.
    fn transition(&self, slot: &Slot, change: Change) -> Result<bool, WamuxError> {
        let mut record = slot.record();
        if let Fence::Generation(generation) = change.fence
            && record.attached != Some(generation)
        {
            return Ok(false);
        }

        let from = record.state;
        let to = change.to;
        if from == to && to != SessionState::WaitingCredential {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(WamuxError::InvalidTransition {
                tenant: slot.id.to_string(),
                from,
                to,
            });
        }
        let attached = if change.detach { None } else { record.attached };
        if to.requires_handle() && attached.is_none() {
            return Err(WamuxError::Internal(format!(
                "session {} cannot enter {to} without a handle",
                slot.id
            )));
        }
        if to.forbids_handle() && attached.is_some() {
            return Err(WamuxError::Internal(format!(
                "session {} cannot enter {to} with a handle attached",
                slot.id
            )));
        }

        record.attached = attached;
        record.state = to;
        match to {
            SessionState::WaitingCredential => record.credential_attempts += 1,
            SessionState::Authenticated => record.credential_attempts = 0,
            SessionState::Ready => {
                record.ready_at = Some(Utc::now());
                record.retry_count = 0;
                if record.recovering {
                    record.recovering = false;
                    record.metrics.reconnections += 1;
                }
            }
            SessionState::Recovering => record.recovering = true,
            SessionState::Disconnected | SessionState::Failed => {
                if record.recovering {
                    record.recovering = false;
                    record.retry_count += 1;
                }
            }
            SessionState::Initializing => {}
        }

        slot.state_tx.send_replace(to);
        wamux_prometheus::record_transition(from, to);
        match &change.reason {
            Some(reason) => info!(tenant = %slot.id, %from, %to, %reason, "session state changed"),
            None => info!(tenant = %slot.id, %from, %to, "session state changed"),
        }
        self.inner.bus.publish(WamuxEvent::state_changed(
            slot.id.clone(),
            from,
            to,
            change.reason,
        ));
        Ok(true)
    }

    /// Like [`transition`](Self::transition), but logs a rejected change
    /// instead of returning it. For changes driven by client callbacks.
    fn apply(&self, slot: &Slot, change: Change) -> bool {
        let to = change.to;
        match self.transition(slot, change) {
            Ok(changed) => changed,
            Err(e) => {
                error!(
                    tenant = %slot.id,
                    state = %slot.record().state,
                    %to,
                    error = %e,
                    "rejected session state change"
                );
                false
            }
        }
    }

    async fn on_client_event(&self, event: ClientEvent) {
        let Some(slot) = self.slot(&event.tenant) else {
            return;
        };
        let generation = event.generation;
        if slot.record().attached != Some(generation) {
            debug!(tenant = %event.tenant, generation, "ignoring event from stale client");
            return;
        }

        match event.kind {
            ClientEventKind::CredentialChallenge(data) => {
                self.on_credential_challenge(&slot, generation, data).await;
            }
            ClientEventKind::Authenticated => {
                if self.apply(&slot, Change::to(SessionState::Authenticated).fenced(generation)) {
                    self.inner.checkpointer.clear_challenge(&slot.id).await;
                    self.checkpoint(&slot).await;
                }
            }
            ClientEventKind::Ready => {
                let state = slot.record().state;
                if state == SessionState::WaitingCredential
                    && self.apply(&slot, Change::to(SessionState::Authenticated).fenced(generation))
                {
                    self.inner.checkpointer.clear_challenge(&slot.id).await;
                }
                if self.apply(&slot, Change::to(SessionState::Ready).fenced(generation)) {
                    self.checkpoint(&slot).await;
                }
            }
            ClientEventKind::Disconnected(reason) => {
                self.mark_disconnected(&slot, Fence::Generation(generation), reason)
                    .await;
            }
            ClientEventKind::MessageReceived => {
                let mut record = slot.record();
                record.metrics.messages_received += 1;
                record.touch();
            }
            ClientEventKind::Error(message) => {
                slot.record().metrics.errors += 1;
                warn!(tenant = %slot.id, error = %message, "external client reported an error");
            }
        }
    }

    async fn on_credential_challenge(&self, slot: &Arc<Slot>, generation: u64, data: String) {
        let attempts = slot.record().credential_attempts;
        let max = self.inner.settings.max_credential_attempts;
        if attempts >= max {
            warn!(tenant = %slot.id, attempts, "credential attempts exhausted");
            self.fail_slot(slot, Fence::Generation(generation), None).await;
            return;
        }
        if !self.apply(slot, Change::to(SessionState::WaitingCredential).fenced(generation)) {
            return;
        }
        let attempt = attempts + 1;
        self.inner.bus.publish(WamuxEvent::CredentialChallenge {
            tenant: slot.id.clone(),
            data: data.clone(),
            attempt,
            at: Utc::now(),
        });
        self.inner.checkpointer.save_challenge(&slot.id, &data).await;
        self.checkpoint(slot).await;
    }

    /// Detaches the handle and moves to `Disconnected`, or to `Failed` for
    /// reasons that must not be retried.
    async fn mark_disconnected(&self, slot: &Arc<Slot>, fence: Fence, reason: DisconnectReason) {
        if !reason.is_recoverable() {
            warn!(tenant = %slot.id, %reason, "unrecoverable disconnect");
            self.fail_slot(slot, fence, Some(reason)).await;
            return;
        }
        self.detach_into(slot, fence, SessionState::Disconnected, Some(reason))
            .await;
    }

    async fn fail_slot(&self, slot: &Arc<Slot>, fence: Fence, reason: Option<DisconnectReason>) -> bool {
        self.detach_into(slot, fence, SessionState::Failed, reason).await
    }

    async fn detach_into(
        &self,
        slot: &Arc<Slot>,
        fence: Fence,
        to: SessionState,
        reason: Option<DisconnectReason>,
    ) -> bool {
        let mut core = slot.core.lock().await;
        if slot.is_removed() {
            return false;
        }
        if let Fence::Generation(generation) = fence
            && core.generation() != Some(generation)
        {
            return false;
        }

        let attachment = core.attachment.take();
        let mut change = Change::to(to).detaching();
        if let Some(reason) = reason {
            change = change.because(reason);
        }
        let changed = self.apply(slot, change);
        match attachment {
            Some(attachment) if changed => self.teardown(&slot.id, attachment).await,
            Some(attachment) => core.attachment = Some(attachment),
            None => {}
        }
        drop(core);
        if changed {
            self.checkpoint(slot).await;
        }
        changed
    }

    /// Moves `id` to `Failed`, tearing down its handle.
    pub async fn fail(&self, id: &TenantId) -> Result<bool, WamuxError> {
        let slot = self.slot(id).ok_or_else(|| not_found(id))?;
        Ok(self.fail_slot(&slot, Fence::Any, None).await)
    }

    /// One reconnection attempt: `Disconnected -> Recovering`, a fresh
    /// external client, then a wait of up to `ready_timeout` for it to
    /// report ready.
    pub async fn recover(
        &self,
        id: &TenantId,
        ready_timeout: Duration,
    ) -> Result<RecoveryOutcome, WamuxError> {
        self.recover_unless(id, ready_timeout, || false).await
    }

    /// Like [`recover`](Self::recover), but `abort` is checked once the
    /// session lock is held. If it returns `true` the session is left
    /// untouched and the outcome is [`RecoveryOutcome::Aborted`].
    pub async fn recover_unless(
        &self,
        id: &TenantId,
        ready_timeout: Duration,
        abort: impl Fn() -> bool,
    ) -> Result<RecoveryOutcome, WamuxError> {
        let slot = self.slot(id).ok_or_else(|| not_found(id))?;
        let mut state_rx = slot.state_tx.subscribe();

        let generation = {
            let mut core = slot.core.lock().await;
            if slot.is_removed() {
                return Err(not_found(id));
            }
            if abort() {
                return Ok(RecoveryOutcome::Aborted);
            }
            let state = slot.record().state;
            if state != SessionState::Disconnected {
                return Ok(RecoveryOutcome::Skipped(state));
            }
            if let Some(stale) = core.attachment.take() {
                error!(tenant = %id, "disconnected session still held a handle");
                slot.record().attached = None;
                self.teardown(id, stale).await;
            }
            self.transition(&slot, Change::to(SessionState::Recovering))?;
            match self.attach(&slot, &mut core).await {
                Ok(generation) => generation,
                Err(e) => {
                    warn!(tenant = %id, error = %e, "reconnection attempt failed");
                    self.transition(
                        &slot,
                        Change::to(SessionState::Disconnected).because(DisconnectReason::RecoveryFailed),
                    )?;
                    drop(core);
                    self.checkpoint(&slot).await;
                    return Ok(RecoveryOutcome::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        };

        let deadline = Instant::now() + ready_timeout;
        loop {
            let state = *state_rx.borrow_and_update();
            if slot.is_removed() {
                return Ok(RecoveryOutcome::Failed {
                    reason: "session destroyed during recovery".into(),
                });
            }
            match state {
                SessionState::Ready => return Ok(RecoveryOutcome::Recovered),
                SessionState::WaitingCredential => return Ok(RecoveryOutcome::AwaitingCredential),
                SessionState::Disconnected | SessionState::Failed => {
                    return Ok(RecoveryOutcome::Failed {
                        reason: format!("session moved to {state} during recovery"),
                    });
                }
                SessionState::Initializing | SessionState::Authenticated | SessionState::Recovering => {}
            }
            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(WamuxError::Internal("session state channel closed".into())),
                Err(_) => break,
            }
        }

        warn!(tenant = %id, timeout = ?ready_timeout, "reconnected client never became ready");
        self.detach_into(
            &slot,
            Fence::Generation(generation),
            SessionState::Disconnected,
            Some(DisconnectReason::RecoveryFailed),
        )
        .await;
        Ok(RecoveryOutcome::Failed {
            reason: format!("not ready within {ready_timeout:?}"),
        })
    }

    /// Probes the handle of a `Ready`/`Authenticated` session.
    ///
    /// Returns `None` when the session is missing, not probeable, or busy.
    /// A failed probe moves the session to `Disconnected` rather than
    /// destroying it.
    pub async fn probe(&self, id: &TenantId, probe_timeout: Duration) -> Option<HealthStatus> {
        let slot = self.slot(id)?;
        let core = slot.core.try_lock().ok()?;
        if slot.is_removed() || !slot.record().state.is_probeable() {
            return None;
        }
        let attachment = core.attachment.as_ref()?;
        let generation = attachment.generation;
        let status = match tokio::time::timeout(probe_timeout, attachment.handle.probe()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
            Err(_) => HealthStatus::Unhealthy(format!("probe timed out after {probe_timeout:?}")),
        };
        drop(core);

        wamux_prometheus::record_probe(status.is_alive());
        match &status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(detail) => {
                debug!(tenant = %id, %detail, "session degraded");
            }
            HealthStatus::Unhealthy(detail) => {
                warn!(tenant = %id, %detail, "health probe failed");
                self.mark_disconnected(&slot, Fence::Generation(generation), DisconnectReason::ProbeFailed)
                    .await;
            }
        }
        Some(status)
    }

    /// Re-acquires a session from its checkpoint after a restart.
    ///
    /// Returns `None` when there is no checkpoint or it records a failed
    /// session. Counters and creation time carry over to a fresh record.
    pub async fn restore(&self, id: &TenantId) -> Result<Option<SessionLease>, WamuxError> {
        let Some(saved) = self.inner.checkpointer.load_snapshot(id).await else {
            return Ok(None);
        };
        if saved.state == SessionState::Failed {
            debug!(tenant = %id, "checkpoint records a failed session, not restoring");
            return Ok(None);
        }

        let existed = self.contains(id);
        let lease = self.acquire(id, AcquireOptions::default()).await?;
        if !existed {
            let mut record = lease.slot().record();
            record.created_at = saved.created_at;
            let received = record.metrics.messages_received;
            record.metrics = saved.metrics;
            record.metrics.messages_received += received;
        }
        info!(tenant = %id, "session restored from checkpoint");
        self.checkpoint(lease.slot()).await;
        Ok(Some(lease))
    }

    /// Latest credential challenge for `id` from the checkpoint store.
    pub async fn pending_challenge(&self, id: &TenantId) -> Option<String> {
        self.inner.checkpointer.load_challenge(id).await
    }

    async fn checkpoint(&self, slot: &Slot) {
        if !self.inner.checkpointer.is_enabled() {
            return;
        }
        let _guard = slot.checkpoint_lock.lock().await;
        if slot.is_removed() {
            return;
        }
        let snapshot = slot.snapshot();
        self.inner.checkpointer.save_snapshot(&snapshot).await;
    }

    /// Refreshes the last-activity clock of `id`.
    pub fn touch(&self, id: &TenantId) -> bool {
        match self.slot(id) {
            Some(slot) => {
                slot.record().touch();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: &TenantId) -> Option<SessionState> {
        self.slot(id).map(|slot| slot.record().state)
    }

    pub fn snapshot(&self, id: &TenantId) -> Option<SessionSnapshot> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    /// Snapshots of every record, ordered by tenant id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Ids of every record in `state`.
    pub fn ids_in(&self, state: SessionState) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.value().record().state == state)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pool_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.inner.settings.capacity,
            ..PoolStats::default()
        };
        for entry in self.inner.slots.iter() {
            let slot = entry.value();
            stats.total += 1;
            if slot.leases() > 0 {
                stats.active += 1;
            }
            let record = slot.record();
            if record.state.is_ready() {
                stats.ready += 1;
            }
            if record.attached.is_some() {
                stats.attached += 1;
            }
        }
        stats
    }

    /// Records a queued job targeting `id`; such sessions are never evicted.
    pub fn work_enqueued(&self, id: &TenantId) {
        *self.inner.pending_work.entry(id.clone()).or_default() += 1;
    }

    pub fn work_finished(&self, id: &TenantId) {
        let emptied = match self.inner.pending_work.get_mut(id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            self.inner.pending_work.remove_if(id, |_, count| *count == 0);
            self.inner.released.notify_waiters();
        }
    }

    pub fn pending_work(&self, id: &TenantId) -> usize {
        self.inner.pending_work.get(id).map(|count| *count).unwrap_or(0)
    }
}

fn not_found(id: &TenantId) -> WamuxError {
    WamuxError::NotFound {
        kind: "session",
        id: id.to_string(),
    }
}

fn shut_down() -> WamuxError {
    WamuxError::Internal("session registry is shut down".into())
}
