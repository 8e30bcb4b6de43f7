// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scriptable mock chat client for deterministic testing.
//!
//! `MockClient` implements [`ChatClient`]. Tests script create/send/probe
//! failures per tenant, inject lifecycle callbacks into the most recent
//! handle, and assert on creation counts, live handles and sent messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use wamux_core::{
    ChatClient, ClientEventKind, ClientEventSink, ClientHandle, DeliveryReceipt, DisconnectReason,
    HealthStatus, Payload, TenantId, WamuxError,
};

/// What a freshly attached handle reports on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AutoConnect {
    /// Emits `Authenticated` then `Ready` (stored credentials).
    #[default]
    Ready,
    /// Emits a credential challenge with the given data.
    Challenge(String),
    /// Emits nothing; the test drives every callback.
    Silent,
}

/// A message captured by [`MockHandle::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub tenant: TenantId,
    pub recipient: String,
    pub payload: Payload,
}

#[derive(Debug, Default)]
struct MockState {
    auto: AutoConnect,
    auto_overrides: HashMap<TenantId, AutoConnect>,
    creations: HashMap<TenantId, u32>,
    create_failures: HashMap<TenantId, u32>,
    fail_all_creates: bool,
    create_delay: Option<Duration>,
    send_failures: HashMap<TenantId, u32>,
    fail_all_sends: bool,
    send_delay: Option<Duration>,
    probes: HashMap<TenantId, HealthStatus>,
    sinks: HashMap<TenantId, ClientEventSink>,
    sent: Vec<SentMessage>,
    live: usize,
    peak_live: usize,
    destroyed: usize,
}

/// A mock [`ChatClient`] shared between the code under test and the test.
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto(auto: AutoConnect) -> Self {
        let client = Self::new();
        client.lock().auto = auto;
        client
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behaviour for tenants without an override.
    pub fn set_default_auto(&self, auto: AutoConnect) {
        self.lock().auto = auto;
    }

    /// Overrides the auto-connect behaviour for one tenant.
    pub fn set_auto(&self, tenant: &TenantId, auto: AutoConnect) {
        self.lock().auto_overrides.insert(tenant.clone(), auto);
    }

    /// The next `n` creations for `tenant` fail.
    pub fn fail_next_creates(&self, tenant: &TenantId, n: u32) {
        self.lock().create_failures.insert(tenant.clone(), n);
    }

    /// Every creation fails until turned off.
    pub fn fail_all_creates(&self, fail: bool) {
        self.lock().fail_all_creates = fail;
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.lock().create_delay = delay;
    }

    /// The next `n` sends by `tenant` fail.
    pub fn fail_next_sends(&self, tenant: &TenantId, n: u32) {
        self.lock().send_failures.insert(tenant.clone(), n);
    }

    /// Every send fails until turned off.
    pub fn fail_all_sends(&self, fail: bool) {
        self.lock().fail_all_sends = fail;
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.lock().send_delay = delay;
    }

    /// Result returned by probes of `tenant`'s handle.
    pub fn set_probe(&self, tenant: &TenantId, status: HealthStatus) {
        self.lock().probes.insert(tenant.clone(), status);
    }

    /// Delivers a lifecycle callback through the tenant's most recent handle.
    ///
    /// Returns `false` if no handle is attached or nobody listens any more.
    pub fn emit(&self, tenant: &TenantId, kind: ClientEventKind) -> bool {
        let sink = self.lock().sinks.get(tenant).cloned();
        sink.is_some_and(|sink| sink.emit(kind))
    }

    pub fn disconnect(&self, tenant: &TenantId, reason: DisconnectReason) -> bool {
        self.emit(tenant, ClientEventKind::Disconnected(reason))
    }

    /// Generation of the tenant's most recent handle.
    pub fn current_generation(&self, tenant: &TenantId) -> Option<u64> {
        self.lock().sinks.get(tenant).map(ClientEventSink::generation)
    }

    /// Creation attempts (successful or not) for `tenant`.
    pub fn creations(&self, tenant: &TenantId) -> u32 {
        self.lock().creations.get(tenant).copied().unwrap_or(0)
    }

    pub fn total_creations(&self) -> u32 {
        self.lock().creations.values().sum()
    }

    /// Handles created and not yet destroyed or dropped.
    pub fn live_handles(&self) -> usize {
        self.lock().live
    }

    /// Highest number of simultaneously live handles seen.
    pub fn peak_live_handles(&self) -> usize {
        self.lock().peak_live
    }

    pub fn destroyed(&self) -> usize {
        self.lock().destroyed
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }
}

#[async_trait]
impl ChatClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, tenant: &TenantId) -> Result<Box<dyn ClientHandle>, WamuxError> {
        let delay = {
            let mut state = self.lock();
            *state.creations.entry(tenant.clone()).or_default() += 1;
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_all_creates {
            tracing::debug!(tenant = %tenant, "mock create failing (all creates)");
            return Err(WamuxError::external(format!("mock create failed for {tenant}")));
        }
        if let Some(remaining) = state.create_failures.get_mut(tenant)
            && *remaining > 0
        {
            *remaining -= 1;
            tracing::debug!(tenant = %tenant, remaining = *remaining, "mock create failing (scripted)");
            return Err(WamuxError::external(format!("mock create failed for {tenant}")));
        }
        state.live += 1;
        state.peak_live = state.peak_live.max(state.live);
        let auto = state
            .auto_overrides
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| state.auto.clone());

        Ok(Box::new(MockHandle {
            tenant: tenant.clone(),
            state: self.state.clone(),
            auto,
            generation: None,
            destroyed: false,
        }))
    }
}

/// Handle produced by [`MockClient`].
#[derive(Debug)]
pub struct MockHandle {
    tenant: TenantId,
    state: Arc<Mutex<MockState>>,
    auto: AutoConnect,
    generation: Option<u64>,
    destroyed: bool,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let generation = self.generation;
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        state.destroyed += 1;
        let current = state.sinks.get(&self.tenant).map(ClientEventSink::generation);
        if current.is_some() && current == generation {
            state.sinks.remove(&self.tenant);
        }
    }
}

#[async_trait]
impl ClientHandle for MockHandle {
    fn attach_listeners(&mut self, sink: ClientEventSink) -> Result<(), WamuxError> {
        if self.generation.is_some() {
            return Err(WamuxError::Internal(format!(
                "listeners already attached for {}",
                self.tenant
            )));
        }
        self.generation = Some(sink.generation());
        self.lock().sinks.insert(self.tenant.clone(), sink.clone());

        match &self.auto {
            AutoConnect::Ready => {
                sink.authenticated();
                sink.ready();
            }
            AutoConnect::Challenge(data) => {
                sink.credential_challenge(data.clone());
            }
            AutoConnect::Silent => {}
        }
        Ok(())
    }

    async fn send(
        &self,
        recipient: &str,
        payload: &Payload,
    ) -> Result<DeliveryReceipt, WamuxError> {
        let delay = self.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if self.destroyed {
            return Err(WamuxError::external("send on destroyed handle"));
        }
        if state.fail_all_sends {
            tracing::debug!(tenant = %self.tenant, recipient, "mock send failing (all sends)");
            return Err(WamuxError::external(format!("mock send to {recipient} failed")));
        }
        if let Some(remaining) = state.send_failures.get_mut(&self.tenant)
            && *remaining > 0
        {
            *remaining -= 1;
            tracing::debug!(
                tenant = %self.tenant,
                recipient,
                remaining = *remaining,
                "mock send failing (scripted)"
            );
            return Err(WamuxError::external(format!("mock send to {recipient} failed")));
        }
        state.sent.push(SentMessage {
            tenant: self.tenant.clone(),
            recipient: recipient.to_string(),
            payload: payload.clone(),
        });
        Ok(DeliveryReceipt {
            message_id: format!("mock-{}", state.sent.len()),
            delivered_at: Utc::now(),
        })
    }

    async fn probe(&self) -> Result<HealthStatus, WamuxError> {
        if self.destroyed {
            return Ok(HealthStatus::Unhealthy("destroyed".into()));
        }
        Ok(self
            .lock()
            .probes
            .get(&self.tenant)
            .cloned()
            .unwrap_or(HealthStatus::Healthy))
    }

    async fn destroy(&mut self) -> Result<(), WamuxError> {
        self.release();
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
