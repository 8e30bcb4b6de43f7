// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine harness for end-to-end tests.
//!
//! `TestHarness` builds a full [`Engine`] over a [`MockClient`] and an
//! [`InMemoryKvStore`], with knobs for the settings scenario tests care about.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use wamux_bus::WamuxEvent;
use wamux_config::{QueueConfig, WamuxConfig};
use wamux_core::{SessionState, TenantId, WamuxError};
use wamux_engine::Engine;
use wamux_session::{AcquireOptions, InMemoryKvStore};

use crate::mock_client::{AutoConnect, MockClient};

/// Builder for [`TestHarness`].
pub struct TestHarnessBuilder {
    config: WamuxConfig,
    auto: AutoConnect,
    start: bool,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        let mut config = WamuxConfig::default();
        // Deterministic delays unless a test opts back in.
        config.reconnect.jitter = 0.0;
        for queue in &mut config.queues {
            queue.backoff.jitter = 0.0;
        }
        Self {
            config,
            auto: AutoConnect::Ready,
            start: true,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.config.pool.capacity = capacity;
        self
    }

    pub fn with_auto_connect(mut self, auto: AutoConnect) -> Self {
        self.auto = auto;
        self
    }

    pub fn with_reconnect(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.config.reconnect.base_delay_ms = base_delay.as_millis() as u64;
        self.config.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn with_rate_limit(mut self, max_per_window: u32, window: Duration) -> Self {
        self.config.rate_limit.enabled = true;
        self.config.rate_limit.max_per_window = max_per_window;
        self.config.rate_limit.window_ms = window.as_millis() as u64;
        self
    }

    /// Adds a queue, replacing any queue with the same name.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.config.queues.retain(|q| q.name != queue.name);
        self.config.queues.push(queue);
        self
    }

    pub fn with_checkpoints(mut self) -> Self {
        self.config.checkpoint.enabled = true;
        self
    }

    /// Arbitrary config edits.
    pub fn with_config(mut self, edit: impl FnOnce(&mut WamuxConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Leaves the background tasks stopped.
    pub fn without_start(mut self) -> Self {
        self.start = false;
        self
    }

    /// Builds the harness. Must run inside a tokio runtime when starting.
    pub fn build(self) -> TestHarness {
        self.build_with(MockClient::new(), Arc::new(InMemoryKvStore::new()))
    }

    /// Builds over an existing client and store, e.g. to simulate a restart.
    pub fn build_with(self, client: MockClient, store: Arc<InMemoryKvStore>) -> TestHarness {
        client.set_default_auto(self.auto);
        let engine = Engine::new(
            self.config,
            Arc::new(client.clone()),
            Some(store.clone()),
        );
        if self.start {
            engine.start();
        }
        TestHarness {
            engine,
            client,
            store,
        }
    }
}

/// A running engine plus handles to its mocks.
pub struct TestHarness {
    pub engine: Engine,
    pub client: MockClient,
    pub store: Arc<InMemoryKvStore>,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    pub fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap_or_else(|err| panic!("invalid tenant id {id:?}: {err}"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WamuxEvent> {
        self.engine.subscribe()
    }

    /// Creates the session and waits until it is `Ready`.
    pub async fn ready_session(&self, id: &str) -> Result<TenantId, WamuxError> {
        let tenant = Self::tenant(id);
        let lease = self
            .engine
            .registry()
            .acquire(&tenant, AcquireOptions::default())
            .await?;
        lease.wait_ready(Duration::from_secs(5)).await?;
        Ok(tenant)
    }

    /// Polls until the session reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(
        &self,
        tenant: &TenantId,
        state: SessionState,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.engine.get_session_status(tenant) == Some(state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.engine.get_session_status(tenant) == Some(state)
    }

    /// Waits for all queues to go idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.engine.queues().wait_idle(timeout).await
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown(Duration::from_secs(5)).await;
    }
}

/// Drains every event currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<WamuxEvent>) -> Vec<WamuxEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use wamux_core::Payload;
    use wamux_engine::SendOptions;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn harness_delivers_through_the_engine() {
        let harness = TestHarness::builder().build();
        let tenant = harness.ready_session("a").await.unwrap();

        harness
            .engine
            .send_message(&tenant, "bob", Payload::text("hi"), SendOptions::default())
            .unwrap();
        assert!(harness.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(harness.client.sent_count(), 1);
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn harness_respects_auto_connect() {
        let harness = TestHarness::builder()
            .with_auto_connect(AutoConnect::Challenge("qr".into()))
            .build();
        let tenant = TestHarness::tenant("a");
        harness.engine.create_session(&tenant).await;
        assert!(
            harness
                .wait_for_state(&tenant, SessionState::WaitingCredential, Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_events_collects_buffered_events() {
        let harness = TestHarness::builder().without_start().build();
        let mut rx = harness.subscribe();
        harness.ready_session("a").await.unwrap();
        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(e, WamuxEvent::SessionCreated { .. })));
        assert!(drain_events(&mut rx).is_empty());
    }
}
