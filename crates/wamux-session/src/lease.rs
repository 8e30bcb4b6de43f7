// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Leases on registry sessions.

use std::sync::Arc;
use std::time::Duration;

use wamux_core::{
    DeliveryReceipt, Payload, SessionSnapshot, SessionState, TenantId, WamuxError,
};

use crate::registry::{SessionRegistry, Slot};

/// A caller's claim on a session. The session is not evictable while any
/// lease on it is alive; dropping the lease releases it.
///
/// The external handle never leaves the registry. A lease reaches it only
/// through [`send`](Self::send), under the session's lock.
pub struct SessionLease {
    registry: SessionRegistry,
    slot: Arc<Slot>,
}

impl SessionLease {
    pub(crate) fn new(registry: SessionRegistry, slot: Arc<Slot>) -> Self {
        Self { registry, slot }
    }

    pub(crate) fn slot(&self) -> &Slot {
        &self.slot
    }

    pub fn id(&self) -> &TenantId {
        &self.slot.id
    }

    pub fn state(&self) -> SessionState {
        self.slot.record().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.slot.snapshot()
    }

    /// Waits until the session is `Ready`.
    ///
    /// Fails with `SessionUnhealthy` if it fails, is destroyed, or is still
    /// not ready after `wait`.
    pub async fn wait_ready(&self, wait: Duration) -> Result<(), WamuxError> {
        let mut state_rx = self.slot.state_tx.subscribe();
        let waited = tokio::time::timeout(wait, async {
            state_rx
                .wait_for(|state| state.is_ready() || state.is_terminal() || self.slot.is_removed())
                .await
                .map(|state| *state)
        })
        .await;

        match waited {
            Ok(Ok(state)) if state.is_ready() && !self.slot.is_removed() => Ok(()),
            Ok(Ok(state)) => Err(self.unhealthy(state, "session can no longer become ready")),
            Ok(Err(_)) => Err(WamuxError::Internal("session state channel closed".into())),
            Err(_) => Err(self.unhealthy(
                self.state(),
                format!("session not ready within {wait:?}"),
            )),
        }
    }

    /// Sends `payload` through the session's external handle.
    ///
    /// Sends on one session are serialized. Fails with `SessionUnhealthy`
    /// unless the session is `Ready`, and with `Timeout` if the client does
    /// not answer within the registry's send timeout.
    pub async fn send(
        &self,
        recipient: &str,
        payload: &Payload,
    ) -> Result<DeliveryReceipt, WamuxError> {
        let core = self.slot.core.lock().await;
        if self.slot.is_removed() {
            return Err(self.unhealthy(self.state(), "session was destroyed"));
        }
        let state = self.state();
        let handle = match core.handle() {
            Some(handle) if state.is_ready() => handle,
            _ => return Err(self.unhealthy(state, "session is not ready")),
        };

        let send_timeout = self.registry.settings().send_timeout;
        let result = match tokio::time::timeout(send_timeout, handle.send(recipient, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(WamuxError::Timeout {
                operation: format!("send on session {}", self.slot.id),
                duration: send_timeout,
            }),
        };
        drop(core);

        let mut record = self.slot.record();
        match &result {
            Ok(_) => {
                record.metrics.messages_sent += 1;
                record.touch();
            }
            Err(_) => record.metrics.errors += 1,
        }
        result
    }

    /// Ends the lease. Same as dropping it.
    pub fn release(self) {}

    fn unhealthy(&self, state: SessionState, reason: impl Into<String>) -> WamuxError {
        WamuxError::SessionUnhealthy {
            tenant: self.slot.id.to_string(),
            state,
            reason: reason.into(),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.end_lease(&self.slot);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.slot.id)
            .field("state", &self.state())
            .finish()
    }
}
