// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! External chat client contract.
//!
//! A [`ChatClient`] creates one [`ClientHandle`] per tenant. The registry owns
//! each handle exclusively and hands it a [`ClientEventSink`] through which
//! the client reports lifecycle callbacks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WamuxError;
use crate::types::{DeliveryReceipt, DisconnectReason, HealthStatus, Payload, TenantId};

/// Lifecycle callback kinds reported by an external client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEventKind {
    /// A credential challenge (e.g. pairing QR data) must be shown to the tenant.
    CredentialChallenge(String),
    /// The credential was accepted.
    Authenticated,
    /// The channel is fully operational.
    Ready,
    /// The connection dropped.
    Disconnected(DisconnectReason),
    /// An inbound message arrived on the channel.
    MessageReceived,
    /// A non-fatal error occurred inside the client.
    Error(String),
}

/// A lifecycle callback tagged with the attachment it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub tenant: TenantId,
    /// Attachment generation. Events from a torn-down attachment are ignored.
    pub generation: u64,
    pub kind: ClientEventKind,
}

/// Listener endpoint handed to [`ClientHandle::attach_listeners`].
#[derive(Debug, Clone)]
pub struct ClientEventSink {
    tenant: TenantId,
    generation: u64,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEventSink {
    pub fn new(tenant: TenantId, generation: u64, tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            tenant,
            generation,
            tx,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports a lifecycle event. Returns `false` once the registry stopped listening.
    pub fn emit(&self, kind: ClientEventKind) -> bool {
        self.tx
            .send(ClientEvent {
                tenant: self.tenant.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn credential_challenge(&self, data: impl Into<String>) -> bool {
        self.emit(ClientEventKind::CredentialChallenge(data.into()))
    }

    pub fn authenticated(&self) -> bool {
        self.emit(ClientEventKind::Authenticated)
    }

    pub fn ready(&self) -> bool {
        self.emit(ClientEventKind::Ready)
    }

    pub fn disconnected(&self, reason: DisconnectReason) -> bool {
        self.emit(ClientEventKind::Disconnected(reason))
    }

    pub fn message_received(&self) -> bool {
        self.emit(ClientEventKind::MessageReceived)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(ClientEventKind::Error(message.into()))
    }

    /// Whether the registry side of the sink is still listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Factory for per-tenant external client instances.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Human-readable name of the client implementation.
    fn name(&self) -> &str;

    /// Creates a new client instance for `tenant`.
    async fn create(&self, tenant: &TenantId) -> Result<Box<dyn ClientHandle>, WamuxError>;
}

/// One live external client instance, exclusively owned by a session record.
#[async_trait]
pub trait ClientHandle: Send + Sync + 'static {
    /// Registers the lifecycle listener. Called exactly once per handle, before any other call.
    fn attach_listeners(&mut self, sink: ClientEventSink) -> Result<(), WamuxError>;

    /// Transmits `payload` to `recipient`.
    async fn send(&self, recipient: &str, payload: &Payload)
    -> Result<DeliveryReceipt, WamuxError>;

    /// Checks liveness of the underlying connection.
    async fn probe(&self) -> Result<HealthStatus, WamuxError>;

    /// Tears the client down and releases its resources.
    async fn destroy(&mut self) -> Result<(), WamuxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_tags_events_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tenant = TenantId::parse("t1").unwrap();
        let sink = ClientEventSink::new(tenant.clone(), 7, tx);

        assert!(sink.credential_challenge("qr-data"));
        assert!(sink.ready());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tenant, tenant);
        assert_eq!(first.generation, 7);
        assert_eq!(first.kind, ClientEventKind::CredentialChallenge("qr-data".into()));
        assert_eq!(rx.recv().await.unwrap().kind, ClientEventKind::Ready);
    }

    #[tokio::test]
    async fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ClientEventSink::new(TenantId::parse("t1").unwrap(), 1, tx);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.authenticated());
    }
}
