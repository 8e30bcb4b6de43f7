// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process chat client for running the orchestrator without a network.
//!
//! Sessions come up `Ready` immediately. Tenants whose id starts with
//! `pair-` first publish a credential challenge and authenticate after
//! [`PAIRING_DELAY`]. Sends are logged and acknowledged.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use wamux_core::{
    ChatClient, ClientEventSink, ClientHandle, DeliveryReceipt, HealthStatus, Payload, TenantId,
    WamuxError,
};

/// How long a `pair-` tenant waits before its simulated scan.
pub const PAIRING_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct LoopbackClient;

#[async_trait]
impl ChatClient for LoopbackClient {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn create(&self, tenant: &TenantId) -> Result<Box<dyn ClientHandle>, WamuxError> {
        debug!(tenant = %tenant, "loopback client created");
        Ok(Box::new(LoopbackHandle {
            tenant: tenant.clone(),
            sink: None,
        }))
    }
}

#[derive(Debug)]
struct LoopbackHandle {
    tenant: TenantId,
    sink: Option<ClientEventSink>,
}

#[async_trait]
impl ClientHandle for LoopbackHandle {
    fn attach_listeners(&mut self, sink: ClientEventSink) -> Result<(), WamuxError> {
        if self.sink.is_some() {
            return Err(WamuxError::Internal(format!(
                "listeners already attached for {}",
                self.tenant
            )));
        }
        if self.tenant.as_str().starts_with("pair-") {
            sink.credential_challenge(format!("loopback-pairing:{}", uuid::Uuid::new_v4()));
            let pairing = sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PAIRING_DELAY).await;
                pairing.authenticated();
                pairing.ready();
            });
        } else {
            sink.authenticated();
            sink.ready();
        }
        self.sink = Some(sink);
        Ok(())
    }

    async fn send(&self, recipient: &str, payload: &Payload) -> Result<DeliveryReceipt, WamuxError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_string(payload)
            .map_err(|e| WamuxError::Internal(format!("failed to encode payload: {e}")))?;
        info!(tenant = %self.tenant, recipient, message_id = %message_id, body = %body, "loopback delivery");
        Ok(DeliveryReceipt {
            message_id,
            delivered_at: Utc::now(),
        })
    }

    async fn probe(&self) -> Result<HealthStatus, WamuxError> {
        Ok(HealthStatus::Healthy)
    }

    async fn destroy(&mut self) -> Result<(), WamuxError> {
        self.sink = None;
        debug!(tenant = %self.tenant, "loopback client destroyed");
        Ok(())
    }
}
