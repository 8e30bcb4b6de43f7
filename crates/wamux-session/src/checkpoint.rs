// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session and credential-challenge checkpoints in the external KV store.
//!
//! Checkpointing is best effort: store failures are logged and never fail
//! the registry operation that triggered them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use wamux_config::CheckpointConfig;
use wamux_core::{KvStore, SessionSnapshot, TenantId};

/// Writes and reads checkpoints under `{prefix}:session:{id}` and
/// `{prefix}:challenge:{id}`.
#[derive(Clone)]
pub struct Checkpointer {
    store: Option<Arc<dyn KvStore>>,
    prefix: String,
    session_ttl: Duration,
    challenge_ttl: Duration,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn KvStore>, config: &CheckpointConfig) -> Self {
        Self {
            store: config.enabled.then_some(store),
            prefix: config.key_prefix.clone(),
            session_ttl: config.session_ttl(),
            challenge_ttl: config.challenge_ttl(),
        }
    }

    /// A checkpointer that never touches a store.
    pub fn disabled() -> Self {
        let config = CheckpointConfig::default();
        Self {
            store: None,
            prefix: config.key_prefix.clone(),
            session_ttl: config.session_ttl(),
            challenge_ttl: config.challenge_ttl(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn session_key(&self, id: &TenantId) -> String {
        format!("{}:session:{id}", self.prefix)
    }

    pub fn challenge_key(&self, id: &TenantId) -> String {
        format!("{}:challenge:{id}", self.prefix)
    }

    pub async fn save_snapshot(&self, snapshot: &SessionSnapshot) {
        let Some(store) = &self.store else { return };
        let key = self.session_key(&snapshot.id);
        let value = match serde_json::to_string(snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(tenant = %snapshot.id, error = %e, "failed to encode session checkpoint");
                return;
            }
        };
        if let Err(e) = store.set_with_expiry(&key, &value, self.session_ttl).await {
            warn!(tenant = %snapshot.id, error = %e, "failed to write session checkpoint");
        } else {
            debug!(tenant = %snapshot.id, state = %snapshot.state, "session checkpoint written");
        }
    }

    /// Reads the last snapshot. Undecodable checkpoints are treated as absent.
    pub async fn load_snapshot(&self, id: &TenantId) -> Option<SessionSnapshot> {
        let store = self.store.as_ref()?;
        let raw = match store.get(&self.session_key(id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(tenant = %id, error = %e, "failed to read session checkpoint");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(tenant = %id, error = %e, "discarding corrupt session checkpoint");
                None
            }
        }
    }

    pub async fn save_challenge(&self, id: &TenantId, data: &str) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store
            .set_with_expiry(&self.challenge_key(id), data, self.challenge_ttl)
            .await
        {
            warn!(tenant = %id, error = %e, "failed to write credential challenge");
        }
    }

    pub async fn load_challenge(&self, id: &TenantId) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(&self.challenge_key(id)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tenant = %id, error = %e, "failed to read credential challenge");
                None
            }
        }
    }

    pub async fn clear_challenge(&self, id: &TenantId) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.delete(&self.challenge_key(id)).await {
            warn!(tenant = %id, error = %e, "failed to delete credential challenge");
        }
    }

    /// Removes both keys for `id`.
    pub async fn clear(&self, id: &TenantId) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.delete(&self.session_key(id)).await {
            warn!(tenant = %id, error = %e, "failed to delete session checkpoint");
        }
        self.clear_challenge(id).await;
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("enabled", &self.is_enabled())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wamux_core::{SessionMetrics, SessionState};

    use super::*;
    use crate::memory::InMemoryKvStore;

    fn snapshot(id: &str) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            id: TenantId::parse(id).unwrap(),
            state: SessionState::Ready,
            created_at: now,
            last_active_at: now,
            ready_at: Some(now),
            retry_count: 0,
            credential_attempts: 0,
            metrics: SessionMetrics::default(),
        }
    }

    #[tokio::test]
    async fn snapshot_survives_store_round_trip() {
        let store = Arc::new(InMemoryKvStore::new());
        let checkpointer = Checkpointer::new(store.clone(), &CheckpointConfig::default());
        let snap = snapshot("a");

        checkpointer.save_snapshot(&snap).await;
        assert!(store.contains("wamux:session:a"));
        assert_eq!(checkpointer.load_snapshot(&snap.id).await, Some(snap));
    }

    #[tokio::test]
    async fn disabled_config_skips_the_store() {
        let store = Arc::new(InMemoryKvStore::new());
        let config = CheckpointConfig {
            enabled: false,
            ..CheckpointConfig::default()
        };
        let checkpointer = Checkpointer::new(store.clone(), &config);
        checkpointer.save_snapshot(&snapshot("a")).await;
        assert!(!checkpointer.is_enabled());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_reads_as_absent() {
        let store = Arc::new(InMemoryKvStore::new());
        store
            .set_with_expiry("wamux:session:a", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        let checkpointer = Checkpointer::new(store, &CheckpointConfig::default());
        assert!(checkpointer.load_snapshot(&TenantId::parse("a").unwrap()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_expires_with_its_ttl() {
        let store = Arc::new(InMemoryKvStore::new());
        let checkpointer = Checkpointer::new(store, &CheckpointConfig::default());
        let id = TenantId::parse("a").unwrap();

        checkpointer.save_challenge(&id, "qr-1").await;
        assert_eq!(checkpointer.load_challenge(&id).await.as_deref(), Some("qr-1"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(checkpointer.load_challenge(&id).await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_both_keys() {
        let store = Arc::new(InMemoryKvStore::new());
        let checkpointer = Checkpointer::new(store.clone(), &CheckpointConfig::default());
        let snap = snapshot("a");
        checkpointer.save_snapshot(&snap).await;
        checkpointer.save_challenge(&snap.id, "qr").await;

        checkpointer.clear(&snap.id).await;
        assert!(store.is_empty());
    }
}
