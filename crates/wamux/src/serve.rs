// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `wamux serve` command implementation.
//!
//! Builds the engine over the loopback client, starts its background tasks,
//! logs lifecycle events, and drains on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wamux_bus::WamuxEvent;
use wamux_config::WamuxConfig;
use wamux_core::{KvStore, TenantId, WamuxError};
use wamux_engine::Engine;
use wamux_session::InMemoryKvStore;

use crate::loopback::LoopbackClient;
use crate::shutdown;

/// Runs the `wamux serve` command until a shutdown signal arrives.
pub async fn run_serve(
    config: WamuxConfig,
    tenants: Vec<String>,
    drain_secs: u64,
) -> Result<(), WamuxError> {
    init_tracing(&config.log.level);
    info!("starting wamux serve");

    #[cfg(feature = "prometheus")]
    let _recorder = if config.metrics.enabled {
        Some(wamux_prometheus::PrometheusRecorder::install()?)
    } else {
        None
    };

    let tenants = tenants
        .into_iter()
        .map(TenantId::parse)
        .collect::<Result<Vec<_>, _>>()?;

    let store = checkpoint_store(&config);
    let engine = Engine::new(config, Arc::new(LoopbackClient), store);
    let cancel = shutdown::install_signal_handler();
    let observer = tokio::spawn(log_events(engine.clone(), cancel.clone()));
    engine.start();

    for tenant in &tenants {
        let outcome = engine.create_session(tenant).await;
        match (&outcome.status, &outcome.error) {
            (Some(status), None) => info!(tenant = %tenant, status = %status, created = outcome.created, "session requested"),
            (_, Some(error)) => warn!(tenant = %tenant, error = %error, retryable = outcome.retryable, "session request failed"),
            (None, None) => debug!(tenant = %tenant, "session request returned no state"),
        }
    }

    cancel.cancelled().await;

    let report = engine.shutdown(Duration::from_secs(drain_secs)).await;
    if !report.drained {
        warn!("queues did not drain before the timeout, in-flight jobs were abandoned");
    }
    let _ = observer.await;
    info!("wamux stopped");
    Ok(())
}

/// Checkpoint store for this process, if checkpointing is enabled.
///
/// The store lives in memory, so checkpoints cover sessions restored within
/// the process (after eviction or an engine restart) but not across restarts
/// of the binary.
fn checkpoint_store(config: &WamuxConfig) -> Option<Arc<dyn KvStore>> {
    if !config.checkpoint.enabled {
        info!("session checkpointing disabled");
        return None;
    }
    info!(
        key_prefix = %config.checkpoint.key_prefix,
        "session checkpoints kept in memory for this process"
    );
    Some(Arc::new(InMemoryKvStore::new()))
}

/// Logs every lifecycle event until `cancel` fires.
async fn log_events(engine: Engine, cancel: CancellationToken) {
    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event observer lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn log_event(event: &WamuxEvent) {
    match event {
        WamuxEvent::CredentialChallenge { tenant, attempt, .. } => {
            info!(tenant = %tenant, attempt, "credential challenge issued");
        }
        WamuxEvent::ReconnectExhausted { tenant, attempts, .. } => {
            warn!(tenant = %tenant, attempts, "reconnection exhausted");
        }
        WamuxEvent::MessageDeadLettered { job_id, queue, reason, .. } => {
            warn!(job_id = %job_id, queue = %queue, reason = %reason, "message dead-lettered");
        }
        other => debug!(event = other.kind(), tenant = ?other.tenant(), "lifecycle event"),
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wamux={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_store_follows_config() {
        let mut config = WamuxConfig::default();
        config.checkpoint.enabled = true;
        assert!(checkpoint_store(&config).is_some());

        config.checkpoint.enabled = false;
        assert!(checkpoint_store(&config).is_none());
    }
}
