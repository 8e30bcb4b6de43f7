// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus metrics for the Wamux session orchestrator.
//!
//! Components record through the metrics-rs facade via [`recording`]. The
//! binary installs [`PrometheusRecorder`] when metrics are enabled; an
//! external HTTP layer can serve [`PrometheusRecorder::render`].

pub mod recording;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use wamux_core::WamuxError;

pub use recording::{
    record_breaker_call, record_breaker_transition, record_delivery_latency, record_job,
    record_probe, record_reconnect, record_session_created, record_session_destroyed,
    record_transition, register_metrics, set_pool_stats, set_queue_depth,
};

/// Handle to the globally installed Prometheus recorder.
pub struct PrometheusRecorder {
    handle: PrometheusHandle,
}

impl PrometheusRecorder {
    /// Installs the recorder process-wide and registers metric descriptions.
    ///
    /// Fails if another recorder is already installed.
    pub fn install() -> Result<Self, WamuxError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| WamuxError::Internal(format!("failed to install Prometheus recorder: {e}")))?;
        register_metrics();
        tracing::info!("prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Current metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use wamux_core::{PoolStats, SessionState};

    use super::*;

    fn render_with_local_recorder(f: impl FnOnce()) -> String {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, f);
        handle.render()
    }

    #[test]
    fn transitions_are_labelled_by_state() {
        let out = render_with_local_recorder(|| {
            record_transition(SessionState::Ready, SessionState::Disconnected);
        });
        assert!(out.contains("wamux_session_transitions_total"));
        assert!(out.contains("from=\"ready\""));
        assert!(out.contains("to=\"disconnected\""));
    }

    #[test]
    fn pool_gauges_cover_every_category() {
        let out = render_with_local_recorder(|| {
            set_pool_stats(&PoolStats {
                total: 3,
                active: 1,
                ready: 2,
                attached: 2,
                capacity: 10,
            });
        });
        for kind in ["total", "active", "ready", "attached"] {
            assert!(out.contains(&format!("kind=\"{kind}\"")), "{out}");
        }
        assert!(out.contains("wamux_pool_capacity"));
    }

    #[test]
    fn job_outcomes_are_counted_per_queue() {
        let out = render_with_local_recorder(|| {
            record_job("outbound", "delivered");
            record_job("outbound", "delivered");
            record_job("media", "dead_lettered");
        });
        assert!(out.contains("outcome=\"delivered\""));
        assert!(out.contains("queue=\"media\""));
    }
}
