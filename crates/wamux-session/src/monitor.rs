// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic liveness probes, idle eviction and pool utilization reports.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wamux_config::{HealthConfig, PoolConfig};
use wamux_core::{HealthStatus, PoolStats, SessionState, TenantId};

use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Whether the probe loop runs. Eviction always runs.
    pub probes_enabled: bool,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub eviction_interval: Duration,
    pub idle_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(health: &HealthConfig, pool: &PoolConfig) -> Self {
        Self {
            probes_enabled: health.enabled,
            probe_interval: health.interval(),
            probe_timeout: health.probe_timeout(),
            eviction_interval: pool.eviction_interval(),
            idle_timeout: pool.idle_timeout(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default(), &PoolConfig::default())
    }
}

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Sessions that were busy or changed state before their probe ran.
    pub skipped: usize,
    pub stats: PoolStats,
}

/// Drives probes and eviction on two independent tickers.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: SessionRegistry,
    settings: MonitorSettings,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(registry: SessionRegistry, settings: MonitorSettings) -> Self {
        Self {
            registry,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self) {
        let mut probes = ticker(self.settings.probe_interval);
        let mut eviction = ticker(self.settings.eviction_interval);
        info!(
            probes = self.settings.probes_enabled,
            interval = ?self.settings.probe_interval,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = probes.tick(), if self.settings.probes_enabled => {
                    let report = self.run_probes().await;
                    if report.unhealthy > 0 {
                        warn!(
                            unhealthy = report.unhealthy,
                            probed = report.probed,
                            "health round found unhealthy sessions"
                        );
                    }
                }
                _ = eviction.tick() => {
                    self.sweep_idle().await;
                }
            }
        }
        debug!("health monitor stopped");
    }

    /// Probes every `Ready`/`Authenticated` session concurrently.
    pub async fn run_probes(&self) -> HealthReport {
        let mut targets: Vec<TenantId> = self.registry.ids_in(SessionState::Ready);
        targets.extend(self.registry.ids_in(SessionState::Authenticated));

        let timeout = self.settings.probe_timeout;
        let results = join_all(
            targets
                .iter()
                .map(|id| self.registry.probe(id, timeout)),
        )
        .await;

        let mut report = HealthReport {
            probed: targets.len(),
            ..HealthReport::default()
        };
        for result in results {
            match result {
                Some(HealthStatus::Healthy) => report.healthy += 1,
                Some(HealthStatus::Degraded(_)) => report.degraded += 1,
                Some(HealthStatus::Unhealthy(_)) => report.unhealthy += 1,
                None => report.skipped += 1,
            }
        }
        report.stats = self.report();
        debug!(
            probed = report.probed,
            healthy = report.healthy,
            degraded = report.degraded,
            unhealthy = report.unhealthy,
            skipped = report.skipped,
            "health round complete"
        );
        report
    }

    /// Evicts sessions idle longer than the configured timeout.
    pub async fn sweep_idle(&self) -> Vec<TenantId> {
        let evicted = self.registry.evict_idle(self.settings.idle_timeout).await;
        self.report();
        evicted
    }

    /// Logs and exports current pool utilization.
    pub fn report(&self) -> PoolStats {
        let stats = self.registry.pool_stats();
        debug!(
            total = stats.total,
            active = stats.active,
            ready = stats.ready,
            attached = stats.attached,
            capacity = stats.capacity,
            "pool utilization"
        );
        wamux_prometheus::set_pool_stats(&stats);
        stats
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
