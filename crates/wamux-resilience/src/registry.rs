// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lazily created breakers keyed by operation name.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use wamux_bus::EventBus;
use wamux_core::WamuxError;

use crate::circuit_breaker::{BreakerSettings, BreakerStats, CircuitBreaker};

/// Every breaker for the process, created on first use of a name.
///
/// Breakers live for the lifetime of the registry; only [`reset`](Self::reset)
/// clears their state.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    bus: Option<EventBus>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            bus: None,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The breaker for `name`, created with the shared settings if missing.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "creating circuit breaker");
                let breaker = CircuitBreaker::new(name, self.settings.clone());
                Arc::new(match &self.bus {
                    Some(bus) => breaker.with_bus(bus.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Runs `f` through the breaker named `name`.
    pub async fn execute<T, F, Fut>(&self, name: &str, f: F) -> Result<T, WamuxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WamuxError>>,
    {
        let breaker = self.get(name);
        breaker.execute(f).await
    }

    /// Resets an existing breaker. Returns `false` if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.get(name).map(|b| b.clone());
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Stats for every breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use wamux_core::CircuitState;

    use super::*;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            ..BreakerSettings::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn breakers_are_isolated_by_name() {
        let registry = registry();
        let _ = registry
            .execute("send.media", || async {
                Err::<(), _>(WamuxError::external("down"))
            })
            .await;
        assert_eq!(registry.get("send.media").state(), CircuitState::Open);
        assert_eq!(registry.get("send.outbound").state(), CircuitState::Closed);

        let ok = registry.execute("send.outbound", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_returns_same_breaker() {
        let registry = registry();
        let a = registry.get("probe");
        let b = registry.get("probe");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_named_breaker() {
        let registry = registry();
        let _ = registry
            .execute("send", || async { Err::<(), _>(WamuxError::external("x")) })
            .await;
        assert!(registry.reset("send"));
        assert!(!registry.reset("unknown"));
        assert_eq!(registry.get("send").state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_sorted() {
        let registry = registry();
        registry.get("b");
        registry.get("a");
        let names: Vec<_> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.stats()[0].retry_in.is_none());
    }
}
