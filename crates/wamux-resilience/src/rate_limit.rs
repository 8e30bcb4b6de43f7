// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sliding-window rate limiter keyed by (session, recipient).

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use wamux_config::RateLimitConfig;
use wamux_core::{TenantId, WamuxError};

type Key = (TenantId, String);

/// Allows at most `max_per_window` sends per key in any trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    log: DashMap<Key, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1) as usize,
            window,
            log: DashMap::new(),
        }
    }

    /// `None` when rate limiting is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_per_window, config.window()))
    }

    /// Records a send for the key, or fails with [`WamuxError::RateLimited`]
    /// without recording anything.
    pub fn check(&self, tenant: &TenantId, recipient: &str) -> Result<(), WamuxError> {
        let now = Instant::now();
        let mut entry = self
            .log
            .entry((tenant.clone(), recipient.to_string()))
            .or_default();
        let stamps = entry.value_mut();
        self.expire(stamps, now);

        if stamps.len() >= self.max_per_window {
            let retry_after = stamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            tracing::debug!(
                tenant = %tenant,
                recipient,
                retry_after_ms = retry_after.as_millis() as u64,
                "recipient rate limit reached"
            );
            return Err(WamuxError::RateLimited {
                key: format!("{tenant}:{recipient}"),
                retry_after,
            });
        }

        stamps.push_back(now);
        Ok(())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of (tenant, recipient) keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.log.len()
    }

    /// Sends still allowed for the key in the current window.
    pub fn remaining(&self, tenant: &TenantId, recipient: &str) -> usize {
        let now = Instant::now();
        match self.log.get_mut(&(tenant.clone(), recipient.to_string())) {
            Some(mut entry) => {
                self.expire(entry.value_mut(), now);
                self.max_per_window.saturating_sub(entry.len())
            }
            None => self.max_per_window,
        }
    }

    /// Drops keys with no sends inside the window. Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.log.len();
        self.log.retain(|_, stamps| {
            self.expire(stamps, now);
            !stamps.is_empty()
        });
        before.saturating_sub(self.log.len())
    }

    /// Forgets every key belonging to `tenant`.
    pub fn forget_tenant(&self, tenant: &TenantId) {
        self.log.retain(|(owner, _), _| owner != tenant);
    }

    fn expire(&self, stamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_in_window_is_limited() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t = tenant("a");
        limiter.check(&t, "r").unwrap();
        match limiter.check(&t, "r") {
            Err(WamuxError::RateLimited { key, retry_after }) => {
                assert_eq!(key, "a:r");
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let t = tenant("a");
        limiter.check(&t, "r").unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        limiter.check(&t, "r").unwrap();
        assert!(limiter.check(&t, "r").is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(limiter.remaining(&t, "r"), 1);
        limiter.check(&t, "r").unwrap();
        assert!(limiter.check(&t, "r").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check(&tenant("a"), "r1").unwrap();
        limiter.check(&tenant("a"), "r2").unwrap();
        limiter.check(&tenant("b"), "r1").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_expired_keys() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        limiter.check(&tenant("a"), "r").unwrap();
        limiter.check(&tenant("b"), "r").unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.purge_idle(), 2);
        assert_eq!(limiter.remaining(&tenant("a"), "r"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_tenant_clears_its_keys() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check(&tenant("a"), "r").unwrap();
        limiter.forget_tenant(&tenant("a"));
        limiter.check(&tenant("a"), "r").unwrap();
    }

    #[test]
    fn disabled_config_builds_nothing() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        assert!(RateLimiter::from_config(&config).is_none());
        assert!(RateLimiter::from_config(&RateLimitConfig::default()).is_some());
    }
}
