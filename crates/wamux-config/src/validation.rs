// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Semantic checks that serde attributes cannot express.

use std::collections::HashSet;

use crate::diagnostic::ConfigError;
use crate::model::{BackoffConfig, WamuxConfig};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration.
///
/// Collects every violation instead of stopping at the first one.
pub fn validate_config(config: &WamuxConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    let level = config.log.level.trim().to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        fail(format!(
            "log.level `{}` is not one of {}",
            config.log.level,
            LOG_LEVELS.join(", ")
        ));
    }

    let pool = &config.pool;
    if pool.capacity == 0 {
        fail("pool.capacity must be at least 1".to_string());
    }
    if pool.create_timeout_ms == 0 {
        fail("pool.create_timeout_ms must be greater than 0".to_string());
    }
    if pool.destroy_timeout_ms == 0 {
        fail("pool.destroy_timeout_ms must be greater than 0".to_string());
    }
    if pool.send_timeout_ms == 0 {
        fail("pool.send_timeout_ms must be greater than 0".to_string());
    }
    if pool.max_credential_attempts == 0 {
        fail("pool.max_credential_attempts must be at least 1".to_string());
    }
    if pool.eviction_interval_secs == 0 {
        fail("pool.eviction_interval_secs must be greater than 0".to_string());
    }

    let reconnect = &config.reconnect;
    for message in check_backoff("reconnect", &reconnect.backoff()) {
        fail(message);
    }
    if reconnect.max_attempts == 0 {
        fail("reconnect.max_attempts must be at least 1".to_string());
    }
    if reconnect.ready_timeout_ms == 0 {
        fail("reconnect.ready_timeout_ms must be greater than 0".to_string());
    }
    if reconnect.sweep_interval_secs == 0 {
        fail("reconnect.sweep_interval_secs must be greater than 0".to_string());
    }

    let breaker = &config.breaker;
    if breaker.failure_threshold == 0 {
        fail("breaker.failure_threshold must be at least 1".to_string());
    }
    if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
        fail(format!(
            "breaker.failure_rate_threshold must be in (0, 1], got {}",
            breaker.failure_rate_threshold
        ));
    }
    if breaker.window_size == 0 {
        fail("breaker.window_size must be at least 1".to_string());
    }
    if breaker.minimum_requests as usize > breaker.window_size {
        fail(format!(
            "breaker.minimum_requests ({}) must not exceed breaker.window_size ({})",
            breaker.minimum_requests, breaker.window_size
        ));
    }
    if breaker.cooldown_ms == 0 {
        fail("breaker.cooldown_ms must be greater than 0".to_string());
    }
    if breaker.cooldown_multiplier < 1.0 {
        fail(format!(
            "breaker.cooldown_multiplier must be at least 1.0, got {}",
            breaker.cooldown_multiplier
        ));
    }
    if breaker.max_cooldown_ms < breaker.cooldown_ms {
        fail("breaker.max_cooldown_ms must not be below breaker.cooldown_ms".to_string());
    }
    if breaker.call_timeout_ms == 0 {
        fail("breaker.call_timeout_ms must be greater than 0".to_string());
    }

    if config.health.enabled {
        if config.health.interval_secs == 0 {
            fail("health.interval_secs must be greater than 0".to_string());
        }
        if config.health.probe_timeout_ms == 0 {
            fail("health.probe_timeout_ms must be greater than 0".to_string());
        }
    }

    if config.rate_limit.enabled {
        if config.rate_limit.max_per_window == 0 {
            fail("rate_limit.max_per_window must be at least 1".to_string());
        }
        if config.rate_limit.window_ms == 0 {
            fail("rate_limit.window_ms must be greater than 0".to_string());
        }
    }

    if config.checkpoint.enabled {
        if config.checkpoint.key_prefix.trim().is_empty() {
            fail("checkpoint.key_prefix must not be empty".to_string());
        }
        if config.checkpoint.challenge_ttl_secs == 0 {
            fail("checkpoint.challenge_ttl_secs must be greater than 0".to_string());
        }
    }

    if config.queues.is_empty() {
        fail("at least one [[queues]] entry is required".to_string());
    }
    let mut seen = HashSet::new();
    for (i, queue) in config.queues.iter().enumerate() {
        if queue.name.trim().is_empty() {
            fail(format!("queues[{i}].name must not be empty"));
            continue;
        }
        if !seen.insert(queue.name.as_str()) {
            fail(format!("duplicate queue name `{}` in [[queues]] array", queue.name));
        }
        let label = format!("queues.{}", queue.name);
        if queue.concurrency == 0 {
            fail(format!("{label}.concurrency must be at least 1"));
        }
        if queue.max_attempts == 0 {
            fail(format!("{label}.max_attempts must be at least 1"));
        }
        for message in check_backoff(&format!("{label}.backoff"), &queue.backoff) {
            fail(message);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_backoff(label: &str, backoff: &BackoffConfig) -> Vec<String> {
    let mut messages = Vec::new();
    if backoff.base_delay_ms == 0 {
        messages.push(format!("{label}.base_delay_ms must be greater than 0"));
    }
    if backoff.max_delay_ms < backoff.base_delay_ms {
        messages.push(format!(
            "{label}.max_delay_ms ({}) must not be below base_delay_ms ({})",
            backoff.max_delay_ms, backoff.base_delay_ms
        ));
    }
    if backoff.multiplier < 1.0 {
        messages.push(format!(
            "{label}.multiplier must be at least 1.0, got {}",
            backoff.multiplier
        ));
    }
    if !(0.0..1.0).contains(&backoff.jitter) {
        messages.push(format!(
            "{label}.jitter must be in [0, 1), got {}",
            backoff.jitter
        ));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueueConfig;

    fn has_message(errors: &[ConfigError], needle: &str) -> bool {
        errors
            .iter()
            .any(|e| matches!(e, ConfigError::Validation { message } if message.contains(needle)))
    }

    #[test]
    fn default_config_validates() {
        assert!(validate_config(&WamuxConfig::default()).is_ok());
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let mut config = WamuxConfig::default();
        config.pool.capacity = 0;
        let errors = validate_config(&config).unwrap_err();
        assert!(has_message(&errors, "pool.capacity"));
    }

    #[test]
    fn collects_all_errors() {
        let mut config = WamuxConfig::default();
        config.pool.capacity = 0;
        config.breaker.failure_rate_threshold = 1.5;
        config.reconnect.jitter = 1.0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(has_message(&errors, "failure_rate_threshold"));
        assert!(has_message(&errors, "reconnect.jitter"));
    }

    #[test]
    fn duplicate_queue_names_fail_validation() {
        let mut config = WamuxConfig::default();
        config.queues = vec![QueueConfig::new("bulk"), QueueConfig::new("bulk")];
        let errors = validate_config(&config).unwrap_err();
        assert!(has_message(&errors, "duplicate queue name `bulk`"));
    }

    #[test]
    fn queue_backoff_is_checked() {
        let mut config = WamuxConfig::default();
        let mut queue = QueueConfig::new("bulk");
        queue.backoff.max_delay_ms = 10;
        queue.concurrency = 0;
        config.queues = vec![queue];
        let errors = validate_config(&config).unwrap_err();
        assert!(has_message(&errors, "queues.bulk.backoff.max_delay_ms"));
        assert!(has_message(&errors, "queues.bulk.concurrency"));
    }

    #[test]
    fn empty_queue_list_fails_validation() {
        let mut config = WamuxConfig::default();
        config.queues.clear();
        let errors = validate_config(&config).unwrap_err();
        assert!(has_message(&errors, "[[queues]]"));
    }

    #[test]
    fn disabled_sections_skip_checks() {
        let mut config = WamuxConfig::default();
        config.rate_limit.enabled = false;
        config.rate_limit.max_per_window = 0;
        config.health.enabled = false;
        config.health.interval_secs = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn unknown_log_level_fails_validation() {
        let mut config = WamuxConfig::default();
        config.log.level = "loud".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert!(has_message(&errors, "log.level"));
    }
}
