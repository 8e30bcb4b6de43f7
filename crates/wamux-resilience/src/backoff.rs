// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry delay computation shared by the reconnection scheduler and the
//! delivery queues.

use std::time::Duration;

use rand::Rng;
use wamux_config::{BackoffConfig, BackoffKind};

/// Delay curve with symmetric jitter, clamped to `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    kind: BackoffKind,
    base: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            multiplier: multiplier.max(1.0),
            max: max.max(base),
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base: delay,
            multiplier: 1.0,
            max: delay,
            jitter: 0.0,
        }
    }

    pub fn linear(step: Duration, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base: step,
            multiplier: 1.0,
            max: max.max(step),
            jitter: 0.0,
        }
    }

    /// Sets the jitter fraction, clamped to `[0, 1)`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.99)
        } else {
            0.0
        };
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Deterministic delay for a zero-based attempt, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_secs_f64() * 1000.0;
        let ms = match self.kind {
            BackoffKind::Fixed => base_ms,
            BackoffKind::Linear => base_ms * (f64::from(attempt) + 1.0),
            BackoffKind::Exponential => base_ms * self.multiplier.powi(attempt.min(64) as i32),
        };
        self.clamp_ms(ms)
    }

    /// Jittered delay for a zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        self.clamp_ms(base.as_secs_f64() * 1000.0 * factor)
    }

    /// Jittered delay that never falls below `previous` and never exceeds `max`.
    ///
    /// Successive delays for one subject are therefore non-decreasing.
    pub fn delay_after(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        self.delay_after_with_rng(attempt, previous, &mut rand::thread_rng())
    }

    pub fn delay_after_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        previous: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let next = self.delay_with_rng(attempt, rng);
        match previous {
            Some(prev) => next.max(prev).min(self.max),
            None => next,
        }
    }

    fn clamp_ms(&self, ms: f64) -> Duration {
        let max_ms = self.max.as_secs_f64() * 1000.0;
        if !ms.is_finite() || ms >= max_ms {
            return self.max;
        }
        Duration::from_micros((ms.max(0.0) * 1000.0) as u64)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        let max = Duration::from_millis(config.max_delay_ms);
        let policy = match config.kind {
            BackoffKind::Exponential => Self::exponential(base, config.multiplier, max),
            BackoffKind::Linear => Self::linear(base, max),
            BackoffKind::Fixed => Self::fixed(base),
        };
        policy.with_jitter(config.jitter)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = BackoffPolicy::exponential(ms(1000), 2.0, ms(60_000));
        let delays: Vec<_> = (0..8).map(|a| policy.base_delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                ms(1000),
                ms(2000),
                ms(4000),
                ms(8000),
                ms(16_000),
                ms(32_000),
                ms(60_000),
                ms(60_000)
            ]
        );
    }

    #[test]
    fn linear_and_fixed_curves() {
        let linear = BackoffPolicy::linear(ms(100), ms(250));
        assert_eq!(linear.base_delay(0), ms(100));
        assert_eq!(linear.base_delay(1), ms(200));
        assert_eq!(linear.base_delay(5), ms(250));

        let fixed = BackoffPolicy::fixed(ms(500));
        assert_eq!(fixed.base_delay(0), ms(500));
        assert_eq!(fixed.base_delay(10), ms(500));
    }

    #[test]
    fn huge_attempts_saturate_at_max() {
        let policy = BackoffPolicy::exponential(ms(1000), 10.0, ms(5000)).with_jitter(0.5);
        assert_eq!(policy.base_delay(u32::MAX), ms(5000));
        assert!(policy.delay(u32::MAX) <= ms(5000));
    }

    #[test]
    fn jitter_varies_between_runs() {
        let policy = BackoffPolicy::exponential(ms(1000), 2.0, ms(60_000)).with_jitter(0.2);
        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(2);
        let run_a: Vec<_> = (0..5).map(|i| policy.delay_with_rng(i, &mut a)).collect();
        let run_b: Vec<_> = (0..5).map(|i| policy.delay_with_rng(i, &mut b)).collect();
        assert_ne!(run_a, run_b);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::exponential(ms(100), 2.0, ms(1000));
        assert_eq!(policy.delay(3), ms(800));
    }

    #[test]
    fn config_conversion_uses_kind() {
        let config = BackoffConfig {
            kind: BackoffKind::Fixed,
            base_delay_ms: 250,
            multiplier: 3.0,
            max_delay_ms: 10_000,
            jitter: 0.0,
        };
        let policy = BackoffPolicy::from(&config);
        assert_eq!(policy.delay(4), ms(250));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(
            base in 1u64..5_000,
            attempt in 0u32..20,
            jitter in 0.0f64..0.9,
            seed in any::<u64>(),
        ) {
            let max = ms(60_000);
            let policy = BackoffPolicy::exponential(ms(base), 2.0, max).with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay_with_rng(attempt, &mut rng);
            let nominal = policy.base_delay(attempt).as_secs_f64();
            prop_assert!(delay <= max);
            prop_assert!(delay.as_secs_f64() >= nominal * (1.0 - jitter) - 1e-3);
        }

        #[test]
        fn successive_delays_never_decrease(
            base in 1u64..2_000,
            jitter in 0.0f64..0.9,
            seed in any::<u64>(),
        ) {
            let max = ms(30_000);
            let policy = BackoffPolicy::exponential(ms(base), 2.0, max).with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous = None;
            for attempt in 0..15 {
                let delay = policy.delay_after_with_rng(attempt, previous, &mut rng);
                if let Some(prev) = previous {
                    prop_assert!(delay >= prev);
                }
                prop_assert!(delay <= max);
                previous = Some(delay);
            }
        }
    }
}
