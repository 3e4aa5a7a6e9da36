//! Reconnect backoff policy

use crate::config::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap and random jitter
///
/// The delay before attempt `n` (1-based) is
/// `initial * multiplier^(n-1)`, capped at `max`, then scaled by a random
/// factor in `[1 - jitter, 1 + jitter]` and capped again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt
    #[serde(with = "duration_ms", rename = "initial_ms")]
    pub initial: Duration,
    /// Upper bound on any delay
    #[serde(with = "duration_ms", rename = "max_ms")]
    pub max: Duration,
    /// Growth factor per attempt, values below 1 are treated as 1
    pub multiplier: f64,
    /// Relative jitter in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, handy for deterministic schedules
    pub fn fixed(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Delay before attempt `attempt` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        if exponent == 0 || self.multiplier.is_nan() || self.multiplier <= 1.0 {
            return self.initial.min(self.max);
        }
        self.clamp(self.initial.as_secs_f64() * self.multiplier.powi(exponent))
    }

    /// Delay before attempt `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        self.clamp(base.as_secs_f64() * factor)
    }

    fn clamp(&self, seconds: f64) -> Duration {
        let max = self.max.as_secs_f64();
        if seconds.is_nan() || seconds <= 0.0 {
            Duration::ZERO
        } else if seconds >= max {
            self.max
        } else {
            Duration::from_secs_f64(seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_secs(1));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(500), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1500), "{:?}", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let policy = BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(10),
            multiplier: 3.0,
            jitter: 1.0,
        };
        for attempt in 1..20 {
            assert!(policy.delay(attempt) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_multiplier_below_one() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(300), Duration::from_secs(5), 0.5);
        assert_eq!(policy.base_delay(1), Duration::from_millis(300));
        assert_eq!(policy.base_delay(6), Duration::from_millis(300));
    }
}
