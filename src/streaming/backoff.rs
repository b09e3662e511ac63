//! Reconnect backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Reconnect delay configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay in milliseconds
    pub base_ms: u64,
    /// Maximum delay in milliseconds, before jitter
    pub max_ms: u64,
    /// Jitter factor (0.0 to 1.0) - upper bound of the random extra delay
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
            jitter_ratio: 0.3,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            ..Self::default()
        }
    }

    /// `min(base * 2^attempt, max)` without jitter (0-indexed attempt)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exp_backoff = self.base_ms.saturating_mul(factor);
        Duration::from_millis(exp_backoff.min(self.max_ms))
    }

    /// Delay with `fraction` (0.0 to 1.0) of the jitter range applied
    pub fn delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let base = self.base_delay(attempt);
        let fraction = fraction.clamp(0.0, 1.0);
        let jitter_ms = base.as_millis() as f64 * self.jitter_ratio * fraction;
        base + Duration::from_millis(jitter_ms as u64)
    }

    /// Delay for the next reconnect, with random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(attempt, fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = ReconnectPolicy::new(1000, 30_000);
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.base_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = ReconnectPolicy::new(1000, 30_000);
        assert_eq!(policy.base_delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy::new(1000, 30_000);
        assert_eq!(policy.delay_with_jitter(2, 0.0), Duration::from_millis(4000));
        assert_eq!(policy.delay_with_jitter(2, 1.0), Duration::from_millis(5200));
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(
            base in 1u64..5_000,
            cap_factor in 1u64..64,
            attempt in 0u32..40,
            fraction in 0.0f64..=1.0,
        ) {
            let policy = ReconnectPolicy::new(base, base * cap_factor);
            let lower = base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX)).min(base * cap_factor);
            let delay = policy.delay_with_jitter(attempt, fraction).as_millis() as u64;
            prop_assert!(delay >= lower);
            prop_assert!(delay as f64 <= lower as f64 * 1.3 + 1.0);
        }

        #[test]
        fn prop_delays_non_decreasing(base in 1u64..5_000, cap_factor in 1u64..64, attempts in 1u32..30) {
            let policy = ReconnectPolicy::new(base, base * cap_factor);
            let mut previous = Duration::ZERO;
            for n in 0..attempts {
                let delay = policy.base_delay(n);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
