//! Reconnect backoff policy: capped exponential delay with bounded jitter.

use std::time::Duration;

/// Shape of the reconnect delay curve and the retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry. Default: 1s.
    pub base: Duration,
    /// Upper bound on the exponential term. Default: 30s.
    pub cap: Duration,
    /// Jitter as a fraction of the exponential term. Default: 0.10.
    pub jitter_ratio: f64,
    /// Retries allowed before the failure becomes terminal. Default: 10.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_ratio: 0.10,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// The exponential term `min(base * 2^attempt, cap)`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        // 2^31 seconds already dwarfs any sane cap
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `attempt`.
    ///
    /// `unit` is a uniform sample from `[0, 1)`; it is clamped so the result
    /// always lies in `[exp, exp * (1 + jitter_ratio)]`. A `jitter_ratio`
    /// outside `[0, 1]` is clamped, and a non-finite one counts as zero.
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self.exponential(attempt);
        let jitter = exp.as_secs_f64() * unit_interval(self.jitter_ratio) * unit_interval(unit);
        exp.saturating_add(Duration::try_from_secs_f64(jitter).unwrap_or(Duration::ZERO))
    }

    /// Returns true while another retry is allowed after `attempt` retries.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_curve() {
        let policy = BackoffPolicy::default();
        let secs: Vec<u64> = (0..8).map(|n| policy.exponential(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(2, 0.0), Duration::from_secs(4));
        assert!(policy.delay(2, 0.999) <= Duration::from_millis(4400));
        assert_eq!(policy.delay(2, f64::NAN), Duration::from_secs(4));
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.exponential(1_000), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_budget() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_out_of_range_jitter_ratio_is_clamped() {
        let infinite = BackoffPolicy {
            jitter_ratio: f64::INFINITY,
            ..Default::default()
        };
        assert_eq!(infinite.delay(2, 0.5), Duration::from_secs(4));

        let nan = BackoffPolicy {
            jitter_ratio: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.delay(2, 0.5), Duration::from_secs(4));

        let wide = BackoffPolicy {
            jitter_ratio: 5.0,
            ..Default::default()
        };
        assert_eq!(wide.delay(2, 0.5), Duration::from_secs(6));
    }

    #[test]
    fn test_unbounded_cap_does_not_overflow() {
        let policy = BackoffPolicy {
            cap: Duration::MAX,
            jitter_ratio: 1.0,
            ..Default::default()
        };
        assert!(policy.delay(63, 0.99) >= policy.exponential(63));
    }

    proptest! {
        #[test]
        fn prop_delay_within_jitter_window(attempt in 0u32..40, unit in 0.0f64..1.0) {
            let policy = BackoffPolicy::default();
            let exp = policy.exponential(attempt);
            let delay = policy.delay(attempt, unit);
            prop_assert!(delay >= exp);
            prop_assert!(delay.as_secs_f64() <= exp.as_secs_f64() * 1.1 + 1e-9);
            prop_assert!(exp <= policy.cap);
        }

        #[test]
        fn prop_delays_non_decreasing_until_cap(attempt in 0u32..12, u1 in 0.0f64..1.0, u2 in 0.0f64..1.0) {
            let policy = BackoffPolicy::default();
            if policy.exponential(attempt + 1) < policy.cap {
                prop_assert!(policy.delay(attempt, u1) <= policy.delay(attempt + 1, u2));
            }
        }
    }
}
