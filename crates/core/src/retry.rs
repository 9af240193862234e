//! Retry ceiling and exponential backoff.

use chrono::Duration;

/// Retry policy applied by the failure handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt count at which a job becomes MAX_RETRIES
    pub max_attempts: u32,
    /// Delay after the first failure; doubles with every further failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(2),
            max_delay: Duration::hours(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before a job with `attempt_count` failures becomes due again.
    ///
    /// With the default policy this is `2^attempt_count` seconds.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::zero();
        }

        2_i64
            .checked_pow(attempt_count - 1)
            .and_then(|factor| i32::try_from(factor).ok())
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// True once a job has failed as often as the ceiling allows.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_for(1), Duration::seconds(2));
        assert_eq!(policy.backoff_for(2), Duration::seconds(4));
        assert_eq!(policy.backoff_for(3), Duration::seconds(8));
        assert_eq!(policy.backoff_for(4), Duration::seconds(16));
    }

    #[test]
    fn zero_attempts_has_no_delay() {
        assert_eq!(RetryPolicy::default().backoff_for(0), Duration::zero());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(50, Duration::seconds(2), Duration::seconds(30));
        assert_eq!(policy.backoff_for(5), Duration::seconds(30));
        assert_eq!(policy.backoff_for(40), Duration::seconds(30));
    }

    #[test]
    fn exhaustion_respects_ceiling() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    proptest! {
        #[test]
        fn backoff_below_ceiling_is_power_of_two_seconds(k in 1u32..5) {
            let policy = RetryPolicy::default();
            prop_assert_eq!(policy.backoff_for(k), Duration::seconds(1_i64 << k));
        }

        #[test]
        fn backoff_never_decreases(k in 0u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.backoff_for(k) <= policy.backoff_for(k + 1));
        }
    }
}
