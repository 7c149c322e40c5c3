use std::time::Duration;

use rand::Rng;

/// Exponential retry schedule for transient delivery failures: base delay
/// doubling per attempt, capped, with bounded jitter added on top.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 8, base_delay_secs: 30, max_delay_secs: 900 }
    }
}

impl RetryPolicy {
    /// Deterministic delay before the given attempt number (1-based: the
    /// delay scheduled after `attempt` failures).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1_u64 << exponent;
        let delay_secs =
            self.base_delay_secs.saturating_mul(multiplier).min(self.max_delay_secs);
        Duration::from_secs(delay_secs)
    }

    /// Backoff plus up to 10% random jitter, still bounded by the cap.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ceiling = (base.as_secs() / 10).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        Duration::from_secs(base.as_secs().saturating_add(jitter).min(self.max_delay_secs))
    }

    pub fn attempts_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn backoff_doubles_per_attempt_until_cap() {
        let policy = RetryPolicy { max_attempts: 8, base_delay_secs: 30, max_delay_secs: 900 };

        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(6), Duration::from_secs(900));
        assert_eq!(policy.backoff(12), Duration::from_secs(900));
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing_and_bounded() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;

        for attempt in 1..=20 {
            let delay = policy.backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(policy.max_delay_secs));
            previous = delay;
        }
    }

    #[test]
    fn jittered_backoff_stays_within_cap() {
        let policy = RetryPolicy { max_attempts: 8, base_delay_secs: 30, max_delay_secs: 120 };

        for attempt in 1..=10 {
            let delay = policy.backoff_with_jitter(attempt);
            assert!(delay >= policy.backoff(attempt).min(Duration::from_secs(120)));
            assert!(delay <= Duration::from_secs(120));
        }
    }

    #[test]
    fn attempts_exhausted_at_configured_maximum() {
        let policy = RetryPolicy { max_attempts: 3, base_delay_secs: 1, max_delay_secs: 10 };

        assert!(!policy.attempts_exhausted(2));
        assert!(policy.attempts_exhausted(3));
        assert!(policy.attempts_exhausted(4));
    }
}
