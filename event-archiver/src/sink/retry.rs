use std::time;

/// Bounded exponential backoff for storage writes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of write attempts, the first one included.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            max_attempts,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (0-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Longest a flush can take when every attempt runs into `attempt_timeout`:
    /// all attempts plus the backoffs between them.
    pub fn worst_case_duration(&self, attempt_timeout: time::Duration) -> time::Duration {
        (0..self.max_attempts).fold(time::Duration::ZERO, |total, attempt| {
            let total = total.saturating_add(attempt_timeout);
            if self.should_retry(attempt) {
                total.saturating_add(self.time_until_next_retry(attempt))
            } else {
                total
            }
        })
    }

    /// Backoff to wait after the given 0-based attempt failed.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        std::cmp::min(candidate_interval, self.maximum_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(5, 2, Duration::from_millis(500), Duration::from_secs(30));

        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(500));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(2), Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(50, 2, Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.time_until_next_retry(4), Duration::from_secs(10));
        assert_eq!(policy.time_until_next_retry(40), Duration::from_secs(10));
    }

    #[test]
    fn test_worst_case_duration() {
        let policy = RetryPolicy::new(3, 2, Duration::from_secs(1), Duration::from_secs(10));

        // 3 attempts of 5s, backoffs of 1s and 2s
        assert_eq!(
            policy.worst_case_duration(Duration::from_secs(5)),
            Duration::from_secs(18)
        );

        let single = RetryPolicy::new(1, 2, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(
            single.worst_case_duration(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::new(3, 2, Duration::from_millis(1), Duration::from_millis(10));

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let single = RetryPolicy::new(1, 2, Duration::from_millis(1), Duration::from_millis(10));
        assert!(!single.should_retry(0));
    }
}
