//! Linear backoff with an attempt ceiling.

/// How failed sends are rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Jobs at or above this try count are dead letters.
    pub max_attempts: u32,
    /// Seconds added per previous attempt.
    pub backoff_unit_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff_unit_secs: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, from the try count before this failure.
    /// The first failure retries on the next cycle.
    pub fn delay_secs(&self, try_count: u32) -> i64 {
        i64::from(try_count).saturating_mul(self.backoff_unit_secs)
    }

    /// Due time for the next attempt of a job that just failed at `now`.
    pub fn next_send_at(&self, try_count: u32, now: i64) -> i64 {
        now.saturating_add(self.delay_secs(try_count))
    }

    pub fn is_exhausted(&self, try_count: u32) -> bool {
        try_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_secs(0), 0);
        assert_eq!(policy.delay_secs(1), 100);
        assert_eq!(policy.delay_secs(7), 700);
        assert_eq!(policy.next_send_at(3, 1_000), 1_300);
    }

    #[test]
    fn exhaustion_at_ceiling() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(19));
        assert!(policy.is_exhausted(20));
        assert!(policy.is_exhausted(u32::MAX));
    }

    #[test]
    fn next_send_at_saturates() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_unit_secs: i64::MAX,
        };
        assert_eq!(policy.next_send_at(u32::MAX, i64::MAX - 1), i64::MAX);
    }
}
