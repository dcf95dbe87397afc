//! Retry backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Quadratic backoff bounded by a retry budget.
///
/// The delay before attempt `n + 1` is `base_delay * n²`, so persistently
/// failing items fall behind quickly without needing a delay cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `retry_count`-th transient failure.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay
            .saturating_mul(retry_count.saturating_mul(retry_count))
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a failure bringing the count to `retry_count` exhausts the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(9));
    }

    #[test]
    fn test_next_attempt_grows_faster_than_linear() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_retries: 5,
        };
        let now = Utc::now();
        let gaps: Vec<i64> = (1..=4)
            .map(|n| (policy.next_attempt_at(now, n) - now).num_milliseconds())
            .collect();
        assert_eq!(gaps, vec![500, 2000, 4500, 8000]);
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_huge_counts_saturate() {
        let policy = RetryPolicy::default();
        let at = policy.next_attempt_at(Utc::now(), u32::MAX);
        assert!(at > Utc::now());
    }
}
