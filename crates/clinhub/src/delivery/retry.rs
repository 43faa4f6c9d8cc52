//! Retry policy for outbound command delivery.

use std::time::Duration;

/// Exponential backoff with a bounded number of attempts.
///
/// The delay after failed attempt N is `min(base_delay * 2^(N-1), max_delay)`.
///
/// With defaults (base=1s, max=300s):
/// - Attempt 1 fails: retry after 1s
/// - Attempt 2 fails: retry after 2s
/// - Attempt 3 fails: retry after 4s
/// - Attempt 4 fails: retry after 8s
/// - Attempt 5 fails: exhausted
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use clinhub::delivery::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     ..Default::default()
/// };
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// assert_eq!(policy.backoff_duration(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a command is marked exhausted, including the first.
    ///
    /// Default: 5.
    pub max_attempts: u32,

    /// Delay after the first failed attempt. Default: 1 second.
    pub base_delay: Duration,

    /// Upper bound on the delay. Default: 5 minutes.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if another attempt follows failed attempt `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}
