//! Retry policy for per-point acquisitions.

use crate::error::BenchError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How often a failed acquisition is re-attempted.
///
/// `max_attempts` counts the first try, so the default of 1 means no retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether an error of this kind is worth another attempt.
    ///
    /// Transport, decode and synchronization failures are; configuration
    /// errors and cancellation are not.
    pub fn is_retryable(error: &BenchError) -> bool {
        matches!(
            error,
            BenchError::Instrument { .. }
                | BenchError::Parse { .. }
                | BenchError::SynchronizationTimeout { .. }
        )
    }

    /// Decide whether to go again after `attempt` (1-based) failed with
    /// `error`, sleeping the backoff delay if so.
    pub async fn retry_after(&self, attempt: u32, error: &BenchError) -> bool {
        if attempt >= self.max_attempts || !Self::is_retryable(error) {
            return false;
        }
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            error = %error,
            "acquisition failed, retrying"
        );
        sleep(self.backoff_delay).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm_error() -> BenchError {
        BenchError::Instrument {
            instrument: "dmm".into(),
            command: "FETC?".into(),
            message: "timeout".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_policy_does_not_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.retry_after(1, &comm_error()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_budget_spent() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let start = tokio::time::Instant::now();
        assert!(policy.retry_after(1, &comm_error()).await);
        assert!(policy.retry_after(2, &comm_error()).await);
        assert!(!policy.retry_after(3, &comm_error()).await);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_final() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_delay: Duration::from_millis(10),
        };
        assert!(!policy.retry_after(1, &BenchError::Cancelled { index: 0 }).await);
        assert!(!policy
            .retry_after(1, &BenchError::Configuration("bad".into()))
            .await);
    }
}
