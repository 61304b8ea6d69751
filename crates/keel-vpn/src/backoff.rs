//! Bounded exponential backoff
//!
//! Used by the configuration resolver for transient control-plane faults.
//! Every wait observes the attempt's cancellation token.

use crate::cancel::CancelToken;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor per further failure
    pub factor: u32,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2,
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based):
    /// `min(base * factor^(attempt-1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self
            .factor
            .max(1)
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry<E> {
    /// Cancellation was signalled
    Cancelled,
    /// A non-retryable error, or the last attempt's error
    Failed(E),
}

/// Run `operation` until it succeeds, fails with a non-retryable error, runs
/// out of attempts, or is cancelled.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut operation: F,
    retryable: R,
) -> Result<T, Retry<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match cancel.run(operation(attempt)).await {
            None => return Err(Retry::Cancelled),
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) => err,
        };

        if !retryable(&err) || attempt >= max_attempts {
            return Err(Retry::Failed(err));
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "Attempt {}/{} failed: {} (retrying in {:?})",
            attempt, max_attempts, err, delay
        );

        if cancel.run(tokio::time::sleep(delay)).await.is_none() {
            return Err(Retry::Cancelled);
        }
    }
}
