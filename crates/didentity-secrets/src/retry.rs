//! Bounded retries with exponential backoff for store requests.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::warn;

use crate::error::StoreError;

/// Retry policy for secret store requests.
///
/// The defaults keep the worst case (three attempts that all hit the
/// per-attempt deadline plus two backoffs) under the two second budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled for each one after.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Deadline for the whole operation, backoffs included.
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            attempt_timeout: Duration::from_millis(500),
            total_budget: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial backoff.
    #[must_use]
    pub const fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, deadline: Duration) -> Self {
        self.attempt_timeout = deadline;
        self
    }

    /// Sets the overall budget.
    #[must_use]
    pub const fn with_total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = budget;
        self
    }

    /// Backoff to wait after the given zero-based failed attempt.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Runs `op` until it succeeds, fails permanently, or the policy is exhausted.
    ///
    /// Only [`StoreError::is_transient`] failures and attempt timeouts are
    /// retried. The last observed error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let deadline = Instant::now() + self.total_budget;
        let attempts = self.max_attempts.max(1);
        let mut last_error = StoreError::Unavailable("retry budget exhausted".to_string());

        for attempt in 0..attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(self.attempt_timeout.min(remaining), op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_transient() => return Err(err),
                Ok(Err(err)) => last_error = err,
                Err(_) => {
                    last_error = StoreError::Unavailable("request deadline exceeded".to_string());
                }
            }

            if attempt + 1 < attempts {
                let backoff = self.backoff_after(attempt);
                let remaining = deadline.saturating_duration_since(Instant::now());
                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %last_error,
                    backoff_ms = backoff.as_millis() as u64,
                    "store request failed, retrying"
                );
                sleep(backoff.min(remaining)).await;
            }
        }

        Err(last_error)
    }
}
