//! Bounded retry for storage collaborators
//!
//! Each attempt runs under its own timeout so a hung store cannot block a
//! caller indefinitely. Only transient [`StorageError`]s are retried; the
//! backoff doubles after every failed attempt.

use crate::core::error::{Error, Result, StorageError};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub attempts: u32,
    /// Delay before the second attempt
    pub backoff: Duration,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
            timeout: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(10))
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StorageError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => StorageError::Timeout(policy.timeout),
        };

        if attempt >= attempts || !err.is_transient() {
            tracing::error!("{operation} failed after {attempt} attempt(s): {err}");
            return Err(Error::Storage {
                operation: operation.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!("{operation} attempt {attempt}/{attempts} failed: {err}; retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}
