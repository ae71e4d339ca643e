//! Retry with exponential backoff for remote calls.
//!
//! Every call to the vector index or the embedding service goes through
//! [`with_retry`]:
//! - [`RemoteError::Transient`] (network, timeout, 5xx) → retry after
//!   `base_delay * 2^(attempt-1)`, capped at `max_delay`
//! - [`RemoteError::RateLimited`] → retry after the server's `Retry-After`
//!   hint when present, otherwise the backoff delay
//! - anything else → returned immediately
//!
//! After `max_retries` retries the last error is returned to the caller,
//! which turns it into a failed batch or page.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use vector_sync_core::error::RemoteError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay before retry `attempt` after `err`.
    pub fn delay_for(&self, attempt: u32, err: &RemoteError) -> Duration {
        err.retry_after().unwrap_or_else(|| self.backoff(attempt))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// `what` names the operation in log lines (e.g. `"fetch page 3"`).
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt, &err);
                warn!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
