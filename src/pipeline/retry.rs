//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Throttling and timeouts from storage or OCR services are frequent under
//! concurrent load and usually clear on their own. Authorization and
//! validation errors never do, so they are surfaced on the first attempt.
//! With a 500 ms base and 3 retries the wait sequence is 500 ms → 1 s → 2 s.

use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
        }
    }

    /// Delay before `attempt` (1-based retry number).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        )
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// `what` names the call in log lines. The last error is returned as-is.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms ({})",
                    what,
                    attempt,
                    policy.max_retries,
                    delay.as_millis(),
                    e
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
