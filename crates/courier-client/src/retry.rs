//! Backoff policy for transport operations.
//!
//! A [`RetryPolicy`] drives two loops: the batch and async producers retry a
//! whole-batch write that failed, and consumers retry reconnecting after a
//! lost connection (with jitter). Handler failures are a different concern,
//! covered by the linear [`retry`](crate::middleware::retry) middleware.
//!
//! Whether an error is worth another attempt is decided by
//! [`ClientError::is_retryable`](crate::ClientError::is_retryable); anything
//! else is returned at once.
//!
//! ```text
//!   write / connect ──err──► retryable? ──no──► return error
//!                                 │ yes
//!                     attempts left? ──no──► return last error
//!                                 │ yes
//!                     sleep(backoff(n)) ──► try again
//! ```
//!
//! ```ignore
//! let policy = RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(2), 2.0);
//! let results = retry_with_backoff(&policy, || writer.write(&chunk)).await?;
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How many times to retry and how long to wait in between.
///
/// The wait before retry `n` (0-based) is
/// `initial_backoff * backoff_multiplier^n`, capped at `max_backoff`.
/// Serializable so it can sit in a JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// 5 retries, 100ms doubling up to 30s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Backoff with ±25% random jitter, never above `max_backoff`.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter_factor = 0.75 + rand::random::<f64>() * 0.5;
        let jittered = Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64);
        jittered.min(self.max_backoff)
    }
}

/// Run `operation` until it succeeds, fails with an error that is not
/// retryable, or `policy.max_retries` retries have been spent.
///
/// # Errors
///
/// The first non-retryable error, or the last error once retries run out.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    run(policy, operation, false).await
}

/// Same as [`retry_with_backoff`] with ±25% jitter on every wait, so many
/// clients reconnecting after a broker restart do not retry in lockstep.
pub async fn retry_with_jittered_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    run(policy, operation, true).await
}

async fn run<F, Fut, T>(policy: &RetryPolicy, mut operation: F, jitter: bool) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Succeeded after retrying");
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(error = %error, kind = error.kind(), "Error is not retryable");
                    return Err(error);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %error,
                        "Retries exhausted"
                    );
                    return Err(error);
                }

                let backoff = if jitter {
                    policy.jittered_backoff(attempt)
                } else {
                    policy.backoff(attempt)
                };
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Transient failure, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
