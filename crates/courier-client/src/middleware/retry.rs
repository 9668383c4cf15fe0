use super::{handler_fn, middleware_fn, Handler, Middleware};
use crate::error::ClientError;
use std::time::Duration;
use tracing::warn;

/// Call the wrapped handler up to `max_retries + 1` times.
///
/// Only errors are retried. The wait before retry `n` (1-based) is
/// `base_delay * n`, a linear backoff. When every attempt failed the result is
/// `MaxRetriesExceeded` carrying the last error.
///
/// # Examples
///
/// ```ignore
/// // 3 attempts: fail, wait 100ms, fail, wait 200ms, fail -> MaxRetriesExceeded
/// let mw = retry(2, Duration::from_millis(100));
/// ```
pub fn retry(max_retries: usize, base_delay: Duration) -> Middleware {
    middleware_fn(move |next: Handler| {
        handler_fn(move |msg| {
            let next = next.clone();
            async move {
                let mut attempt = 0usize;
                loop {
                    let error = match next(msg.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e) => e,
                    };

                    attempt += 1;
                    if attempt > max_retries {
                        return Err(ClientError::MaxRetriesExceeded {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }

                    let delay = delay_before(base_delay, attempt);
                    warn!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        })
    })
}

/// `base_delay * attempt`, saturating at `Duration::MAX`.
fn delay_before(base_delay: Duration, attempt: usize) -> Duration {
    base_delay.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))
}
