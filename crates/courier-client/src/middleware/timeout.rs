use super::{handler_fn, middleware_fn, Handler, Middleware};
use crate::error::ClientError;
use std::time::Duration;
use tracing::warn;

/// Fail with `Timeout(limit)` when the wrapped handler takes longer than `limit`.
///
/// The handler runs on its own task. A timed-out handler is **not** cancelled:
/// it keeps running in the background and may still finish (and cause side
/// effects) later, but its result is discarded. Handlers that must stop should
/// watch their own cancellation signal.
///
/// A panic inside the handler is re-raised on the caller's task so that an
/// outer [`recovery`](super::recovery) middleware can catch it.
pub fn timeout(limit: Duration) -> Middleware {
    middleware_fn(move |next: Handler| {
        handler_fn(move |msg| {
            let next = next.clone();
            async move {
                let (partition, offset) = (msg.partition, msg.offset);
                let task = tokio::spawn(next(msg));

                match tokio::time::timeout(limit, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) if join_error.is_panic() => {
                        std::panic::resume_unwind(join_error.into_panic())
                    }
                    Ok(Err(join_error)) => Err(ClientError::handler(join_error)),
                    Err(_) => {
                        warn!(
                            partition,
                            offset,
                            timeout_ms = limit.as_millis() as u64,
                            "Handler timed out"
                        );
                        Err(ClientError::Timeout(limit))
                    }
                }
            }
        })
    })
}
