use super::{handler_fn, middleware_fn, Handler, Middleware};
use std::time::Instant;
use tracing::{debug, warn};

/// Log every message before and after the wrapped handler, with its duration
/// and outcome. Never changes the result.
pub fn logger() -> Middleware {
    middleware_fn(|next: Handler| {
        handler_fn(move |msg| {
            let next = next.clone();
            async move {
                let topic = msg.topic.clone();
                let (partition, offset) = (msg.partition, msg.offset);
                let start = Instant::now();

                debug!(topic = %topic, partition, offset, "Handling message");
                let result = next(msg).await;
                let elapsed_ms = start.elapsed().as_millis() as u64;

                match &result {
                    Ok(()) => debug!(
                        topic = %topic,
                        partition,
                        offset,
                        elapsed_ms,
                        "Message handled"
                    ),
                    Err(e) => warn!(
                        topic = %topic,
                        partition,
                        offset,
                        elapsed_ms,
                        error = %e,
                        "Message handler failed"
                    ),
                }
                result
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::middleware::test_support::message;
    use crate::middleware::compose;

    #[tokio::test]
    async fn test_logger_does_not_alter_results() {
        let ok = compose(handler_fn(|_msg| async { Ok(()) }), &[logger()]);
        assert!(ok(message(0)).await.is_ok());

        let failing = compose(
            handler_fn(|_msg| async { Err(ClientError::handler_msg("nope")) }),
            &[logger()],
        );
        let err = failing(message(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Handler error: nope");
    }
}
