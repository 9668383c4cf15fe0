use super::{handler_fn, middleware_fn, Handler, Middleware};
use crate::error::ClientError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Turn a panic inside the wrapped handler into `ClientError::Handler`.
///
/// Catches panics raised while creating the handler future as well as while
/// polling it, so one bad message cannot take down the consumer loop.
pub fn recovery() -> Middleware {
    middleware_fn(|next: Handler| {
        handler_fn(move |msg| {
            let next = next.clone();
            async move {
                let topic = msg.topic.clone();
                let (partition, offset) = (msg.partition, msg.offset);

                let caught = match std::panic::catch_unwind(AssertUnwindSafe(|| next(msg))) {
                    Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                    Err(panic) => Err(panic),
                };

                caught.unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    error!(
                        topic = %topic,
                        partition,
                        offset,
                        panic = %reason,
                        "Handler panicked, recovered"
                    );
                    Err(ClientError::handler_msg(format!("panic recovered: {reason}")))
                })
            }
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
