//! Message Handler Middleware
//!
//! A consumer hands every message to a [`Handler`]. Middleware wrap a handler
//! in another handler, adding one policy each: panic recovery, logging,
//! retries, timeouts, circuit breaking, rate limiting, dead-lettering, tracing.
//!
//! ## Composition Order
//!
//! The first registered middleware is the outermost wrapper. It sees the
//! message first and the result last:
//!
//! ```text
//! compose(H, [A, B])
//!
//!   A.before ──► B.before ──► H ──► B.after ──► A.after
//! ```
//!
//! ## Examples
//!
//! ```ignore
//! use courier_client::middleware::{self, MiddlewareChain, CircuitBreaker};
//!
//! let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
//!
//! let handler = MiddlewareChain::new()
//!     .with(middleware::recovery())
//!     .with(middleware::logger())
//!     .with(breaker.middleware())
//!     .with(middleware::retry(3, Duration::from_millis(100)))
//!     .then(handler_fn(|msg| async move {
//!         process(&msg).await
//!     }));
//! ```

mod circuit_breaker;
mod dead_letter;
mod logger;
mod rate_limiter;
mod recovery;
mod retry;
mod timeout;
mod tracing_span;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use dead_letter::{
    dead_letter, DeadLetterSink, ProducerDeadLetterSink, DLQ_ERROR, DLQ_OFFSET, DLQ_ORIGINAL_TOPIC,
    DLQ_PARTITION, DLQ_TIMESTAMP,
};
pub use logger::logger;
pub use rate_limiter::RateLimiter;
pub use recovery::recovery;
pub use retry::retry;
pub use timeout::timeout;
pub use tracing_span::tracing_span;

use crate::error::Result;
use courier_core::Message;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// A message handler. Cheap to clone and safe to call concurrently.
pub type Handler = Arc<dyn Fn(Arc<Message>) -> HandlerFuture + Send + Sync>;

/// Wraps a handler into a new handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Build a [`Handler`] from an async closure.
///
/// # Examples
///
/// ```ignore
/// let handler = handler_fn(|msg: Arc<Message>| async move {
///     println!("{:?}", msg.value);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |msg: Arc<Message>| -> HandlerFuture { Box::pin(f(msg)) })
}

/// Build a [`Middleware`] from a closure.
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `handler` with `middlewares`; the first one ends up outermost.
pub fn compose(handler: Handler, middlewares: &[Middleware]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

/// Ordered list of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware (it runs inside every middleware added before it).
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Terminate the chain with `handler`.
    pub fn then(&self, handler: Handler) -> Handler {
        compose(handler, &self.middlewares)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::message;
    use super::*;
    use std::sync::Mutex;

    fn recording(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        middleware_fn(move |next: Handler| {
            let log = log.clone();
            handler_fn(move |msg| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("{name}-before"));
                    let result = next(msg).await;
                    log.lock().unwrap().push(format!("{name}-after"));
                    result
                }
            })
        })
    }

    #[tokio::test]
    async fn test_first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = log.clone();
        let handler = handler_fn(move |_msg| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        });

        let composed = compose(
            handler,
            &[recording("A", log.clone()), recording("B", log.clone())],
        );
        composed(message(0)).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-before", "B-before", "handler", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_chain_builder_matches_compose() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = log.clone();
        let chain = MiddlewareChain::new()
            .with(recording("A", log.clone()))
            .with(recording("B", log.clone()))
            .with(recording("C", log.clone()));
        assert_eq!(chain.len(), 3);

        let handler = chain.then(handler_fn(move |_msg| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        }));
        handler(message(0)).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "A-before", "B-before", "C-before", "handler", "C-after", "B-after", "A-after"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_the_handler() {
        let handler = MiddlewareChain::new().then(handler_fn(|msg| async move {
            assert_eq!(msg.offset, 9);
            Ok(())
        }));
        handler(message(9)).await.unwrap();
    }
}
