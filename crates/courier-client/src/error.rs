//! Error types for Courier client operations.
//!
//! Every producer, consumer, middleware and pool operation returns
//! [`Result<T>`], an alias over [`ClientError`].
//!
//! ## Error Handling Strategy
//!
//! - **Retryable**: `Transport`, `Timeout`, `ConnectFailure`
//! - **Caller must back off**: `Backpressure`, `RateLimited`, `CircuitOpen`, `PoolExhausted`
//! - **Message-scoped**: `Serialization`, `Handler`, `MaxRetriesExceeded`
//! - **Terminal**: `Closed`, `PoolClosed`, `Config`, `InvalidState`
//!
//! A consumer never acknowledges a message whose handler returned any of these.
//!
//! ## Examples
//!
//! ```ignore
//! use courier_client::{ClientError, Producer};
//!
//! match producer.send(Bytes::from("user-1"), Bytes::from("payload")).await {
//!     Ok(()) => {}
//!     Err(ClientError::Backpressure) => {
//!         // Channel is full, try again later
//!     }
//!     Err(ClientError::Closed) => eprintln!("producer already closed"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use courier_core::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type user handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience type alias for `Result<T, ClientError>`.
///
/// This is the standard Result type used throughout the client library.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type for Courier client operations.
///
/// ## Error Categories
///
/// - **Connection**: `ConnectFailure`, `PoolClosed`, `PoolExhausted`
/// - **Transport**: `Transport`
/// - **Flow control**: `Backpressure`, `RateLimited`, `CircuitOpen`
/// - **Processing**: `Serialization`, `Handler`, `MaxRetriesExceeded`, `Timeout`
/// - **Lifecycle**: `Closed`, `InvalidState`, `DeadlineExceeded`
/// - **Configuration**: `Config`
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not open a connection to any broker.
    ///
    /// ## Causes
    /// - Broker addresses are wrong or unreachable
    /// - The transport refused the connection
    ///
    /// ## Resolution
    /// - The connection is discarded; the next operation reconnects through the pool
    /// - Check `brokers` in the client configuration
    #[error("Failed to connect to brokers: {0}")]
    ConnectFailure(TransportError),

    /// A transport call (write, read or commit) failed.
    ///
    /// Scoped to one batch or one read. Producers retry whole-batch failures
    /// with their retry policy; the consumer read loop retries reads.
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The async producer's queue is full.
    ///
    /// ## Resolution
    /// - Retry later, or slow down
    /// - Use the batch or immediate producer when every send must be accepted
    #[error("Producer queue is full")]
    Backpressure,

    /// A value could not be serialized or a payload could not be deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A message handler failed.
    #[error("Handler error: {0}")]
    Handler(BoxError),

    /// The retry middleware gave up. `source` is the last underlying error.
    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: usize,
        #[source]
        source: Box<ClientError>,
    },

    /// A handler did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker is open and rejected the call without running it.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The rate limiter had no token for this call.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The connection pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Every pooled connection is in use and none freed up in time.
    ///
    /// ## Resolution
    /// - Increase `max_conns` or `acquire_timeout`
    /// - Make sure connections are returned (drop the guard)
    #[error("Connection pool exhausted ({0} connections in use)")]
    PoolExhausted(usize),

    /// The producer or consumer has been closed.
    #[error("Client is closed")]
    Closed,

    /// Shutdown work (final flush or commit) did not finish before the deadline.
    #[error("Shutdown deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The operation is not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    ///
    /// ## Causes
    /// - Missing topic, group id or broker list
    /// - Zero batch size, queue capacity or pool size
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Wrap any error returned by user code.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        ClientError::Handler(error.into())
    }

    /// Handler error from a plain message.
    pub fn handler_msg(message: impl Into<String>) -> Self {
        ClientError::Handler(message.into().into())
    }

    /// Errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(e) => !matches!(e, TransportError::MessageRejected(_)),
            ClientError::ConnectFailure(_) => true,
            ClientError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Errors that mean the connection they came from must be discarded.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::ConnectFailure(_) => true,
            ClientError::Transport(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::ConnectFailure(_) => "connect",
            ClientError::Transport(_) => "transport",
            ClientError::Backpressure => "backpressure",
            ClientError::Serialization(_) => "serialization",
            ClientError::Handler(_) => "handler",
            ClientError::MaxRetriesExceeded { .. } => "max_retries",
            ClientError::Timeout(_) => "timeout",
            ClientError::CircuitOpen => "circuit_open",
            ClientError::RateLimited => "rate_limited",
            ClientError::PoolClosed => "pool_closed",
            ClientError::PoolExhausted(_) => "pool_exhausted",
            ClientError::Closed => "closed",
            ClientError::DeadlineExceeded(_) => "deadline",
            ClientError::InvalidState(_) => "invalid_state",
            ClientError::Config(_) => "config",
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Connect(..) => ClientError::ConnectFailure(error),
            other => ClientError::Transport(other),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_connect_maps_to_connect_failure() {
        let err: ClientError = TransportError::Connect("a".into(), "refused".into()).into();
        assert!(matches!(err, ClientError::ConnectFailure(_)));
        assert!(err.is_connection_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rejected_message_not_retryable() {
        let err: ClientError = TransportError::MessageRejected("too big".into()).into();
        assert!(!err.is_retryable());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_max_retries_keeps_source() {
        let err = ClientError::MaxRetriesExceeded {
            attempts: 3,
            source: Box::new(ClientError::handler_msg("boom")),
        };
        assert_eq!(
            err.to_string(),
            "Max retries exceeded after 3 attempts: Handler error: boom"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Handler error: boom");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ClientError::Backpressure.kind(), "backpressure");
        assert_eq!(ClientError::handler_msg("x").kind(), "handler");
        assert_eq!(ClientError::Closed.kind(), "closed");
    }
}
