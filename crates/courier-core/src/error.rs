//! Transport Error Types
//!
//! Errors raised by a [`BrokerTransport`](crate::BrokerTransport) or one of its
//! connections. Client code wraps these in its own error type; the variants
//! here only describe what went wrong on the wire.
//!
//! ## Categories
//!
//! - **Connection**: `Connect`, `Closed`
//! - **Produce**: `Write` (whole batch), `MessageRejected` (single message)
//! - **Consume**: `Read`, `ReadTimeout`
//! - **Offsets**: `Commit`
//!
//! `ReadTimeout` is not a failure: it means no message arrived within the
//! requested wait and the caller should simply read again.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("Write to topic '{0}' failed: {1}")]
    Write(String, String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("No message within read timeout")]
    ReadTimeout,

    #[error("Commit for group '{0}' failed: {1}")]
    Commit(String, String),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Errors that invalidate the connection they came from.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Connect(..) | TransportError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
