//! Broker Transport Interface
//!
//! The pipeline never speaks a wire protocol itself. Everything it needs from a
//! broker is expressed by two traits:
//!
//! - [`BrokerTransport`]: a factory that opens connections to a set of broker
//!   addresses.
//! - [`BrokerConnection`]: one open connection. Producers use `write_batch`,
//!   consumers use `subscribe`, `read_message` and `commit`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │   Producer   │   │   Consumer   │
//! └──────┬───────┘   └──────┬───────┘
//!        │                  │
//!        └────────┬─────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ ConnectionPool  │  (courier-client)
//!        └────────┬────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ BrokerTransport │  connect(addresses)
//!        └────────┬────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ BrokerConnection│  write_batch / read_message / commit
//!        └─────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! Connections take `&self` and must be `Send + Sync`: a consumer reads on one
//! task while commits may be issued from another.
//!
//! ## Cancellation
//!
//! `read_message` must be cancel safe. If its future is dropped before it
//! resolves, no message may be consumed from the partition position. The
//! consumer read loop relies on this when it races a read against shutdown.

use crate::error::{Result, TransportError};
use crate::message::{Message, ProduceRequest, RecordMetadata};
use async_trait::async_trait;
use std::time::Duration;

/// How a subscription's offsets are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// The transport commits read positions on its own every `interval`.
    Auto { interval: Duration },

    /// Offsets are committed only through [`BrokerConnection::commit`].
    Manual,
}

/// A consumer subscription to one topic within a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub group_id: String,
    pub commit_mode: CommitMode,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>, commit_mode: CommitMode) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            commit_mode,
        }
    }
}

/// Outcome of one message within a written batch.
pub type DeliveryResult = std::result::Result<RecordMetadata, TransportError>;

/// Factory for broker connections.
///
/// # Examples
///
/// ```ignore
/// let transport: Arc<dyn BrokerTransport> = Arc::new(MemoryBroker::new());
/// let conn = transport.connect(&["localhost:9092".to_string()]).await?;
/// ```
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a new connection to one of `addresses`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if no broker could be reached.
    async fn connect(&self, addresses: &[String]) -> Result<Box<dyn BrokerConnection>>;
}

/// One open connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Identifier of this connection, unique per transport. Used in logs.
    fn id(&self) -> u64;

    /// Join `subscription.group_id` and start receiving messages of
    /// `subscription.topic`. A connection holds at most one subscription.
    async fn subscribe(&self, subscription: Subscription) -> Result<()>;

    /// Write `batch` to `topic` in order.
    ///
    /// # Returns
    ///
    /// - `Err(_)` if the whole batch failed (nothing was written)
    /// - `Ok(results)` with exactly one entry per request, in batch order; an
    ///   entry is `Err` when that single message was rejected
    async fn write_batch(&self, topic: &str, batch: &[ProduceRequest]) -> Result<Vec<DeliveryResult>>;

    /// Wait up to `timeout` for the next message of the subscription.
    ///
    /// Returns `TransportError::ReadTimeout` when nothing arrives in time.
    /// Must be cancel safe.
    async fn read_message(&self, timeout: Duration) -> Result<Message>;

    /// Commit the positions after each of `messages` for `group_id`.
    async fn commit(&self, group_id: &str, messages: &[Message]) -> Result<()>;

    /// Cheap liveness check used by the connection pool on checkout.
    fn is_alive(&self) -> bool;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}
