//! Courier Core
//!
//! Shared building blocks for the Courier client:
//!
//! - [`Message`], [`ProduceRequest`], [`RecordMetadata`]: the values that move
//!   between application code and the broker
//! - [`BrokerTransport`] / [`BrokerConnection`]: the boundary to a broker
//! - [`MemoryBroker`]: an in-process broker implementing that boundary

pub mod error;
pub mod memory;
pub mod message;
pub mod transport;

pub use error::{Result, TransportError};
pub use memory::{CommitRecord, MemoryBroker};
pub use message::{now_millis, Header, Message, ProduceRequest, RecordMetadata};
pub use transport::{BrokerConnection, BrokerTransport, CommitMode, DeliveryResult, Subscription};
