//! Courier Client - Producer and Consumer pipeline
//!
//! This crate provides producers, consumers and the pieces around them:
//! batching, offset commits, a middleware chain for message handlers,
//! connection pooling and consumer groups. The broker itself sits behind
//! [`courier_core::BrokerTransport`].
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use courier_client::{CourierClient, ClientConfig, ProducerStrategy};
//!
//! let client = CourierClient::new(ClientConfig::from_env()?, transport)?;
//! let producer = client
//!     .producer()
//!     .strategy(ProducerStrategy::Batch)
//!     .batch_size(500)
//!     .build()
//!     .await?;
//!
//! producer.send(Bytes::from("user-1"), Bytes::from("clicked")).await?;
//! producer.close().await?;
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! use courier_client::{handler_fn, middleware, CommitStrategy};
//!
//! let consumer = client
//!     .consumer()
//!     .commit_strategy(CommitStrategy::Manual)
//!     .with(middleware::recovery())
//!     .with(middleware::logger())
//!     .build()
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! consumer
//!     .start(handler_fn(|msg| async move { process(&msg).await }), cancel)
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod middleware;
pub mod pool;
pub mod producer;
pub mod retry;
pub mod serializer;

pub use client::CourierClient;
pub use config::{ClientConfig, ConsumerConfig, ProducerConfig};
pub use consumer::{
    AutoCommitConsumer, CommitSet, CommitStrategy, Consumer, ConsumerBuilder, ConsumerState,
    ManualCommitConsumer,
};
pub use error::{BoxError, ClientError, Result};
pub use group::ConsumerGroupManager;
pub use middleware::{
    compose, handler_fn, middleware_fn, Handler, HandlerFuture, Middleware, MiddlewareChain,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use producer::{
    AsyncProducer, BatchProducer, DeliveryCallback, FailureCallback, ImmediateProducer, Producer,
    ProducerBuilder, ProducerStrategy,
};
pub use retry::{retry_with_backoff, retry_with_jittered_backoff, RetryPolicy};
pub use serializer::{
    typed_handler, BytesSerializer, Envelope, JsonSerializer, Serializer, StringSerializer,
    TypedProducer,
};

pub use courier_core::{Header, MemoryBroker, Message, ProduceRequest, RecordMetadata};
