//! Producer API
//!
//! Three strategies behind one [`Producer`] trait:
//!
//! | strategy                   | `send` returns after            | failures reported to      |
//! |----------------------------|---------------------------------|---------------------------|
//! | [`ImmediateProducer`]      | the transport acknowledged it   | the caller                |
//! | [`BatchProducer`]          | it was appended to the buffer   | failure callback / requeue |
//! | [`AsyncProducer`]          | it was queued (never blocks)    | delivery callback         |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  send(...)   │ Producer API
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  strategy                    │ buffer / channel / direct
//! └──────┬───────────────────────┘
//!        │  batches of ≤ batch_size, in submission order
//!        ▼
//! ┌──────────────────────────────┐
//! │  BatchWriter                 │ pooled connection + RetryPolicy
//! │  write_batch(topic, batch)   │ per-message DeliveryResult
//! └──────────────────────────────┘
//! ```
//!
//! ## Examples
//!
//! ```ignore
//! use courier_client::{ProducerBuilder, ProducerStrategy};
//!
//! let producer = ProducerBuilder::new()
//!     .transport(Arc::new(MemoryBroker::new()))
//!     .topic("orders")
//!     .strategy(ProducerStrategy::Batch)
//!     .batch_size(500)
//!     .linger(Duration::from_millis(50))
//!     .build()
//!     .await?;
//!
//! producer.send(Bytes::from("user-1"), Bytes::from("payload")).await?;
//! producer.close().await?;
//! ```

mod async_buffered;
mod batch;
mod immediate;

pub use async_buffered::AsyncProducer;
pub use batch::BatchProducer;
pub use immediate::ImmediateProducer;

use crate::config::ProducerConfig;
use crate::error::{ClientError, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{BrokerTransport, DeliveryResult, ProduceRequest, RecordMetadata, TransportError};
use courier_observability::{MetricsRecorder, NoopRecorder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Common interface of every producer strategy.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Topic every record is written to.
    fn topic(&self) -> &str;

    /// Produce one record.
    ///
    /// # Errors
    ///
    /// - `Closed` after [`close`](Self::close)
    /// - `Backpressure` when an async producer's queue is full
    /// - transport errors for immediate producers
    async fn send_record(&self, record: ProduceRequest) -> Result<()>;

    /// Produce `value` under `key`. An empty key is legal.
    async fn send(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.send_record(ProduceRequest::new(key, value)).await
    }

    /// Push everything buffered to the transport and wait for the round trip.
    async fn flush(&self) -> Result<()>;

    /// Stop accepting records, flush what is buffered (bounded by the shutdown
    /// timeout) and release connections. Closing twice returns `Ok(())`.
    async fn close(&self) -> Result<()>;
}

/// Called with a request that could not be delivered and the reason.
pub type FailureCallback = Arc<dyn Fn(ProduceRequest, &ClientError) + Send + Sync>;

/// Called once per request written by an [`AsyncProducer`].
pub type DeliveryCallback =
    Arc<dyn Fn(&ProduceRequest, std::result::Result<RecordMetadata, &ClientError>) + Send + Sync>;

/// Which producer [`ProducerBuilder::build`] creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerStrategy {
    /// One transport write per `send`.
    Immediate,
    /// Mutex-guarded buffer flushed by size, linger or `flush`.
    #[default]
    Batch,
    /// Bounded channel drained by a background task.
    Async,
}

/// Writes batches to one topic through a connection pool.
///
/// Whole-batch failures are retried with the producer's [`RetryPolicy`].
/// A connection that failed is discarded so the next attempt reconnects.
pub(crate) struct BatchWriter {
    topic: String,
    pool: Arc<ConnectionPool>,
    owns_pool: bool,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsRecorder>,
}

impl BatchWriter {
    pub(crate) fn new(
        topic: String,
        pool: Arc<ConnectionPool>,
        owns_pool: bool,
        retry: RetryPolicy,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            topic,
            pool,
            owns_pool,
            retry,
            metrics,
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Write `batch` and return one result per request, in order.
    pub(crate) async fn write(&self, batch: &[ProduceRequest]) -> Result<Vec<DeliveryResult>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let result = retry_with_backoff(&self.retry, || self.write_once(batch)).await;
        match &result {
            Ok(results) => {
                self.metrics.record_batch(&self.topic, batch.len());
                for (request, outcome) in batch.iter().zip(results) {
                    match outcome {
                        Ok(_) => self.metrics.record_produced(
                            &self.topic,
                            request.estimated_size(),
                            request.enqueued_at.elapsed(),
                        ),
                        Err(e) => {
                            let error = ClientError::from(e.clone());
                            self.metrics.record_produce_error(&self.topic, error.kind());
                        }
                    }
                }
                debug!(topic = %self.topic, batch_size = batch.len(), "Batch written");
            }
            Err(e) => {
                for _ in batch {
                    self.metrics.record_produce_error(&self.topic, e.kind());
                }
                warn!(
                    topic = %self.topic,
                    batch_size = batch.len(),
                    error = %e,
                    "Batch write failed"
                );
            }
        }
        result
    }

    async fn write_once(&self, batch: &[ProduceRequest]) -> Result<Vec<DeliveryResult>> {
        let conn = self.pool.get().await?;
        match conn.write_batch(&self.topic, batch).await {
            Ok(results) => {
                if let Err(e) = self.pool.put(conn).await {
                    debug!(error = %e, "Connection not returned to pool");
                }
                if results.len() != batch.len() {
                    return Err(ClientError::Transport(TransportError::Write(
                        self.topic.clone(),
                        format!("expected {} results, got {}", batch.len(), results.len()),
                    )));
                }
                Ok(results)
            }
            Err(e) => {
                let error = ClientError::from(e);
                if error.is_connection_error() {
                    self.metrics.record_connection_error();
                    self.pool.discard(conn).await;
                }
                Err(error)
            }
        }
    }

    /// Close the pool if this producer created it.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.owns_pool {
            self.pool.close().await?;
        }
        Ok(())
    }
}

/// Builder for all producer strategies.
///
/// # Defaults
///
/// See [`ProducerConfig`]; the strategy defaults to [`ProducerStrategy::Batch`].
/// Either a `transport` (the producer then owns a private pool) or a shared
/// `pool` is required.
pub struct ProducerBuilder {
    transport: Option<Arc<dyn BrokerTransport>>,
    brokers: Vec<String>,
    pool: Option<Arc<ConnectionPool>>,
    pool_config: PoolConfig,
    config: ProducerConfig,
    strategy: ProducerStrategy,
    metrics: Arc<dyn MetricsRecorder>,
    on_failure: Option<FailureCallback>,
    on_delivery: Option<DeliveryCallback>,
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            brokers: vec!["localhost:9092".to_string()],
            pool: None,
            pool_config: PoolConfig::default(),
            config: ProducerConfig::default(),
            strategy: ProducerStrategy::default(),
            metrics: Arc::new(NoopRecorder),
            on_failure: None,
            on_delivery: None,
        }
    }

    /// Start from a full configuration.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = brokers;
        self
    }

    /// Share an existing pool instead of creating one. A shared pool is not
    /// closed when the producer closes.
    pub fn pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn strategy(mut self, strategy: ProducerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Maximum records per transport write.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Flush period for buffered strategies.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Async strategy queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn max_in_flight(mut self, batches: usize) -> Self {
        self.config.max_in_flight = batches;
        self
    }

    /// Requeue per-message failures until `max_attempts` is reached.
    pub fn requeue_failed(mut self, max_attempts: u32) -> Self {
        self.config.requeue_failed = true;
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Batch strategy: called for each request that finally failed.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProduceRequest, &ClientError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Async strategy: called for each request once its batch was written.
    pub fn on_delivery<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProduceRequest, std::result::Result<RecordMetadata, &ClientError>)
            + Send
            + Sync
            + 'static,
    {
        self.on_delivery = Some(Arc::new(callback));
        self
    }

    fn writer(&self) -> Result<BatchWriter> {
        self.config.validate()?;
        let (pool, owns_pool) = match (&self.pool, &self.transport) {
            (Some(pool), _) => (pool.clone(), false),
            (None, Some(transport)) => {
                self.pool_config.validate()?;
                let pool = ConnectionPool::with_metrics(
                    transport.clone(),
                    self.brokers.clone(),
                    self.pool_config.clone(),
                    self.metrics.clone(),
                );
                (Arc::new(pool), true)
            }
            (None, None) => {
                return Err(ClientError::Config(
                    "a transport or a connection pool is required".into(),
                ))
            }
        };
        Ok(BatchWriter::new(
            self.config.topic.clone(),
            pool,
            owns_pool,
            self.config.retry.clone(),
            self.metrics.clone(),
        ))
    }

    /// Build the configured strategy.
    pub async fn build(self) -> Result<Arc<dyn Producer>> {
        Ok(match self.strategy {
            ProducerStrategy::Immediate => Arc::new(self.build_immediate().await?),
            ProducerStrategy::Batch => Arc::new(self.build_batch().await?),
            ProducerStrategy::Async => Arc::new(self.build_async().await?),
        })
    }

    pub async fn build_immediate(self) -> Result<ImmediateProducer> {
        let writer = self.writer()?;
        info!(topic = %self.config.topic, "Immediate producer ready");
        Ok(ImmediateProducer::new(writer))
    }

    pub async fn build_batch(self) -> Result<BatchProducer> {
        let writer = self.writer()?;
        info!(
            topic = %self.config.topic,
            batch_size = self.config.batch_size,
            linger_ms = self.config.linger.as_millis() as u64,
            "Batch producer ready"
        );
        Ok(BatchProducer::new(writer, self.config, self.on_failure))
    }

    pub async fn build_async(self) -> Result<AsyncProducer> {
        let writer = self.writer()?;
        info!(
            topic = %self.config.topic,
            queue_capacity = self.config.queue_capacity,
            max_in_flight = self.config.max_in_flight,
            "Async producer ready"
        );
        Ok(AsyncProducer::new(writer, self.config, self.on_delivery))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use courier_core::MemoryBroker;

    /// Builder wired to `broker`, with retries kept short.
    pub fn builder(broker: &MemoryBroker) -> ProducerBuilder {
        ProducerBuilder::new()
            .transport(Arc::new(broker.clone()))
            .brokers(vec!["memory:0".to_string()])
            .topic("orders")
            .retry_policy(RetryPolicy::new(
                2,
                Duration::from_millis(10),
                Duration::from_millis(50),
                2.0,
            ))
    }

    pub fn values(broker: &MemoryBroker, topic: &str) -> Vec<String> {
        broker
            .received(topic)
            .into_iter()
            .map(|v| String::from_utf8(v.to_vec()).unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::builder;
    use super::*;
    use courier_core::MemoryBroker;

    #[tokio::test]
    async fn test_build_requires_transport_or_pool() {
        let result = ProducerBuilder::new().topic("orders").build().await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let broker = MemoryBroker::new();
        let result = builder(&broker).batch_size(0).build().await;
        assert!(matches!(result, Err(ClientError::Config(_))));

        let result = builder(&broker).topic("").build().await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_every_strategy_sends_through_the_trait() {
        for strategy in [
            ProducerStrategy::Immediate,
            ProducerStrategy::Batch,
            ProducerStrategy::Async,
        ] {
            let broker = MemoryBroker::new();
            let producer = builder(&broker).strategy(strategy).build().await.unwrap();
            assert_eq!(producer.topic(), "orders");

            producer
                .send(Bytes::from("k"), Bytes::from("v"))
                .await
                .unwrap();
            producer.flush().await.unwrap();
            assert_eq!(broker.received("orders").len(), 1, "{strategy:?}");

            producer.close().await.unwrap();
            assert!(matches!(
                producer.send(Bytes::new(), Bytes::from("late")).await,
                Err(ClientError::Closed)
            ));
        }
    }

    #[tokio::test]
    async fn test_shared_pool_is_not_closed_by_producer() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(broker.clone()),
            vec!["memory:0".to_string()],
            PoolConfig::default(),
        ));
        let producer = ProducerBuilder::new()
            .pool(pool.clone())
            .topic("orders")
            .strategy(ProducerStrategy::Immediate)
            .build()
            .await
            .unwrap();

        producer.send(Bytes::new(), Bytes::from("a")).await.unwrap();
        producer.close().await.unwrap();

        assert!(!pool.is_closed());
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_connection_error_discards_and_reconnects() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker)
            .strategy(ProducerStrategy::Immediate)
            .build()
            .await
            .unwrap();

        producer.send(Bytes::new(), Bytes::from("a")).await.unwrap();
        broker.disconnect_all();
        producer.send(Bytes::new(), Bytes::from("b")).await.unwrap();

        assert_eq!(broker.received("orders").len(), 2);
        assert_eq!(broker.connections_opened(), 2);
    }
}
