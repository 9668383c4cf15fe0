//! Client Facade
//!
//! [`CourierClient`] owns one connection pool and hands out producer and
//! consumer builders that already know the brokers, the default topic and
//! the default group.
//!
//! ```text
//!                    ┌──────────────── CourierClient ────────────────┐
//!   ClientConfig ──► │ transport ─► ConnectionPool (shared) ◄─ metrics│
//!                    └───────┬──────────────────────┬────────────────┘
//!                       producer()              consumer()
//!                            ▼                      ▼
//!                     ProducerBuilder         ConsumerBuilder
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let client = CourierClient::new(ClientConfig::from_env()?, transport)?;
//!
//! let producer = client.producer().strategy(ProducerStrategy::Async).build().await?;
//! producer.send(Bytes::from("user-1"), Bytes::from("clicked")).await?;
//!
//! let consumer = client
//!     .consumer()
//!     .with(middleware::recovery())
//!     .with(middleware::logger())
//!     .build()
//!     .await?;
//! ```

use crate::config::ClientConfig;
use crate::consumer::ConsumerBuilder;
use crate::error::Result;
use crate::group::ConsumerGroupManager;
use crate::pool::{ConnectionPool, PoolStats};
use crate::producer::ProducerBuilder;
use courier_core::BrokerTransport;
use courier_observability::{MetricsRecorder, NoopRecorder};
use std::sync::Arc;
use tracing::info;

/// Entry point for applications.
pub struct CourierClient {
    config: ClientConfig,
    transport: Arc<dyn BrokerTransport>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl CourierClient {
    /// # Errors
    ///
    /// `Config` if `config` does not validate.
    pub fn new(config: ClientConfig, transport: Arc<dyn BrokerTransport>) -> Result<Self> {
        Self::with_metrics(config, transport, Arc::new(NoopRecorder))
    }

    pub fn with_metrics(
        config: ClientConfig,
        transport: Arc<dyn BrokerTransport>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::with_metrics(
            transport.clone(),
            config.brokers.clone(),
            config.pool.clone(),
            metrics.clone(),
        ));
        info!(brokers = ?config.brokers, "Courier client created");

        Ok(Self {
            config,
            transport,
            pool,
            metrics,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.transport
    }

    /// The shared pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Producer builder using the shared pool and the default topic.
    pub fn producer(&self) -> ProducerBuilder {
        ProducerBuilder::new()
            .brokers(self.config.brokers.clone())
            .pool(self.pool.clone())
            .topic(self.config.topic.clone())
            .metrics(self.metrics.clone())
    }

    /// Consumer builder using the shared pool, the default topic and group.
    pub fn consumer(&self) -> ConsumerBuilder {
        ConsumerBuilder::new()
            .brokers(self.config.brokers.clone())
            .pool(self.pool.clone())
            .topic(self.config.topic.clone())
            .group_id(self.config.group_id.clone())
            .metrics(self.metrics.clone())
    }

    /// Group manager whose instances are built from [`consumer`](Self::consumer).
    pub fn consumer_group(&self) -> ConsumerGroupManager {
        ConsumerGroupManager::new(self.consumer())
    }

    /// Open connections up to the pool's idle target.
    pub async fn warm_up(&self) -> Result<usize> {
        self.pool.warm_up().await
    }

    /// Close the shared pool. Producers and consumers built from this client
    /// should be closed first.
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await?;
        info!("Courier client closed");
        Ok(())
    }
}
