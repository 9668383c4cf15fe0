//! Consumer API
//!
//! Two commit strategies behind one [`Consumer`] trait:
//!
//! - [`AutoCommitConsumer`]: the transport commits read positions on an
//!   interval. Cheap, but a message that failed may still be committed.
//! - [`ManualCommitConsumer`]: handled messages collect in a [`CommitSet`]
//!   that is committed every `commit_batch_size` messages, on `commit()` and
//!   on close. A failed message is never committed (at-least-once).
//!
//! ## Lifecycle
//!
//! ```text
//!  build()        start()          stop() / cancel / fatal error
//! Created ──► Connected ──► Running ──► Stopping ──► Closed
//!                 │                         ▲  final commit,
//!                 └──────── close() ────────┘  connection released
//! ```
//!
//! ## Read Loop
//!
//! ```text
//! loop {
//!     stop requested?             → exit
//!     read_message(read_timeout)  (raced against stop/cancel)
//!       ├─ message   → handler → acknowledge / reject
//!       ├─ timeout   → loop
//!       ├─ conn lost → reconnect through the pool (retry policy; fatal when exhausted)
//!       └─ other     → log, back off, loop
//! }
//! ```
//!
//! ## Examples
//!
//! ```ignore
//! let consumer = ConsumerBuilder::new()
//!     .transport(transport)
//!     .topic("orders")
//!     .group_id("billing")
//!     .commit_strategy(CommitStrategy::Manual)
//!     .with(middleware::recovery())
//!     .with(middleware::retry(3, Duration::from_millis(100)))
//!     .build()
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! consumer.start(handler_fn(|msg| async move { process(&msg).await }), cancel).await?;
//! ```

mod auto_commit;
mod manual_commit;
mod runner;

pub use auto_commit::AutoCommitConsumer;
pub use manual_commit::{CommitSet, ManualCommitConsumer};

use self::runner::{ConsumerCore, CoreParts};
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};
use crate::middleware::{Handler, Middleware, MiddlewareChain};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use courier_core::{BrokerTransport, CommitMode};
use courier_observability::{MetricsRecorder, NoopRecorder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Connected,
    Running,
    Stopping,
    Closed,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Created,
            1 => ConsumerState::Connected,
            2 => ConsumerState::Running,
            3 => ConsumerState::Stopping,
            _ => ConsumerState::Closed,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Connected => "connected",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Common interface of both commit strategies.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn topic(&self) -> &str;

    fn group_id(&self) -> &str;

    /// Name of this instance within its group.
    fn instance_id(&self) -> &str;

    /// Run the read loop with `handler` (wrapped in the registered
    /// middleware) until `cancel` fires, [`stop`](Self::stop) is called or a
    /// fatal error occurs. The consumer is `Closed` when this returns.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the consumer is not `Connected` or already running
    /// - the reconnect error once the retry policy is exhausted
    /// - the final commit error, unless [`close`](Self::close) finalized
    ///   the consumer and reported it instead
    async fn start(&self, handler: Handler, cancel: CancellationToken) -> Result<()>;

    /// Ask the loop to exit after the in-flight message and wait for it,
    /// then commit and release the connection as [`close`](Self::close)
    /// does. A stopped consumer is `Closed`; final commit errors are logged.
    async fn stop(&self);

    /// Stop if running, commit pending acknowledgments and release the
    /// connection. Closing twice returns `Ok(())`.
    async fn close(&self) -> Result<()>;

    fn state(&self) -> ConsumerState;
}

/// Which consumer [`ConsumerBuilder::build`] creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitStrategy {
    /// Transport commits positions every `auto_commit_interval`.
    Auto,
    /// Offsets of handled messages are committed in batches.
    #[default]
    Manual,
}

/// Builder for both consumer strategies. Building connects and subscribes.
#[derive(Clone)]
pub struct ConsumerBuilder {
    transport: Option<Arc<dyn BrokerTransport>>,
    brokers: Vec<String>,
    pool: Option<Arc<ConnectionPool>>,
    pool_config: PoolConfig,
    config: ConsumerConfig,
    strategy: CommitStrategy,
    middleware: MiddlewareChain,
    metrics: Arc<dyn MetricsRecorder>,
    instance_id: String,
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            brokers: vec!["localhost:9092".to_string()],
            pool: None,
            pool_config: PoolConfig::default(),
            config: ConsumerConfig::default(),
            strategy: CommitStrategy::default(),
            middleware: MiddlewareChain::new(),
            metrics: Arc::new(NoopRecorder),
            instance_id: "instance-0".to_string(),
        }
    }

    /// Start from a full configuration.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
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

    /// Borrow connections from a shared pool instead of a private one.
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

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.config.auto_commit_interval = interval;
        self
    }

    pub fn commit_batch_size(mut self, size: usize) -> Self {
        self.config.commit_batch_size = size;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a middleware; the first registered is the outermost.
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self
    }

    pub(crate) fn group_id_value(&self) -> &str {
        &self.config.group_id
    }

    fn parts(self, commit_mode: CommitMode) -> Result<CoreParts> {
        self.config.validate()?;
        let (pool, owns_pool) = match (self.pool, self.transport) {
            (Some(pool), _) => (pool, false),
            (None, Some(transport)) => {
                self.pool_config.validate()?;
                let pool = ConnectionPool::with_metrics(
                    transport,
                    self.brokers,
                    self.pool_config,
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
        Ok(CoreParts {
            config: self.config,
            instance_id: self.instance_id,
            commit_mode,
            pool,
            owns_pool,
            middleware: self.middleware,
            metrics: self.metrics,
        })
    }

    /// Build and connect the configured strategy.
    pub async fn build(self) -> Result<Arc<dyn Consumer>> {
        Ok(match self.strategy {
            CommitStrategy::Auto => Arc::new(self.build_auto().await?),
            CommitStrategy::Manual => Arc::new(self.build_manual().await?),
        })
    }

    pub async fn build_auto(self) -> Result<AutoCommitConsumer> {
        let interval = self.config.auto_commit_interval;
        let core = ConsumerCore::connect(self.parts(CommitMode::Auto { interval })?).await?;
        Ok(AutoCommitConsumer::new(core))
    }

    pub async fn build_manual(self) -> Result<ManualCommitConsumer> {
        let core = ConsumerCore::connect(self.parts(CommitMode::Manual)?).await?;
        Ok(ManualCommitConsumer::new(core))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{builder, eventually, publish};
    use super::*;
    use crate::middleware::{handler_fn, middleware_fn};
    use courier_core::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_build_connects_and_validates() {
        let broker = MemoryBroker::new();
        let consumer = builder(&broker).build().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Connected);
        assert_eq!(consumer.instance_id(), "instance-0");
        assert_eq!(broker.group_members("billing", "orders"), 1);

        let result = builder(&broker).group_id("").build().await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let result = builder(&broker).build().await;
        assert!(matches!(result, Err(ClientError::ConnectFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_middleware_wraps_handler() {
        let broker = MemoryBroker::new();
        publish(&broker, 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let tagging = middleware_fn(move |next: Handler| {
            let log = log.clone();
            handler_fn(move |msg| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("mw-{}", msg.offset));
                    next(msg).await
                }
            })
        });

        let consumer = builder(&broker)
            .commit_strategy(CommitStrategy::Auto)
            .with(tagging)
            .build()
            .await
            .unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                consumer
                    .start(
                        handler_fn(move |_msg| {
                            let counter = counter.clone();
                            async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        }),
                        cancel,
                    )
                    .await
            })
        };

        eventually(|| handled.load(Ordering::SeqCst) == 2).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["mw-0", "mw-1"]);
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let broker = MemoryBroker::new();
        let consumer = builder(&broker).build().await.unwrap();
        consumer.close().await.unwrap();

        let result = consumer
            .start(handler_fn(|_msg| async { Ok(()) }), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClientError::InvalidState(_))));
    }
}
