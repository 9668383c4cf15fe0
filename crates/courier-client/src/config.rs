//! Client Configuration
//!
//! Plain serde structs with documented defaults. Builders start from these
//! defaults; applications can also load them from JSON or the environment.
//!
//! ## Environment
//!
//! | variable           | field      | format            |
//! |--------------------|------------|-------------------|
//! | `COURIER_BROKERS`  | `brokers`  | comma separated   |
//! | `COURIER_TOPIC`    | `topic`    | string            |
//! | `COURIER_GROUP_ID` | `group_id` | string            |
//!
//! ## Examples
//!
//! ```ignore
//! let config = ClientConfig::from_env()?;
//! config.validate()?;
//!
//! let config: ClientConfig = ClientConfig::from_file("courier.json")?;
//! ```

use crate::error::{ClientError, Result};
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_BROKERS: &str = "COURIER_BROKERS";
pub const ENV_TOPIC: &str = "COURIER_TOPIC";
pub const ENV_GROUP_ID: &str = "COURIER_GROUP_ID";

/// Connection settings shared by every producer and consumer of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker addresses handed to the transport (default: `["localhost:9092"]`)
    pub brokers: Vec<String>,

    /// Default topic for producers and consumers
    pub topic: String,

    /// Default consumer group
    pub group_id: String,

    /// Connection pool limits
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: String::new(),
            group_id: String::new(),
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(brokers) = lookup(ENV_BROKERS) {
            config.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
            if config.brokers.is_empty() {
                return Err(ClientError::Config(format!("{ENV_BROKERS} is empty")));
            }
        }
        if let Some(topic) = lookup(ENV_TOPIC) {
            config.topic = topic;
        }
        if let Some(group_id) = lookup(ENV_GROUP_ID) {
            config.group_id = group_id;
        }
        Ok(config)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(ClientError::Config("at least one broker is required".into()));
        }
        self.pool.validate()
    }
}

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Destination topic
    pub topic: String,

    /// Maximum requests per transport write (default: 100)
    pub batch_size: usize,

    /// Longest a buffered request waits for a flush (default: 100ms)
    pub linger: Duration,

    /// Async producer queue capacity; a full queue rejects with `Backpressure`
    /// (default: 10_000)
    pub queue_capacity: usize,

    /// Async producer batches written concurrently (default: 5)
    pub max_in_flight: usize,

    /// Put per-message failures back at the front of the buffer (default: false)
    pub requeue_failed: bool,

    /// Delivery attempts before a requeued request is reported failed (default: 3)
    pub max_attempts: u32,

    /// Bound on the final flush in `close` (default: 30s)
    pub shutdown_timeout: Duration,

    /// Retry policy for whole-batch transport failures
    pub retry: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            batch_size: 100,
            linger: Duration::from_millis(100),
            queue_capacity: 10_000,
            max_in_flight: 5,
            requeue_failed: false,
            max_attempts: 3,
            shutdown_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(ClientError::Config("producer topic is required".into()));
        }
        if self.batch_size == 0 {
            return Err(ClientError::Config("batch_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ClientError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ClientError::Config("max_in_flight must be at least 1".into()));
        }
        if self.linger.is_zero() {
            return Err(ClientError::Config("linger must be non-zero".into()));
        }
        if self.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Subscribed topic
    pub topic: String,

    /// Consumer group
    pub group_id: String,

    /// Wait per read before checking for shutdown again (default: 1s)
    pub read_timeout: Duration,

    /// Transport commit interval in auto-commit mode (default: 5s)
    pub auto_commit_interval: Duration,

    /// Handled messages per synchronous commit in manual mode (default: 100)
    pub commit_batch_size: usize,

    /// Pause after a failed read (default: 100ms)
    pub error_backoff: Duration,

    /// Bound on the final commit in `close` (default: 30s)
    pub shutdown_timeout: Duration,

    /// Retry policy for reconnecting after a lost connection
    pub reconnect: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            group_id: String::new(),
            read_timeout: Duration::from_secs(1),
            auto_commit_interval: Duration::from_secs(5),
            commit_batch_size: 100,
            error_backoff: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(ClientError::Config("consumer topic is required".into()));
        }
        if self.group_id.is_empty() {
            return Err(ClientError::Config("consumer group_id is required".into()));
        }
        if self.commit_batch_size == 0 {
            return Err(ClientError::Config(
                "commit_batch_size must be at least 1".into(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(ClientError::Config("read_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
