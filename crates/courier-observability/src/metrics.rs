//! Client Metrics
//!
//! Producers, consumers and the connection pool report what they do through the
//! [`MetricsRecorder`] trait. A recorder is injected into every component (the
//! default is [`NoopRecorder`]); there is no process-wide registry.
//!
//! Two recorders ship with the crate:
//!
//! - [`ClientMetrics`]: lock-free atomic counters with a [`MetricsSnapshot`]
//! - [`PrometheusRecorder`](crate::prometheus::PrometheusRecorder): counters and
//!   histograms in a Prometheus registry owned by the recorder
//!
//! Recording must never fail or block: recorders are called on hot paths.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Event sink for pipeline metrics. Every method defaults to a no-op.
pub trait MetricsRecorder: Send + Sync {
    /// A message was delivered to the broker.
    fn record_produced(&self, _topic: &str, _bytes: usize, _latency: Duration) {}

    /// A message could not be delivered.
    fn record_produce_error(&self, _topic: &str, _error_type: &str) {}

    /// A batch of `size` messages was handed to the transport.
    fn record_batch(&self, _topic: &str, _size: usize) {}

    /// A message was handled successfully.
    fn record_consumed(&self, _topic: &str, _group: &str, _bytes: usize, _latency: Duration) {}

    /// A read or handler failure.
    fn record_consume_error(&self, _topic: &str, _group: &str, _error_type: &str) {}

    /// An offset commit covering `messages` messages succeeded.
    fn record_commit(&self, _group: &str, _messages: usize) {}

    /// Establishing a broker connection failed.
    fn record_connection_error(&self) {}

    /// Current number of live pooled connections.
    fn record_pool_size(&self, _live: usize, _idle: usize) {}
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_produced: u64,
    pub bytes_produced: u64,
    pub produce_errors: u64,
    pub produce_latency_ns: u64,
    pub batches: u64,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
    pub consume_errors: u64,
    pub consume_latency_ns: u64,
    pub commits: u64,
    pub committed_messages: u64,
    pub connection_errors: u64,
    pub live_connections: i64,
}

impl MetricsSnapshot {
    /// Mean produce latency, if anything was produced.
    pub fn avg_produce_latency(&self) -> Option<Duration> {
        (self.messages_produced > 0)
            .then(|| Duration::from_nanos(self.produce_latency_ns / self.messages_produced))
    }

    /// Mean handler latency, if anything was consumed.
    pub fn avg_consume_latency(&self) -> Option<Duration> {
        (self.messages_consumed > 0)
            .then(|| Duration::from_nanos(self.consume_latency_ns / self.messages_consumed))
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Messages: [P:{}/C:{}], Bytes: [P:{}/C:{}], Errors: [P:{}/C:{}], Commits: {}",
            self.messages_produced,
            self.messages_consumed,
            self.bytes_produced,
            self.bytes_consumed,
            self.produce_errors,
            self.consume_errors,
            self.commits,
        )
    }
}

/// Atomic counters for one client (or a group of clients sharing an `Arc`).
///
/// # Examples
///
/// ```ignore
/// let metrics = Arc::new(ClientMetrics::new());
/// let producer = ProducerBuilder::new().transport(transport)
///     .metrics(metrics.clone())
///     .build()
///     .await?;
///
/// println!("{}", metrics.snapshot());
/// ```
#[derive(Debug, Default)]
pub struct ClientMetrics {
    messages_produced: AtomicU64,
    bytes_produced: AtomicU64,
    produce_errors: AtomicU64,
    produce_latency_ns: AtomicU64,
    batches: AtomicU64,
    messages_consumed: AtomicU64,
    bytes_consumed: AtomicU64,
    consume_errors: AtomicU64,
    consume_latency_ns: AtomicU64,
    commits: AtomicU64,
    committed_messages: AtomicU64,
    connection_errors: AtomicU64,
    live_connections: AtomicI64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_produced: self.messages_produced.load(Ordering::Relaxed),
            bytes_produced: self.bytes_produced.load(Ordering::Relaxed),
            produce_errors: self.produce_errors.load(Ordering::Relaxed),
            produce_latency_ns: self.produce_latency_ns.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
            consume_latency_ns: self.consume_latency_ns.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            committed_messages: self.committed_messages.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            live_connections: self.live_connections.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.messages_produced,
            &self.bytes_produced,
            &self.produce_errors,
            &self.produce_latency_ns,
            &self.batches,
            &self.messages_consumed,
            &self.bytes_consumed,
            &self.consume_errors,
            &self.consume_latency_ns,
            &self.commits,
            &self.committed_messages,
            &self.connection_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.live_connections.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

impl MetricsRecorder for ClientMetrics {
    fn record_produced(&self, _topic: &str, bytes: usize, latency: Duration) {
        self.messages_produced.fetch_add(1, Ordering::Relaxed);
        self.bytes_produced.fetch_add(bytes as u64, Ordering::Relaxed);
        self.produce_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_produce_error(&self, _topic: &str, _error_type: &str) {
        self.produce_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_batch(&self, _topic: &str, _size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_consumed(&self, _topic: &str, _group: &str, bytes: usize, latency: Duration) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(bytes as u64, Ordering::Relaxed);
        self.consume_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_consume_error(&self, _topic: &str, _group: &str, _error_type: &str) {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit(&self, _group: &str, messages: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.committed_messages
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_pool_size(&self, live: usize, _idle: usize) {
        self.live_connections.store(live as i64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ClientMetrics::new();
        metrics.record_produced("t", 10, Duration::from_millis(2));
        metrics.record_produced("t", 30, Duration::from_millis(4));
        metrics.record_produce_error("t", "transport");
        metrics.record_consumed("t", "g", 5, Duration::from_millis(1));
        metrics.record_commit("g", 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_produced, 2);
        assert_eq!(snap.bytes_produced, 40);
        assert_eq!(snap.produce_errors, 1);
        assert_eq!(snap.avg_produce_latency(), Some(Duration::from_millis(3)));
        assert_eq!(snap.messages_consumed, 1);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.committed_messages, 3);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = ClientMetrics::new();
        metrics.record_batch("t", 10);
        metrics.record_connection_error();
        metrics.record_pool_size(4, 2);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_display_format() {
        let metrics = ClientMetrics::new();
        metrics.record_produced("t", 1, Duration::ZERO);
        metrics.record_consume_error("t", "g", "handler");
        assert_eq!(
            metrics.to_string(),
            "Messages: [P:1/C:0], Bytes: [P:1/C:0], Errors: [P:0/C:1], Commits: 0"
        );
    }

    #[test]
    fn test_avg_latency_none_when_empty() {
        let snap = MetricsSnapshot::default();
        assert!(snap.avg_produce_latency().is_none());
        assert!(snap.avg_consume_latency().is_none());
    }

    #[test]
    fn test_noop_recorder_accepts_everything() {
        let recorder: &dyn MetricsRecorder = &NoopRecorder;
        recorder.record_produced("t", 1, Duration::ZERO);
        recorder.record_commit("g", 1);
    }
}
