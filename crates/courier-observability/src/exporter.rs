//! Prometheus Exporter
//!
//! [`PrometheusRecorder`] implements [`MetricsRecorder`] on top of Prometheus
//! counters and histograms. Each recorder owns its [`Registry`], so several
//! clients in one process (or several tests) never collide on metric names.
//!
//! ## Metrics
//!
//! | name                                | type      | labels             |
//! |-------------------------------------|-----------|--------------------|
//! | `<prefix>_producer_records_total`   | counter   | topic              |
//! | `<prefix>_producer_bytes_total`     | counter   | topic              |
//! | `<prefix>_producer_latency_seconds` | histogram | topic              |
//! | `<prefix>_producer_batch_size`      | histogram | topic              |
//! | `<prefix>_producer_errors_total`    | counter   | topic, error_type  |
//! | `<prefix>_consumer_records_total`   | counter   | topic, group       |
//! | `<prefix>_consumer_latency_seconds` | histogram | topic, group       |
//! | `<prefix>_consumer_errors_total`    | counter   | topic, group, error_type |
//! | `<prefix>_commits_total`            | counter   | group              |
//! | `<prefix>_connection_errors_total`  | counter   |                    |
//! | `<prefix>_pool_connections`         | gauge     | state (live, idle) |
//!
//! ## Usage
//!
//! ```ignore
//! let recorder = Arc::new(PrometheusRecorder::new("courier")?);
//! let producer = ProducerBuilder::new().transport(transport).metrics(recorder.clone()).build().await?;
//!
//! // Serve this from your HTTP stack of choice
//! let body = recorder.encode_text()?;
//! ```

use crate::error::Result;
use crate::metrics::MetricsRecorder;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Prometheus-backed metrics recorder.
pub struct PrometheusRecorder {
    registry: Registry,
    producer_records: IntCounterVec,
    producer_bytes: IntCounterVec,
    producer_latency: HistogramVec,
    producer_batch_size: HistogramVec,
    producer_errors: IntCounterVec,
    consumer_records: IntCounterVec,
    consumer_latency: HistogramVec,
    consumer_errors: IntCounterVec,
    commits: IntCounterVec,
    connection_errors: IntCounter,
    pool_connections: IntGaugeVec,
}

impl PrometheusRecorder {
    /// Create a recorder whose metric names start with `prefix`.
    ///
    /// # Errors
    ///
    /// Fails if `prefix` produces an invalid metric name.
    pub fn new(prefix: &str) -> Result<Self> {
        let name = |suffix: &str| format!("{prefix}_{suffix}");
        let registry = Registry::new();

        let producer_records = IntCounterVec::new(
            Opts::new(name("producer_records_total"), "Total records produced"),
            &["topic"],
        )?;
        let producer_bytes = IntCounterVec::new(
            Opts::new(name("producer_bytes_total"), "Total bytes produced"),
            &["topic"],
        )?;
        let producer_latency = HistogramVec::new(
            HistogramOpts::new(name("producer_latency_seconds"), "Producer latency in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["topic"],
        )?;
        let producer_batch_size = HistogramVec::new(
            HistogramOpts::new(name("producer_batch_size"), "Producer batch size in records")
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
            &["topic"],
        )?;
        let producer_errors = IntCounterVec::new(
            Opts::new(name("producer_errors_total"), "Total producer errors"),
            &["topic", "error_type"],
        )?;
        let consumer_records = IntCounterVec::new(
            Opts::new(name("consumer_records_total"), "Total records consumed"),
            &["topic", "group"],
        )?;
        let consumer_latency = HistogramVec::new(
            HistogramOpts::new(name("consumer_latency_seconds"), "Handler latency in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["topic", "group"],
        )?;
        let consumer_errors = IntCounterVec::new(
            Opts::new(name("consumer_errors_total"), "Total consumer errors"),
            &["topic", "group", "error_type"],
        )?;
        let commits = IntCounterVec::new(
            Opts::new(name("commits_total"), "Total offset commits"),
            &["group"],
        )?;
        let connection_errors = IntCounter::new(
            name("connection_errors_total"),
            "Total failed broker connection attempts",
        )?;
        let pool_connections = IntGaugeVec::new(
            Opts::new(name("pool_connections"), "Pooled broker connections"),
            &["state"],
        )?;

        registry.register(Box::new(producer_records.clone()))?;
        registry.register(Box::new(producer_bytes.clone()))?;
        registry.register(Box::new(producer_latency.clone()))?;
        registry.register(Box::new(producer_batch_size.clone()))?;
        registry.register(Box::new(producer_errors.clone()))?;
        registry.register(Box::new(consumer_records.clone()))?;
        registry.register(Box::new(consumer_latency.clone()))?;
        registry.register(Box::new(consumer_errors.clone()))?;
        registry.register(Box::new(commits.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;

        Ok(Self {
            registry,
            producer_records,
            producer_bytes,
            producer_latency,
            producer_batch_size,
            producer_errors,
            consumer_records,
            consumer_latency,
            consumer_errors,
            commits,
            connection_errors,
            pool_connections,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record_produced(&self, topic: &str, bytes: usize, latency: Duration) {
        self.producer_records.with_label_values(&[topic]).inc();
        self.producer_bytes
            .with_label_values(&[topic])
            .inc_by(bytes as u64);
        self.producer_latency
            .with_label_values(&[topic])
            .observe(latency.as_secs_f64());
    }

    fn record_produce_error(&self, topic: &str, error_type: &str) {
        self.producer_errors
            .with_label_values(&[topic, error_type])
            .inc();
    }

    fn record_batch(&self, topic: &str, size: usize) {
        self.producer_batch_size
            .with_label_values(&[topic])
            .observe(size as f64);
    }

    fn record_consumed(&self, topic: &str, group: &str, _bytes: usize, latency: Duration) {
        self.consumer_records.with_label_values(&[topic, group]).inc();
        self.consumer_latency
            .with_label_values(&[topic, group])
            .observe(latency.as_secs_f64());
    }

    fn record_consume_error(&self, topic: &str, group: &str, error_type: &str) {
        self.consumer_errors
            .with_label_values(&[topic, group, error_type])
            .inc();
    }

    fn record_commit(&self, group: &str, _messages: usize) {
        self.commits.with_label_values(&[group]).inc();
    }

    fn record_connection_error(&self) {
        self.connection_errors.inc();
    }

    fn record_pool_size(&self, live: usize, idle: usize) {
        self.pool_connections
            .with_label_values(&["live"])
            .set(live as i64);
        self.pool_connections
            .with_label_values(&["idle"])
            .set(idle as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        let recorder = PrometheusRecorder::new("courier").unwrap();
        recorder.record_produced("orders", 128, Duration::from_millis(3));
        recorder.record_batch("orders", 10);
        recorder.record_consume_error("orders", "billing", "handler");

        let text = recorder.encode_text().unwrap();
        assert!(text.contains("courier_producer_records_total{topic=\"orders\"} 1"));
        assert!(text.contains("courier_producer_bytes_total{topic=\"orders\"} 128"));
        assert!(text.contains("courier_consumer_errors_total"));
    }

    #[test]
    fn test_recorders_do_not_share_registries() {
        let a = PrometheusRecorder::new("courier").unwrap();
        let b = PrometheusRecorder::new("courier").unwrap();
        a.record_commit("g", 1);

        assert!(a.encode_text().unwrap().contains("courier_commits_total{group=\"g\"} 1"));
        assert!(!b.encode_text().unwrap().contains("group=\"g\""));
    }

    #[test]
    fn test_invalid_prefix_is_rejected() {
        assert!(PrometheusRecorder::new("not a metric name").is_err());
    }

    #[test]
    fn test_pool_gauge() {
        let recorder = PrometheusRecorder::new("courier").unwrap();
        recorder.record_pool_size(3, 1);
        let text = recorder.encode_text().unwrap();
        assert!(text.contains("courier_pool_connections{state=\"live\"} 3"));
        assert!(text.contains("courier_pool_connections{state=\"idle\"} 1"));
    }
}
