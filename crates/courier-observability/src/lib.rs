//! Courier Observability
//!
//! Passive observers for the Courier pipeline.
//!
//! # Features
//!
//! - [`MetricsRecorder`] trait with atomic ([`ClientMetrics`]) and Prometheus
//!   ([`PrometheusRecorder`]) implementations
//! - Message tracing with header propagation ([`Tracer`], [`Span`])
//!
//! # Usage
//!
//! ```ignore
//! use courier_observability::{ClientMetrics, Tracer, LogExporter};
//!
//! let metrics = Arc::new(ClientMetrics::new());
//! let tracer = Tracer::with_exporter("orders-service", Arc::new(LogExporter));
//! ```

pub mod error;
pub mod exporter;
pub mod metrics;
pub mod tracer;

pub use error::{ObservabilityError, Result};
pub use exporter::PrometheusRecorder;
pub use metrics::{ClientMetrics, MetricsRecorder, MetricsSnapshot, NoopRecorder};
pub use tracer::{
    CollectingExporter, LogExporter, NoopExporter, Span, SpanContext, SpanEvent, SpanExporter,
    SpanStatus, Tracer, SPAN_ID_HEADER, TRACE_ID_HEADER,
};
