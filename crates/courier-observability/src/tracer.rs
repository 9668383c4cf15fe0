//! Message Tracing
//!
//! A small span model for following a message from producer to consumer.
//! Trace context travels in two message headers:
//!
//! ```text
//! producer                          broker                      consumer
//! ┌──────────────┐   trace-id   ┌──────────┐   trace-id   ┌───────────────┐
//! │ inject(ctx)  │ ───────────> │ message  │ ───────────> │ extract(msg)  │
//! │              │   span-id    │ headers  │   span-id    │ start_span()  │
//! └──────────────┘              └──────────┘              └───────────────┘
//! ```
//!
//! Finished spans go to a [`SpanExporter`]. Exporting is fire-and-forget and
//! never affects message handling.

use crate::error::Result;
use courier_core::{now_millis, Message, ProduceRequest};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "trace-id";

/// Header carrying the id of the span that produced the message.
pub const SPAN_ID_HEADER: &str = "span-id";

/// Identifies a span for propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// A timestamped event recorded on a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanEvent {
    pub timestamp_ms: u64,
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub service: String,
    pub operation: String,
    pub start_ms: u64,
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEvent>,
    #[serde(skip)]
    started: Instant,
}

impl Span {
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: Some(self.span_id.clone()),
        }
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    pub fn add_event<K, V>(&mut self, name: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: ToString,
    {
        self.events.push(SpanEvent {
            timestamp_ms: now_millis(),
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        });
    }

    /// Mark the span failed and keep the error text as a tag.
    pub fn set_error(&mut self, error: &dyn std::fmt::Display) {
        self.status = SpanStatus::Error;
        self.set_tag("error", error);
    }

    pub fn set_ok(&mut self) {
        self.status = SpanStatus::Ok;
    }

    /// Record the duration. Later calls keep the first duration.
    pub fn finish(&mut self) {
        if self.duration_ms.is_none() {
            self.duration_ms = Some(self.started.elapsed().as_millis() as u64);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.duration_ms.is_some()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Destination for finished spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: &Span);
}

/// Drops every span.
#[derive(Debug, Default)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: &Span) {}
}

/// Logs every span as one `tracing` event at INFO.
#[derive(Debug, Default)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, span: &Span) {
        info!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent_id = span.parent_id.as_deref().unwrap_or(""),
            service = %span.service,
            operation = %span.operation,
            duration_ms = span.duration_ms.unwrap_or(0),
            status = ?span.status,
            tags = ?span.tags,
            "span finished"
        );
    }
}

/// Keeps spans in memory; useful for tests and debugging.
#[derive(Debug, Default)]
pub struct CollectingExporter {
    spans: Mutex<Vec<Span>>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }
}

impl SpanExporter for CollectingExporter {
    fn export(&self, span: &Span) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span.clone());
        }
    }
}

/// Creates spans for one service and propagates their context through headers.
///
/// # Examples
///
/// ```ignore
/// let tracer = Tracer::with_exporter("billing", Arc::new(LogExporter));
///
/// // Producer side
/// let span = tracer.start_span("produce", None);
/// let mut request = ProduceRequest::new("user-1", payload);
/// tracer.inject(&span.context(), &mut request);
/// tracer.finish(span);
///
/// // Consumer side
/// let parent = tracer.extract(&message);
/// let span = tracer.start_span("consume", parent.as_ref());
/// ```
#[derive(Clone)]
pub struct Tracer {
    service: String,
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    /// Tracer that discards finished spans.
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_exporter(service, Arc::new(NoopExporter))
    }

    pub fn with_exporter(service: impl Into<String>, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            service: service.into(),
            exporter,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Start a span. With a parent it joins the parent's trace; without one
    /// it starts a new trace.
    pub fn start_span(&self, operation: impl Into<String>, parent: Option<&SpanContext>) -> Span {
        let (trace_id, parent_id) = match parent {
            Some(ctx) => (ctx.trace_id.clone(), ctx.span_id.clone()),
            None => (Uuid::new_v4().simple().to_string(), None),
        };

        Span {
            trace_id,
            span_id: new_span_id(),
            parent_id,
            service: self.service.clone(),
            operation: operation.into(),
            start_ms: now_millis(),
            duration_ms: None,
            status: SpanStatus::Unset,
            tags: BTreeMap::new(),
            events: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Finish `span` and hand it to the exporter.
    pub fn finish(&self, mut span: Span) {
        span.finish();
        self.exporter.export(&span);
    }

    /// Read trace context from message headers.
    pub fn extract(&self, message: &Message) -> Option<SpanContext> {
        let trace_id = message.header_str(TRACE_ID_HEADER)?;
        if trace_id.is_empty() {
            return None;
        }
        Some(SpanContext {
            trace_id: trace_id.to_string(),
            span_id: message
                .header_str(SPAN_ID_HEADER)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        })
    }

    /// Write trace context into request headers, replacing earlier values.
    pub fn inject(&self, ctx: &SpanContext, request: &mut ProduceRequest) {
        request.set_header(TRACE_ID_HEADER, ctx.trace_id.clone());
        if let Some(span_id) = &ctx.span_id {
            request.set_header(SPAN_ID_HEADER, span_id.clone());
        }
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_core::Header;

    fn message_with(headers: Vec<Header>) -> Message {
        Message {
            topic: "t".to_string(),
            key: Bytes::new(),
            value: Bytes::from("v"),
            headers,
            partition: 0,
            offset: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn test_inject_then_extract() {
        let tracer = Tracer::new("svc");
        let span = tracer.start_span("produce", None);

        let mut request = ProduceRequest::new("k", "v");
        tracer.inject(&span.context(), &mut request);

        let msg = message_with(request.headers.clone());
        let ctx = tracer.extract(&msg).unwrap();
        assert_eq!(ctx.trace_id, span.trace_id);
        assert_eq!(ctx.span_id.as_deref(), Some(span.span_id.as_str()));
    }

    #[test]
    fn test_child_span_joins_trace() {
        let tracer = Tracer::new("svc");
        let parent = tracer.start_span("produce", None);
        let child = tracer.start_span("consume", Some(&parent.context()));

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_id.as_deref(), Some(parent.span_id.as_str()));
        assert_ne!(child.span_id, parent.span_id);
        assert_eq!(child.span_id.len(), 16);
    }

    #[test]
    fn test_extract_without_headers() {
        let tracer = Tracer::new("svc");
        assert!(tracer.extract(&message_with(vec![])).is_none());
        assert!(tracer
            .extract(&message_with(vec![Header::new(TRACE_ID_HEADER, "")]))
            .is_none());
    }

    #[test]
    fn test_finish_exports_once_with_duration() {
        let exporter = Arc::new(CollectingExporter::new());
        let tracer = Tracer::with_exporter("svc", exporter.clone());

        let mut span = tracer.start_span("consume", None);
        span.set_tag("partition", 3);
        span.add_event("retry", [("attempt", 1)]);
        span.set_error(&"boom");
        tracer.finish(span);

        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_finished());
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].tags["partition"], "3");
        assert_eq!(spans[0].events[0].fields["attempt"], "1");
    }

    #[test]
    fn test_span_json() {
        let tracer = Tracer::new("svc");
        let mut span = tracer.start_span("produce", None);
        span.finish();
        let json: serde_json::Value = serde_json::from_str(&span.to_json().unwrap()).unwrap();
        assert_eq!(json["service"], "svc");
        assert_eq!(json["status"], "unset");
        assert!(json.get("parent_id").is_none());
    }
}
