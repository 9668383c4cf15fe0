//! Message Data Structures
//!
//! This module defines the values that flow through the pipeline in both
//! directions:
//!
//! - **Message**: a record delivered by the broker to a consumer. Immutable once
//!   read; handlers share it as `Arc<Message>`.
//! - **ProduceRequest**: a record the application wants to publish. Owned by a
//!   producer buffer until it is flushed or terminally fails.
//! - **RecordMetadata**: where the broker stored a produced record.
//!
//! ## Headers
//!
//! Headers are an ordered list of `(key, value)` pairs. Duplicate keys are legal
//! and their order is preserved end to end, which is why they are a `Vec` and
//! not a map.
//!
//! ## Example
//! ```ignore
//! let request = ProduceRequest::new("user-42", r#"{"action":"click"}"#)
//!     .with_header("content-type", "application/json");
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A single message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic this message was read from
    pub topic: String,

    /// Partitioning key (may be empty)
    pub key: Bytes,

    /// Payload
    pub value: Bytes,

    /// Ordered headers
    pub headers: Vec<Header>,

    /// Partition within the topic
    pub partition: i32,

    /// Position within the partition log
    pub offset: i64,

    /// Broker timestamp in milliseconds since epoch
    pub timestamp: u64,
}

impl Message {
    /// Return the value of the first header named `key`.
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.key == key).map(|h| &h.value)
    }

    /// Header value decoded as UTF-8, if present and valid.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Estimate the size of this message in bytes
    pub fn estimated_size(&self) -> usize {
        self.key.len()
            + self.value.len()
            + self
                .headers
                .iter()
                .map(|h| h.key.len() + h.value.len())
                .sum::<usize>()
    }
}

/// A record waiting to be produced.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Partitioning key (empty keys are legal)
    pub key: Bytes,

    /// Payload
    pub value: Bytes,

    /// Ordered headers
    pub headers: Vec<Header>,

    /// When the request entered the producer
    pub enqueued_at: Instant,

    /// Number of failed delivery attempts so far
    pub attempts: u32,
}

impl ProduceRequest {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }

    /// Append a header, keeping insertion order.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    /// Set (or overwrite) a header in place.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|h| h.key == key) {
            Some(existing) => existing.value = value,
            None => self.headers.push(Header { key, value }),
        }
    }

    /// Estimate the size of this request in bytes
    pub fn estimated_size(&self) -> usize {
        self.key.len()
            + self.value.len()
            + self
                .headers
                .iter()
                .map(|h| h.key.len() + h.value.len())
                .sum::<usize>()
    }
}

/// Location of a successfully produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
