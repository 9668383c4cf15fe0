//! Dead Letter Middleware
//!
//! Forwards messages whose handler failed to a [`DeadLetterSink`]. The
//! original error is still returned, so the consumer does not acknowledge the
//! message. Register `dead_letter` before `retry` so only messages that
//! exhausted their retries are dead-lettered.
//!
//! ## Headers
//!
//! [`ProducerDeadLetterSink`] republishes the message with its original key,
//! value and headers plus:
//!
//! | header                 | value                          |
//! |------------------------|--------------------------------|
//! | `x-dlq-original-topic` | topic the message came from    |
//! | `x-dlq-partition`      | original partition             |
//! | `x-dlq-offset`         | original offset                |
//! | `x-dlq-error`          | handler error text             |
//! | `x-dlq-timestamp`      | dead-letter time, ms since epoch |

use super::{handler_fn, middleware_fn, Handler, Middleware};
use crate::error::{ClientError, Result};
use crate::producer::Producer;
use async_trait::async_trait;
use courier_core::{now_millis, Message, ProduceRequest};
use std::sync::Arc;
use tracing::{error, warn};

pub const DLQ_ORIGINAL_TOPIC: &str = "x-dlq-original-topic";
pub const DLQ_PARTITION: &str = "x-dlq-partition";
pub const DLQ_OFFSET: &str = "x-dlq-offset";
pub const DLQ_ERROR: &str = "x-dlq-error";
pub const DLQ_TIMESTAMP: &str = "x-dlq-timestamp";

/// Destination for messages that could not be handled.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_to_dlq(&self, message: &Message, error: &ClientError) -> Result<()>;
}

/// Send failed messages to `sink`, then return the handler's error unchanged.
///
/// A failing sink is logged and otherwise ignored.
pub fn dead_letter(sink: Arc<dyn DeadLetterSink>) -> Middleware {
    middleware_fn(move |next: Handler| {
        let sink = sink.clone();
        handler_fn(move |msg| {
            let next = next.clone();
            let sink = sink.clone();
            async move {
                let err = match next(msg.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };

                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %err,
                    "Sending message to dead letter sink"
                );
                if let Err(sink_err) = sink.send_to_dlq(&msg, &err).await {
                    error!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        error = %sink_err,
                        "Dead letter sink failed"
                    );
                }
                Err(err)
            }
        })
    })
}

/// Dead letter sink that republishes through a [`Producer`] bound to the
/// dead-letter topic.
///
/// # Examples
///
/// ```ignore
/// let dlq_producer = client.producer().topic("orders.dlq").build().await?;
/// let sink = Arc::new(ProducerDeadLetterSink::new(dlq_producer));
///
/// let handler = MiddlewareChain::new()
///     .with(middleware::dead_letter(sink))
///     .with(middleware::retry(3, Duration::from_millis(100)))
///     .then(my_handler);
/// ```
pub struct ProducerDeadLetterSink {
    producer: Arc<dyn Producer>,
}

impl ProducerDeadLetterSink {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }

    fn dead_letter_record(message: &Message, error: &ClientError) -> ProduceRequest {
        ProduceRequest::new(message.key.clone(), message.value.clone())
            .with_headers(message.headers.clone())
            .with_header(DLQ_ORIGINAL_TOPIC, message.topic.clone())
            .with_header(DLQ_PARTITION, message.partition.to_string())
            .with_header(DLQ_OFFSET, message.offset.to_string())
            .with_header(DLQ_ERROR, error.to_string())
            .with_header(DLQ_TIMESTAMP, now_millis().to_string())
    }
}

#[async_trait]
impl DeadLetterSink for ProducerDeadLetterSink {
    async fn send_to_dlq(&self, message: &Message, error: &ClientError) -> Result<()> {
        let record = Self::dead_letter_record(message, error);
        self.producer.send_record(record).await?;
        self.producer.flush().await
    }
}
