use super::{BatchWriter, Producer};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use courier_core::{DeliveryResult, ProduceRequest, RecordMetadata};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Producer that writes every `send` straight to the transport.
///
/// Nothing is buffered, so `flush` has nothing to do and every failure,
/// whole-batch or per-message, is returned to the caller.
pub struct ImmediateProducer {
    writer: BatchWriter,
    closed: AtomicBool,
}

impl ImmediateProducer {
    pub(crate) fn new(writer: BatchWriter) -> Self {
        Self {
            writer,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Write `record` and return where it landed.
    pub async fn send_and_wait(&self, record: ProduceRequest) -> Result<RecordMetadata> {
        self.ensure_open()?;
        let mut results = self.writer.write(std::slice::from_ref(&record)).await?;
        match results.pop() {
            Some(outcome) => outcome.map_err(ClientError::from),
            None => Err(ClientError::InvalidState(
                "transport returned no result".into(),
            )),
        }
    }

    /// Write `records` in one transport call.
    ///
    /// # Returns
    ///
    /// One outcome per record, in order. A whole-batch failure (after the
    /// retry policy gave up) is returned as `Err`.
    pub async fn send_batch(&self, records: Vec<ProduceRequest>) -> Result<Vec<DeliveryResult>> {
        self.ensure_open()?;
        self.writer.write(&records).await
    }
}

#[async_trait]
impl Producer for ImmediateProducer {
    fn topic(&self) -> &str {
        self.writer.topic()
    }

    async fn send_record(&self, record: ProduceRequest) -> Result<()> {
        self.send_and_wait(record).await.map(|_| ())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(topic = %self.writer.topic(), "Closing immediate producer");
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{builder, values};
    use super::*;
    use courier_core::{MemoryBroker, TransportError};

    #[tokio::test]
    async fn test_send_is_written_before_returning() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();

        let meta = producer
            .send_and_wait(ProduceRequest::new("k", "first"))
            .await
            .unwrap();
        assert_eq!(meta.offset, 0);
        producer.send(bytes::Bytes::new(), "second".into()).await.unwrap();

        assert_eq!(values(&broker, "orders"), vec!["first", "second"]);
        assert_eq!(broker.batch_sizes("orders"), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_send_batch_reports_each_outcome() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();

        broker.reject_next_messages(1);
        let results = producer
            .send_batch(vec![
                ProduceRequest::new("", "a"),
                ProduceRequest::new("", "b"),
                ProduceRequest::new("", "c"),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(TransportError::MessageRejected(_))));
        assert!(results[1].is_ok() && results[2].is_ok());
        assert_eq!(broker.batch_sizes("orders"), vec![3]);
        assert_eq!(values(&broker, "orders"), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_rejected_message_surfaces_to_caller() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();

        broker.reject_next_messages(1);
        let err = producer
            .send_record(ProduceRequest::new("", "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::MessageRejected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failure_is_retried() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();

        broker.fail_next_writes(2);
        producer
            .send_record(ProduceRequest::new("", "x"))
            .await
            .unwrap();
        assert_eq!(broker.write_calls(), 3);
        assert_eq!(values(&broker, "orders"), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_transport_error() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();

        broker.fail_next_writes(5);
        let err = producer
            .send_record(ProduceRequest::new("", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Write(..))));
        assert_eq!(broker.write_calls(), 3);
    }

    #[tokio::test]
    async fn test_close_twice_closes_connection_once() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();
        producer
            .send_record(ProduceRequest::new("", "x"))
            .await
            .unwrap();

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(broker.connections_closed(), 1);
        assert!(matches!(
            producer.send_batch(vec![]).await,
            Err(ClientError::Closed)
        ));
    }
}
