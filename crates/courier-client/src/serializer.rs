//! Payload Serialization
//!
//! Typed values on both ends of the pipeline:
//!
//! ```text
//!   T ──Serializer::serialize──► Bytes ──► ProduceRequest ──► broker
//!   broker ──► Message ──Serializer::deserialize──► T ──► typed handler
//! ```
//!
//! A payload that fails to deserialize fails its message with
//! `ClientError::Serialization`, so it is never acknowledged.
//!
//! ## Example
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Order { id: u64, amount: f64 }
//!
//! let orders = TypedProducer::new(producer, JsonSerializer);
//! orders.send("order-1", &Order { id: 1, amount: 9.5 }).await?;
//!
//! let handler = typed_handler(JsonSerializer, |order: Envelope<Order>| async move {
//!     println!("order {} for {}", order.data.id, order.data.amount);
//!     Ok(())
//! });
//! ```

use crate::error::{ClientError, Result};
use crate::middleware::{handler_fn, Handler};
use crate::producer::Producer;
use bytes::Bytes;
use courier_core::{Header, Message, ProduceRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts `T` to and from message payloads.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes>;

    fn deserialize(&self, data: &[u8]) -> Result<T>;

    /// MIME type written to the `content-type` header by [`Envelope::encode`].
    fn content_type(&self) -> &'static str;
}

/// JSON through `serde_json`, for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// UTF-8 text. Invalid UTF-8 is a serialization error.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| ClientError::Serialization(format!("invalid UTF-8 payload: {e}")))
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }
}

/// Raw bytes, unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn deserialize(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// A typed message with its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// Topic the message was read from (empty when producing)
    pub topic: String,
    pub key: Bytes,
    pub data: T,
    pub headers: Vec<Header>,
    /// Broker timestamp in milliseconds since epoch (0 when producing)
    pub timestamp: u64,
}

impl<T> Envelope<T> {
    pub fn new(key: impl Into<Bytes>, data: T) -> Self {
        Self {
            topic: String::new(),
            key: key.into(),
            data,
            headers: Vec::new(),
            timestamp: 0,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Serialize into a request, adding a `content-type` header unless one
    /// is already set.
    ///
    /// # Errors
    ///
    /// `Serialization` if `data` cannot be serialized.
    pub fn encode<S>(&self, serializer: &S) -> Result<ProduceRequest>
    where
        S: Serializer<T> + ?Sized,
    {
        let value = serializer.serialize(&self.data)?;
        let mut request = ProduceRequest::new(self.key.clone(), value).with_headers(self.headers.clone());
        if !self.headers.iter().any(|h| h.key == CONTENT_TYPE_HEADER) {
            request = request.with_header(CONTENT_TYPE_HEADER, serializer.content_type());
        }
        Ok(request)
    }

    /// Deserialize a message payload.
    ///
    /// # Errors
    ///
    /// `Serialization` if the payload does not decode as `T`.
    pub fn decode<S>(message: &Message, serializer: &S) -> Result<Self>
    where
        S: Serializer<T> + ?Sized,
    {
        Ok(Self {
            topic: message.topic.clone(),
            key: message.key.clone(),
            data: serializer.deserialize(&message.value)?,
            headers: message.headers.clone(),
            timestamp: message.timestamp,
        })
    }

    /// Key as UTF-8, if valid.
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }
}

/// A producer of `T` values.
pub struct TypedProducer<T, S> {
    inner: Arc<dyn Producer>,
    serializer: S,
    _marker: PhantomData<fn(&T)>,
}

impl<T, S> TypedProducer<T, S>
where
    S: Serializer<T>,
{
    pub fn new(inner: Arc<dyn Producer>, serializer: S) -> Self {
        Self {
            inner,
            serializer,
            _marker: PhantomData,
        }
    }

    /// Serialize `value` and send it.
    ///
    /// # Errors
    ///
    /// `Serialization` before anything is sent, otherwise whatever the
    /// underlying producer returns.
    pub async fn send(&self, key: impl Into<Bytes>, value: &T) -> Result<()> {
        self.send_envelope(&Envelope::new(key, value)).await
    }

    pub async fn send_envelope<V>(&self, envelope: &Envelope<V>) -> Result<()>
    where
        V: std::borrow::Borrow<T>,
    {
        let value = self.serializer.serialize(envelope.data.borrow())?;
        let mut request =
            ProduceRequest::new(envelope.key.clone(), value).with_headers(envelope.headers.clone());
        if !envelope.headers.iter().any(|h| h.key == CONTENT_TYPE_HEADER) {
            request = request.with_header(CONTENT_TYPE_HEADER, self.serializer.content_type());
        }
        self.inner.send_record(request).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn topic(&self) -> &str {
        self.inner.topic()
    }

    /// The untyped producer underneath.
    pub fn inner(&self) -> &Arc<dyn Producer> {
        &self.inner
    }
}

/// Build a handler that decodes every message into an [`Envelope<T>`]
/// before calling `f`.
pub fn typed_handler<T, S, F, Fut>(serializer: S, f: F) -> Handler
where
    T: Send + 'static,
    S: Serializer<T> + 'static,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let serializer = Arc::new(serializer);
    let f = Arc::new(f);
    handler_fn(move |message: Arc<Message>| {
        let decoded = Envelope::decode(&message, serializer.as_ref());
        let f = f.clone();
        async move { f(decoded?).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::test_support::builder;
    use courier_core::MemoryBroker;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        item: String,
    }

    fn message(value: impl Into<Bytes>) -> Arc<Message> {
        Arc::new(Message {
            topic: "orders".into(),
            key: Bytes::from("k1"),
            value: value.into(),
            headers: vec![Header::new("source", "web")],
            partition: 0,
            offset: 7,
            timestamp: 1_700_000_000_000,
        })
    }

    #[test]
    fn test_json_envelope_round_trip() {
        let envelope = Envelope::new(
            "k1",
            Order {
                id: 7,
                item: "book".into(),
            },
        )
        .with_header("source", "web");
        let request = envelope.encode(&JsonSerializer).unwrap();
        assert_eq!(request.headers[1].key, CONTENT_TYPE_HEADER);
        assert_eq!(request.headers[1].value, Bytes::from("application/json"));

        let decoded: Envelope<Order> = Envelope::decode(&message(request.value), &JsonSerializer).unwrap();
        assert_eq!(decoded.data, envelope.data);
        assert_eq!(decoded.key_str(), Some("k1"));
        assert_eq!(decoded.topic, "orders");
        assert_eq!(decoded.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_string_serializer_rejects_invalid_utf8() {
        let err = Serializer::<String>::deserialize(&StringSerializer, &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ClientError::Serialization(_)));
        assert_eq!(
            StringSerializer.deserialize(b"hello").unwrap(),
            "hello".to_string()
        );
    }

    #[test]
    fn test_bytes_serializer_is_identity() {
        let payload = Bytes::from_static(&[0, 1, 2, 255]);
        assert_eq!(BytesSerializer.serialize(&payload).unwrap(), payload);
        assert_eq!(BytesSerializer.deserialize(&payload).unwrap(), payload);
    }

    #[test]
    fn test_explicit_content_type_is_kept() {
        let request = Envelope::new("", "text".to_string())
            .with_header(CONTENT_TYPE_HEADER, "text/csv")
            .encode(&StringSerializer)
            .unwrap();
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers[0].value, Bytes::from("text/csv"));
    }

    #[tokio::test]
    async fn test_typed_handler_fails_on_malformed_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let handler = typed_handler(JsonSerializer, move |order: Envelope<Order>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(order.data.id);
                Ok(())
            }
        });

        handler(message(r#"{"id":3,"item":"pen"}"#)).await.unwrap();
        let err = handler(message("not json")).await.unwrap_err();

        assert!(matches!(err, ClientError::Serialization(_)));
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_typed_producer_sends_serialized_values() {
        let broker = MemoryBroker::new();
        let producer = builder(&broker).build_immediate().await.unwrap();
        let orders = TypedProducer::new(Arc::new(producer), JsonSerializer);

        orders
            .send(
                "o-1",
                &Order {
                    id: 1,
                    item: "lamp".into(),
                },
            )
            .await
            .unwrap();
        orders.close().await.unwrap();

        let received = broker.received("orders");
        assert_eq!(received.len(), 1);
        let order: Order = serde_json::from_slice(&received[0]).unwrap();
        assert_eq!(order.item, "lamp");
    }
}
