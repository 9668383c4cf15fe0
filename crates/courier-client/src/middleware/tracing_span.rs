use super::{handler_fn, middleware_fn, Handler, Middleware};
use courier_observability::Tracer;
use std::sync::Arc;

/// Record one `consume` span per message.
///
/// The span continues the producer's trace when the message carries
/// `trace-id` / `span-id` headers, is tagged with topic, partition, offset and
/// key, and is finished with the handler's outcome.
pub fn tracing_span(tracer: Tracer) -> Middleware {
    let tracer = Arc::new(tracer);
    middleware_fn(move |next: Handler| {
        let tracer = tracer.clone();
        handler_fn(move |msg| {
            let next = next.clone();
            let tracer = tracer.clone();
            async move {
                let parent = tracer.extract(&msg);
                let mut span = tracer.start_span("consume", parent.as_ref());
                span.set_tag("topic", &msg.topic);
                span.set_tag("partition", msg.partition);
                span.set_tag("offset", msg.offset);
                span.set_tag("key", String::from_utf8_lossy(&msg.key));

                let result = next(msg).await;
                match &result {
                    Ok(()) => span.set_ok(),
                    Err(e) => span.set_error(e),
                }
                tracer.finish(span);
                result
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::middleware::compose;
    use crate::middleware::test_support::message;
    use courier_core::Header;
    use courier_observability::{CollectingExporter, SpanStatus};

    #[tokio::test]
    async fn test_span_per_message_with_outcome() {
        let exporter = Arc::new(CollectingExporter::new());
        let tracer = Tracer::with_exporter("orders-service", exporter.clone());
        let handler = compose(
            handler_fn(|msg| async move {
                if msg.offset == 1 {
                    return Err(ClientError::handler_msg("bad"));
                }
                Ok(())
            }),
            &[tracing_span(tracer)],
        );

        handler(message(0)).await.unwrap();
        handler(message(1)).await.unwrap_err();

        let spans = exporter.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].operation, "consume");
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].tags["offset"], "0");
        assert_eq!(spans[0].tags["key"], "key");
        assert_eq!(spans[1].status, SpanStatus::Error);
        assert!(spans[1].is_finished());
    }

    #[tokio::test]
    async fn test_span_joins_incoming_trace() {
        let exporter = Arc::new(CollectingExporter::new());
        let tracer = Tracer::with_exporter("orders-service", exporter.clone());
        let handler = compose(handler_fn(|_msg| async { Ok(()) }), &[tracing_span(tracer)]);

        let mut msg = (*message(0)).clone();
        msg.headers.push(Header::new("trace-id", "trace-1"));
        msg.headers.push(Header::new("span-id", "span-1"));
        handler(Arc::new(msg)).await.unwrap();

        let spans = exporter.spans();
        assert_eq!(spans[0].trace_id, "trace-1");
        assert_eq!(spans[0].parent_id.as_deref(), Some("span-1"));
    }
}
