//! Order Pipeline Example
//!
//! Produces a stream of orders into the in-memory broker and consumes them
//! with a consumer group, a middleware chain and Prometheus metrics.
//!
//! Run with:
//! ```bash
//! RUST_LOG=courier_client=debug cargo run --package courier-client --example order_pipeline
//! ```

use bytes::Bytes;
use courier_client::middleware::{self, CircuitBreaker, RateLimiter};
use courier_client::{
    typed_handler, ClientConfig, CourierClient, Envelope, JsonSerializer, ProducerStrategy,
    TypedProducer,
};
use courier_core::MemoryBroker;
use courier_observability::{LogExporter, PrometheusRecorder, Tracer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u64,
    customer: String,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker = MemoryBroker::with_partitions(3);
    let metrics = Arc::new(PrometheusRecorder::new("courier")?);
    let config = ClientConfig {
        brokers: vec!["memory:0".to_string()],
        topic: "orders".to_string(),
        group_id: "billing".to_string(),
        ..ClientConfig::default()
    };
    let client = CourierClient::with_metrics(config, Arc::new(broker.clone()), metrics.clone())?;

    // Produce
    let producer = client
        .producer()
        .strategy(ProducerStrategy::Batch)
        .batch_size(50)
        .linger(Duration::from_millis(20))
        .build()
        .await?;
    let orders = TypedProducer::new(producer, JsonSerializer);
    for id in 0..200u64 {
        let order = Order {
            id,
            customer: format!("customer-{}", id % 17),
            amount_cents: 500 + id * 3,
        };
        orders
            .send(Bytes::from(order.customer.clone()), &order)
            .await?;
    }
    orders.close().await?;
    println!("Produced 200 orders");

    // Consume
    let handled = Arc::new(AtomicUsize::new(0));
    let handler = {
        let handled = handled.clone();
        typed_handler(JsonSerializer, move |order: Envelope<Order>| {
            let handled = handled.clone();
            async move {
                tracing::debug!(id = order.data.id, customer = %order.data.customer, "Billing order");
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(10)));
    let limiter = Arc::new(RateLimiter::new(1_000, Duration::from_secs(1)));
    let tracer = Tracer::with_exporter("billing", Arc::new(LogExporter));
    let template = client
        .consumer()
        .with(middleware::recovery())
        .with(middleware::logger())
        .with(middleware::tracing_span(tracer))
        .with(limiter.middleware())
        .with(breaker.middleware())
        .with(middleware::retry(2, Duration::from_millis(50)))
        .with(middleware::timeout(Duration::from_secs(1)));

    let group = courier_client::ConsumerGroupManager::new(template);
    group.start(3, handler).await?;

    while handled.load(Ordering::SeqCst) < 200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    group.stop_all().await?;
    client.close().await?;

    println!("Handled {} orders", handled.load(Ordering::SeqCst));
    println!("{}", metrics.encode_text()?);
    Ok(())
}
