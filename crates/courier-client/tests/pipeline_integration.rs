//! Integration tests for the produce/consume pipeline.
//!
//! Every test runs producers and consumers against the in-memory broker:
//! 1. Batches arrive in submission order and commits cover handled work
//! 2. Middleware wrap the handler in registration order
//! 3. Poison messages reach the dead-letter topic and are never committed
//! 4. A consumer group splits partitions between its instances
//! 5. Typed payloads survive the trip, malformed ones are not acknowledged

use bytes::Bytes;
use courier_client::middleware::{self, ProducerDeadLetterSink, DLQ_ERROR, DLQ_ORIGINAL_TOPIC};
use courier_client::{
    handler_fn, middleware_fn, typed_handler, ClientConfig, ClientError, CommitStrategy, Consumer,
    ConsumerState, CourierClient, Envelope, Handler, JsonSerializer, Producer, ProducerBuilder,
    ProducerStrategy, TypedProducer,
};
use courier_core::{BrokerTransport, CommitMode, MemoryBroker, ProduceRequest, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn client(broker: &MemoryBroker) -> CourierClient {
    let config = ClientConfig {
        brokers: vec!["memory:0".to_string()],
        topic: "orders".to_string(),
        group_id: "billing".to_string(),
        ..ClientConfig::default()
    };
    CourierClient::new(config, Arc::new(broker.clone())).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn spawn_consumer(
    consumer: &Arc<dyn Consumer>,
    handler: Handler,
) -> tokio::task::JoinHandle<courier_client::Result<()>> {
    let consumer = consumer.clone();
    tokio::spawn(async move { consumer.start(handler, CancellationToken::new()).await })
}

fn collecting(values: Arc<Mutex<Vec<String>>>) -> Handler {
    handler_fn(move |msg| {
        let values = values.clone();
        async move {
            values
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&msg.value).into_owned());
            Ok(())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_batch_producer_to_manual_consumer() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let producer = client
        .producer()
        .strategy(ProducerStrategy::Batch)
        .batch_size(4)
        .linger(Duration::from_secs(3600))
        .build()
        .await
        .unwrap();
    for i in 0..10 {
        producer
            .send(Bytes::new(), Bytes::from(format!("m{i}")))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();

    let sizes = broker.batch_sizes("orders");
    assert!(sizes.iter().all(|&size| size <= 4));
    assert_eq!(sizes.iter().sum::<usize>(), 10);

    let consumer = client
        .consumer()
        .commit_strategy(CommitStrategy::Manual)
        .commit_batch_size(100)
        .read_timeout(Duration::from_millis(20))
        .build()
        .await
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let task = spawn_consumer(&consumer, collecting(seen.clone()));

    eventually(|| seen.lock().unwrap().len() == 10).await;
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    consumer.close().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(broker.commit_calls(), 1);
    assert_eq!(broker.commits()[0].offsets.len(), 10);
    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(10));

    client.close().await.unwrap();
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_middleware_run_in_registration_order() {
    let broker = MemoryBroker::new();
    broker.publish("orders", ProduceRequest::new("k", "v"));
    let client = client(&broker);
    let log = Arc::new(Mutex::new(Vec::new()));

    let tag = |name: &'static str| {
        let log = log.clone();
        middleware_fn(move |next: Handler| {
            let log = log.clone();
            handler_fn(move |msg| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("{name}-before"));
                    let result = next(msg).await;
                    log.lock().unwrap().push(format!("{name}-after"));
                    result
                }
            })
        })
    };

    let consumer = client
        .consumer()
        .read_timeout(Duration::from_millis(20))
        .with(tag("A"))
        .with(tag("B"))
        .build()
        .await
        .unwrap();
    let handler = {
        let log = log.clone();
        handler_fn(move |_msg| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        })
    };
    let task = spawn_consumer(&consumer, handler);

    eventually(|| log.lock().unwrap().len() == 5).await;
    consumer.close().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["A-before", "B-before", "handler", "B-after", "A-after"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_goes_to_dead_letter_topic() {
    let broker = MemoryBroker::new();
    for value in ["ok-0", "poison", "ok-2"] {
        broker.publish("orders", ProduceRequest::new(Bytes::new(), value));
    }
    let client = client(&broker);

    let dlq_producer = client
        .producer()
        .topic("orders.dlq")
        .strategy(ProducerStrategy::Immediate)
        .build()
        .await
        .unwrap();
    let sink = Arc::new(ProducerDeadLetterSink::new(dlq_producer.clone()));

    let poison_calls = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    let handler = {
        let poison_calls = poison_calls.clone();
        let handled = handled.clone();
        handler_fn(move |msg| {
            let poison_calls = poison_calls.clone();
            let handled = handled.clone();
            async move {
                if msg.value.as_ref() == b"poison" {
                    poison_calls.fetch_add(1, Ordering::SeqCst);
                    return Err(ClientError::handler_msg("cannot parse order"));
                }
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let consumer = client
        .consumer()
        .read_timeout(Duration::from_millis(20))
        .with(middleware::recovery())
        .with(middleware::dead_letter(sink))
        .with(middleware::retry(2, Duration::from_millis(10)))
        .build()
        .await
        .unwrap();
    let task = spawn_consumer(&consumer, handler);

    eventually(|| handled.load(Ordering::SeqCst) == 2).await;
    consumer.close().await.unwrap();
    task.await.unwrap().unwrap();
    dlq_producer.close().await.unwrap();

    assert_eq!(poison_calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.received("orders.dlq"), vec![Bytes::from("poison")]);
    // The poison message and everything after it on the partition stay uncommitted
    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(1));

    let transport: Arc<dyn BrokerTransport> = Arc::new(broker.clone());
    let inspector = transport.connect(&["memory:0".to_string()]).await.unwrap();
    inspector
        .subscribe(Subscription::new("orders.dlq", "inspect", CommitMode::Manual))
        .await
        .unwrap();
    let dead = inspector.read_message(Duration::from_millis(100)).await.unwrap();
    assert_eq!(dead.header_str(DLQ_ORIGINAL_TOPIC), Some("orders"));
    assert!(dead
        .header_str(DLQ_ERROR)
        .unwrap()
        .contains("cannot parse order"));
    inspector.close().await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_consumer_group_splits_partitions() {
    let broker = MemoryBroker::with_partitions(3);
    let client = client(&broker);

    let producer = client
        .producer()
        .strategy(ProducerStrategy::Async)
        .batch_size(8)
        .build()
        .await
        .unwrap();
    for i in 0..30 {
        producer
            .send(Bytes::from(format!("user-{}", i % 7)), Bytes::from(format!("e{i}")))
            .await
            .unwrap();
    }
    producer.flush().await.unwrap();
    producer.close().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn(move |msg| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push((msg.partition, msg.offset));
                Ok(())
            }
        })
    };

    let group = client.consumer_group();
    group.start(3, handler).await.unwrap();
    assert_eq!(broker.group_members("billing", "orders"), 3);

    eventually(|| seen.lock().unwrap().iter().collect::<HashSet<_>>().len() == 30).await;
    group.stop_all().await.unwrap();

    for partition in 0..3 {
        let len = broker.partition_len("orders", partition) as i64;
        if len > 0 {
            assert_eq!(broker.committed_offset("billing", "orders", partition), Some(len));
        }
    }
    assert_eq!(broker.group_members("billing", "orders"), 0);
    client.close().await.unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    item: String,
}

#[tokio::test(start_paused = true)]
async fn test_typed_payloads_end_to_end() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let producer = client
        .producer()
        .strategy(ProducerStrategy::Immediate)
        .build()
        .await
        .unwrap();
    let orders = TypedProducer::new(producer, JsonSerializer);
    orders
        .send("o-1", &Order { id: 1, item: "lamp".into() })
        .await
        .unwrap();
    broker.publish("orders", ProduceRequest::new("o-2", "{not json"));
    orders
        .send("o-3", &Order { id: 3, item: "desk".into() })
        .await
        .unwrap();
    orders.close().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let received = received.clone();
        typed_handler(JsonSerializer, move |order: Envelope<Order>| {
            let received = received.clone();
            async move {
                received.lock().unwrap().push(order.data.id);
                Ok(())
            }
        })
    };
    let consumer = client
        .consumer()
        .read_timeout(Duration::from_millis(20))
        .build()
        .await
        .unwrap();
    let task = spawn_consumer(&consumer, handler);

    eventually(|| received.lock().unwrap().len() == 2).await;
    consumer.close().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(*received.lock().unwrap(), vec![1, 3]);
    // Offset 1 failed to decode, so only offset 0 is committed
    assert_eq!(broker.committed_offset("billing", "orders", 0), Some(1));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_twice_releases_connections_once() {
    for strategy in [
        ProducerStrategy::Immediate,
        ProducerStrategy::Batch,
        ProducerStrategy::Async,
    ] {
        let broker = MemoryBroker::new();
        let producer = ProducerBuilder::new()
            .transport(Arc::new(broker.clone()))
            .brokers(vec!["memory:0".to_string()])
            .topic("orders")
            .strategy(strategy)
            .build()
            .await
            .unwrap();
        producer
            .send(Bytes::from("k"), Bytes::from("v"))
            .await
            .unwrap();

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(broker.received("orders").len(), 1, "{strategy:?}");
        assert_eq!(broker.connections_opened(), 1, "{strategy:?}");
        assert_eq!(broker.connections_closed(), 1, "{strategy:?}");
    }

    let broker = MemoryBroker::new();
    let consumer = client(&broker)
        .consumer()
        .commit_strategy(CommitStrategy::Auto)
        .build()
        .await
        .unwrap();
    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert_eq!(broker.connections_closed(), 1);
}
