//! End-to-end retry cycle on the in-memory broker:
//! instant -> delay -> instant ... -> dlq -> replay -> instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use stream_router::broker::OutboundMessage;
use stream_router::topology::{exchange_name, queue_name};
use stream_router::{
    handler_fn, Codec, Connector, ConsumerSupervisor, DeadLetterStore, Event,
    JsonCodec, MemoryBroker, ProcessingOutcome, QueueConfig, QueueSet, QueueType, RetryManager,
    RouteTable,
};
use tokio::sync::watch;

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn publish_instant(broker: &MemoryBroker, queue: &str, event: &Event) {
    let connection = broker.connect().await.unwrap();
    let channel = connection.channel().await.unwrap();
    channel
        .publish(OutboundMessage::new(
            exchange_name(queue, QueueType::Instant),
            JsonCodec.encode(event).unwrap(),
        ))
        .await
        .unwrap();
    channel.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_event_is_retried_parked_and_replayed() {
    let broker = MemoryBroker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = broker.spawn_sweeper(Duration::from_millis(5), shutdown_rx);

    let queues = QueueSet::new([QueueConfig::new("orders")
        .with_retry_count(2)
        .with_delay_ms(20)])
    .unwrap();
    let retry = Arc::new(RetryManager::new(queues));
    let supervisor = ConsumerSupervisor::new(Arc::new(broker.clone()), Arc::clone(&retry));
    let store = DeadLetterStore::new(Arc::new(broker.clone()), Arc::clone(&retry));

    let healthy = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen_counts = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut routes = RouteTable::new();
    {
        let healthy = Arc::clone(&healthy);
        let calls = Arc::clone(&calls);
        let seen_counts = Arc::clone(&seen_counts);
        routes
            .register_shared(
                "localhost:9092/orders",
                handler_fn(move |event: Event| {
                    let healthy = Arc::clone(&healthy);
                    let calls = Arc::clone(&calls);
                    let seen_counts = Arc::clone(&seen_counts);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        seen_counts.lock().unwrap().push(event.retry_count());
                        if healthy.load(Ordering::SeqCst) {
                            ProcessingOutcome::Success
                        } else {
                            ProcessingOutcome::Retry
                        }
                    }
                }),
            )
            .unwrap();
    }

    supervisor.start(Arc::new(routes)).await.unwrap();

    let event = Event::new("order-1", r#"{"total":42}"#, "localhost:9092/orders/0");
    publish_instant(&broker, "orders", &event).await;

    // first attempt plus two retries, then parked
    let dlq = queue_name("orders", QueueType::Dlq);
    eventually("event to reach the dlq", || broker.queue_depth(&dlq) == Some(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*seen_counts.lock().unwrap(), vec![0, 1, 2]);

    let parked = store.view("orders", 10, false).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].key(), b"order-1");
    assert_eq!(parked[0].retry_count(), 2);

    healthy.store(true, Ordering::SeqCst);
    let report = store.replay("orders", 10).await.unwrap();
    assert_eq!(report.replay_count, 1);
    assert_eq!(report.error_count, 0);

    eventually("replayed event to be handled", || calls.load(Ordering::SeqCst) == 4).await;
    assert_eq!(seen_counts.lock().unwrap().last(), Some(&0));

    supervisor.stop().await.unwrap();
    assert_eq!(broker.queue_depth(&dlq), Some(0));
    assert_eq!(broker.queue_depth(&queue_name("orders", QueueType::Instant)), Some(0));
    assert_eq!(broker.open_connections(), 0);

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();
}
