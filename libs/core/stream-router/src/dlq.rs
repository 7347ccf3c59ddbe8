//! Dead-letter store
//!
//! Inspects and replays events parked on `<q>_dlq_queue` after their retries
//! ran out. Both operations assume nothing else consumes the dead-letter
//! queue at the same time.

use crate::broker::{Channel, Connector, Delivery};
use crate::error::{BrokerError, DlqError, RetryError};
use crate::event::Event;
use crate::metrics::{MetricsSink, SharedSink, DLQ_DEPTH};
use crate::retry::RetryManager;
use crate::topology::{queue_name, QueueType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Outcome of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replay_count: usize,
    pub error_count: usize,
}

/// A parked event and its position in the dead-letter queue, held only
/// while a view or replay is in progress.
#[derive(Debug, Clone, PartialEq)]
struct DeadLetterEntry {
    position: usize,
    event: Event,
}

/// Read access to every configured queue's dead-letter path.
pub struct DeadLetterStore {
    connector: Arc<dyn Connector>,
    retry: Arc<RetryManager>,
}

impl DeadLetterStore {
    /// Dead-letter reads dial their own connection through `connector`;
    /// replays publish through `retry`.
    pub fn new(connector: Arc<dyn Connector>, retry: Arc<RetryManager>) -> Self {
        Self { connector, retry }
    }

    /// Read up to `count` parked events, oldest first.
    ///
    /// With `consume = false` every read message is requeued, so repeated
    /// views return the same events. With `consume = true` they are
    /// acknowledged and gone. A message that fails to decode aborts the
    /// read and everything read so far is requeued. A queue whose
    /// dead-letter path was never declared reads as empty.
    #[instrument(skip(self))]
    pub async fn view(&self, queue: &str, count: usize, consume: bool) -> Result<Vec<Event>, DlqError> {
        let entries = self.fetch(queue, count, consume).await?;
        Ok(entries.into_iter().map(|entry| entry.event).collect())
    }

    async fn fetch(&self, queue: &str, count: usize, consume: bool) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let connection = self.connector.connect().await?;
        let result = match connection.channel().await {
            Ok(channel) => {
                let read = self.read(channel.as_ref(), queue, count, consume).await;
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "auto retry view: channel close error");
                }
                read
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = connection.close().await {
            warn!(error = %e, "auto retry view: connection close error");
        }
        result
    }

    /// Move up to `count` parked events back onto the instant path.
    ///
    /// The events are consumed first, then republished one by one with their
    /// retry counter reset. Failed publishes are counted, not retried.
    #[instrument(skip(self))]
    pub async fn replay(&self, queue: &str, count: usize) -> Result<ReplayReport, DlqError> {
        if !self.retry.is_initialized() {
            return Err(RetryError::PublisherNotInitialized.into());
        }

        let entries = self.fetch(queue, count, true).await?;
        let mut report = ReplayReport::default();
        for DeadLetterEntry { position, event } in entries {
            let event = event.without_retry_count();
            match self.retry.publish_to(&event, queue, QueueType::Instant, None).await {
                Ok(()) => report.replay_count += 1,
                Err(e) => {
                    warn!(queue = %queue, position, error = %e, "Failed to replay event");
                    report.error_count += 1;
                }
            }
        }

        info!(
            queue = %queue,
            replayed = report.replay_count,
            errors = report.error_count,
            "Replayed dead-lettered events"
        );
        Ok(report)
    }

    /// Messages parked on `queue`'s dead-letter path.
    pub async fn depth(&self, queue: &str) -> Result<usize, DlqError> {
        let connection = self.connector.connect().await?;
        let result = match connection.channel().await {
            Ok(channel) => {
                let inspected = channel.inspect_queue(&queue_name(queue, QueueType::Dlq)).await;
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close channel");
                }
                match inspected {
                    Ok(state) => Ok(state.messages),
                    Err(e) if e.is_not_found() => Ok(0),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
        result
    }

    /// Report every configured queue's dead-letter depth every `every`
    /// until `shutdown` flips.
    pub fn spawn_depth_reporter(
        self: &Arc<Self>,
        sink: SharedSink,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.report_depths(sink.as_ref()).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Dead-letter depth reporter stopped");
        })
    }

    async fn report_depths(&self, sink: &dyn MetricsSink) {
        for queue in self.retry.queues().names() {
            match self.depth(queue).await {
                Ok(depth) => sink.gauge(DLQ_DEPTH, depth as f64, &[("queue", queue)]),
                Err(e) => warn!(queue = %queue, error = %e, "Failed to read dead-letter depth"),
            }
        }
    }

    async fn read(
        &self,
        channel: &dyn Channel,
        queue: &str,
        count: usize,
        consume: bool,
    ) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let dlq = queue_name(queue, QueueType::Dlq);
        let available = match channel.inspect_queue(&dlq).await {
            Ok(state) => state.messages,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let wanted = count.min(available);
        let mut deliveries = Vec::with_capacity(wanted);
        let mut entries = Vec::with_capacity(wanted);

        for position in 0..wanted {
            let delivery = match channel.get(&dlq).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    requeue(deliveries).await;
                    return Err(e.into());
                }
            };

            match self.retry.codec().decode(&delivery.body) {
                Ok(event) => {
                    entries.push(DeadLetterEntry { position, event });
                    deliveries.push(delivery);
                }
                Err(e) => {
                    deliveries.push(delivery);
                    requeue(deliveries).await;
                    return Err(DlqError::Decode(e));
                }
            }
        }

        if consume {
            for delivery in deliveries {
                if let Err(e) = delivery.ack().await {
                    warn!(queue = %dlq, error = %e, "Failed to ack dead-lettered message");
                }
            }
        } else {
            requeue(deliveries).await;
        }

        debug!(queue = %dlq, read = entries.len(), consume, "Read dead-letter queue");
        Ok(entries)
    }
}

/// Return deliveries to the queue, newest first.
async fn requeue(deliveries: Vec<Delivery>) {
    for delivery in deliveries.into_iter().rev() {
        if let Err(e) = delivery.reject(true).await
            && e != BrokerError::AlreadySettled
        {
            warn!(error = %e, "Failed to requeue dead-lettered message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OutboundMessage;
    use crate::config::{QueueConfig, QueueSet};
    use crate::memory::MemoryBroker;
    use crate::metrics::testing::RecordingSink;
    use crate::topology::exchange_name;

    async fn setup() -> (MemoryBroker, Arc<RetryManager>, DeadLetterStore) {
        let broker = MemoryBroker::new();
        let queues = QueueSet::new([QueueConfig::new("orders").with_retry_count(1)]).unwrap();
        let retry = Arc::new(RetryManager::new(queues));
        retry.init_publisher(broker.connect().await.unwrap()).await.unwrap();
        let store = DeadLetterStore::new(Arc::new(broker.clone()), retry.clone());
        (broker, retry, store)
    }

    async fn park(retry: &RetryManager, values: &[&str]) -> Vec<Event> {
        let mut parked = Vec::new();
        for value in values {
            let event = Event::new("k", *value, "broker/orders/0").with_retry_count(1);
            retry.publish_to(&event, "orders", QueueType::Dlq, None).await.unwrap();
            parked.push(event);
        }
        parked
    }

    fn dlq_depth(broker: &MemoryBroker) -> usize {
        broker.queue_depth(&queue_name("orders", QueueType::Dlq)).unwrap()
    }

    #[tokio::test]
    async fn test_view_is_repeatable() {
        let (broker, retry, store) = setup().await;
        let parked = park(&retry, &["a", "b", "c"]).await;

        let first = store.view("orders", 3, false).await.unwrap();
        let second = store.view("orders", 3, false).await.unwrap();

        assert_eq!(first, parked);
        assert_eq!(second, first);
        assert_eq!(dlq_depth(&broker), 3);
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_view_caps_count() {
        let (_broker, retry, store) = setup().await;
        park(&retry, &["a", "b"]).await;

        assert_eq!(store.view("orders", 10, false).await.unwrap().len(), 2);
        assert!(store.view("orders", 0, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consuming_view_removes() {
        let (broker, retry, store) = setup().await;
        park(&retry, &["a", "b", "c"]).await;

        let taken = store.view("orders", 2, true).await.unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].value(), b"a");
        assert_eq!(dlq_depth(&broker), 1);
        assert_eq!(store.view("orders", 5, false).await.unwrap()[0].value(), b"c");
    }

    #[tokio::test]
    async fn test_missing_queue_reads_empty() {
        let (_broker, _retry, store) = setup().await;
        assert!(store.view("unknown", 5, false).await.unwrap().is_empty());
        assert_eq!(store.depth("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_requeues_everything() {
        let (broker, retry, store) = setup().await;
        park(&retry, &["a"]).await;

        let connection = broker.connect().await.unwrap();
        let channel = connection.channel().await.unwrap();
        channel
            .publish(OutboundMessage::new(exchange_name("orders", QueueType::Dlq), b"garbage".to_vec()))
            .await
            .unwrap();
        park(&retry, &["c"]).await;

        let err = store.view("orders", 3, true).await.unwrap_err();
        assert!(matches!(err, DlqError::Decode(_)));

        let bodies = broker.peek(&queue_name("orders", QueueType::Dlq));
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[1], b"garbage".to_vec());
        assert_eq!(broker.unacked(&queue_name("orders", QueueType::Dlq)), 0);
    }

    #[tokio::test]
    async fn test_replay_counts_failures() {
        let (broker, retry, store) = setup().await;
        park(&retry, &["a", "b", "c"]).await;

        broker.fail_next_publishes(1);
        let report = store.replay("orders", 3).await.unwrap();

        assert_eq!(
            report,
            ReplayReport {
                replay_count: 2,
                error_count: 1
            }
        );
        assert_eq!(dlq_depth(&broker), 0);

        let replayed: Vec<Event> = broker
            .peek(&queue_name("orders", QueueType::Instant))
            .iter()
            .map(|body| retry.codec().decode(body).unwrap())
            .collect();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].value(), b"b");
        assert!(replayed.iter().all(|e| e.retry_count() == 0));
    }

    #[tokio::test]
    async fn test_replay_requires_publisher() {
        let (broker, retry, store) = setup().await;
        park(&retry, &["a"]).await;
        retry.take_publisher();

        let err = store.replay("orders", 1).await.unwrap_err();
        assert!(matches!(err, DlqError::Retry(RetryError::PublisherNotInitialized)));
        assert_eq!(dlq_depth(&broker), 1);
    }

    #[tokio::test]
    async fn test_entries_keep_queue_positions() {
        let (_broker, retry, store) = setup().await;
        park(&retry, &["a", "b"]).await;

        let entries = store.fetch("orders", 2, false).await.unwrap();
        assert_eq!(entries[1].position, 1);
        assert_eq!(entries[1].event.value(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_reporter() {
        let (_broker, retry, store) = setup().await;
        park(&retry, &["a", "b"]).await;

        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Arc::new(store);
        let reporter = store.spawn_depth_reporter(sink.clone(), Duration::from_secs(10), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let (depth, tags) = sink.last_gauge(DLQ_DEPTH).unwrap();
        assert_eq!(depth, 2.0);
        assert_eq!(tags, vec![("queue".to_string(), "orders".to_string())]);

        shutdown_tx.send(true).unwrap();
        reporter.await.unwrap();
    }
}
