//! Delay-queue retry manager
//!
//! Wraps a handler so that a `Retry` outcome republishes the event:
//!
//! - retries left: to `<q>_delay_exchange` with the counter bumped and an
//!   expiration equal to the queue delay; once it expires the broker moves it
//!   back into `<q>_instant_exchange`
//! - retries exhausted: unchanged to `<q>_dlq_exchange`
//!
//! The counter travels in the [`RETRY_COUNT_HEADER`](crate::event::RETRY_COUNT_HEADER)
//! event header. With `retry_count = 3` the first three failures are delayed
//! and the fourth is dead-lettered.

use crate::broker::{OutboundMessage, SharedConnection};
use crate::codec::{Codec, JsonCodec};
use crate::config::QueueSet;
use crate::error::RetryError;
use crate::event::Event;
use crate::handler::{BoxHandler, Handler, ProcessingOutcome};
use crate::metrics::{NoopSink, SharedSink, RETRY_PUBLISHED};
use crate::pipeline::Middleware;
use crate::topology::{declare_topology, exchange_name, QueueType};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Publishes failed events onto the delay or dead-letter path.
pub struct RetryManager {
    queues: QueueSet,
    codec: Arc<dyn Codec>,
    sink: SharedSink,
    publisher: RwLock<Option<SharedConnection>>,
}

impl RetryManager {
    /// Create a manager for `queues`, encoding events as JSON.
    pub fn new(queues: QueueSet) -> Self {
        Self {
            queues,
            codec: Arc::new(JsonCodec),
            sink: Arc::new(NoopSink),
            publisher: RwLock::new(None),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_metrics(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Store the publisher connection and declare every queue's topology.
    pub async fn init_publisher(&self, connection: SharedConnection) -> Result<(), RetryError> {
        let channel = connection.channel().await?;

        let mut declared = Ok(());
        for config in self.queues.iter() {
            declared = declare_topology(channel.as_ref(), &config.queue_name).await;
            if declared.is_err() {
                break;
            }
        }
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close topology channel");
        }
        if let Err(e) = declared {
            error!(error = %e, "Failed to declare queues and exchanges");
            return Err(e.into());
        }

        *self.publisher.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
        info!(queues = self.queues.len(), "Retry publisher initialized");
        Ok(())
    }

    /// Detach the publisher connection, leaving the manager uninitialized.
    pub fn take_publisher(&self) -> Option<SharedConnection> {
        self.publisher.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_initialized(&self) -> bool {
        self.publisher.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn publisher(&self) -> Result<SharedConnection, RetryError> {
        self.publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RetryError::PublisherNotInitialized)
    }

    /// Send `event` down the retry path of `queue`. Returns the path taken.
    #[instrument(skip(self, event), fields(path = %event.routing_path()))]
    pub async fn publish(&self, event: &Event, queue: &str) -> Result<QueueType, RetryError> {
        let publisher = self.publisher()?;
        let config = self.queues.get(queue)?;
        let attempts = event.retry_count();

        let queue_type = if attempts >= config.retry_count {
            self.send(&publisher, event, queue, QueueType::Dlq, None).await?;
            QueueType::Dlq
        } else {
            let retried = event.clone().with_retry_count(attempts + 1);
            self.send(&publisher, &retried, queue, QueueType::Delay, Some(config.delay()))
                .await?;
            QueueType::Delay
        };

        debug!(attempts, path_type = %queue_type, "Published for retry");
        self.sink.inc_counter(
            RETRY_PUBLISHED,
            1,
            &[("queue", queue), ("type", queue_type.as_ref())],
        );
        Ok(queue_type)
    }

    /// Publish `event` as-is to one path of `queue`.
    pub async fn publish_to(
        &self,
        event: &Event,
        queue: &str,
        queue_type: QueueType,
        expiration: Option<Duration>,
    ) -> Result<(), RetryError> {
        let publisher = self.publisher()?;
        self.send(&publisher, event, queue, queue_type, expiration).await
    }

    async fn send(
        &self,
        publisher: &SharedConnection,
        event: &Event,
        queue: &str,
        queue_type: QueueType,
        expiration: Option<Duration>,
    ) -> Result<(), RetryError> {
        let body = self.codec.encode(event)?;
        let message = OutboundMessage::new(exchange_name(queue, queue_type), body)
            .with_routing_key(event.routing_path())
            .with_expiration(expiration);

        let channel = publisher.channel().await?;
        let published = channel.publish(message).await;
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close publish channel");
        }
        Ok(published?)
    }

    /// Wrap `handler` so a `Retry` outcome republishes through `queue`.
    pub fn wrap(self: &Arc<Self>, handler: BoxHandler, queue: impl Into<String>) -> BoxHandler {
        Arc::new(RetryHandler {
            manager: Arc::clone(self),
            inner: handler,
            queue: queue.into(),
        })
    }

    /// [`RetryManager::wrap`] as pipeline middleware.
    pub fn middleware(self: &Arc<Self>, queue: &str) -> impl Middleware + use<> {
        let manager = Arc::clone(self);
        let queue = queue.to_string();
        move |next: BoxHandler| manager.wrap(next, queue.clone())
    }
}

struct RetryHandler {
    manager: Arc<RetryManager>,
    inner: BoxHandler,
    queue: String,
}

#[async_trait]
impl Handler for RetryHandler {
    async fn handle(&self, event: Event) -> ProcessingOutcome {
        let outcome = self.inner.handle(event.clone()).await;
        if outcome.is_retry()
            && let Err(e) = self.manager.publish(&event, &self.queue).await
        {
            error!(queue = %self.queue, error = %e, "Auto retry publish failed");
        }
        outcome
    }
}
