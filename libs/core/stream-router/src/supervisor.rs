//! Consumer supervisor
//!
//! Runs one consumption task per configured queue. Each task subscribes to
//! `<q>_instant_queue` and spreads deliveries over `worker_count` workers:
//!
//! ```text
//! start ─► publisher connection ─► RetryManager::init_publisher
//!       ─► consumer connection  ─► per queue: consume ─► workers ─► retry-wrapped handler
//!
//! stop  ─► shutdown signal ─► N queue closure notifications
//!       ─► close publisher + consumer ─► wait for both close signals
//! ```
//!
//! Every decoded delivery is acknowledged after the handler returns, whatever
//! the outcome. Deliveries that fail to decode are rejected and requeued
//! without reaching the handler.

use crate::broker::{Channel, Connector, Delivery, DeliveryStream, SharedConnection};
use crate::codec::Codec;
use crate::config::QueueConfig;
use crate::error::SupervisorError;
use crate::handler::{BoxHandler, ProcessingOutcome};
use crate::retry::RetryManager;
use crate::topology::{declare_topology, queue_name, QueueType};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Starts and stops the consumers of every configured queue.
pub struct ConsumerSupervisor {
    connector: Arc<dyn Connector>,
    retry: Arc<RetryManager>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    closed: mpsc::Receiver<String>,
    tasks: JoinSet<()>,
    consumer: SharedConnection,
    queues: usize,
}

struct Subscription {
    config: Arc<QueueConfig>,
    channel: Box<dyn Channel>,
    stream: DeliveryStream,
}

impl ConsumerSupervisor {
    /// Consume the queues configured on `retry` over connections from `connector`.
    pub fn new(connector: Arc<dyn Connector>, retry: Arc<RetryManager>) -> Self {
        Self {
            connector,
            retry,
            running: Mutex::new(None),
        }
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Declare topology and start consuming every queue with `handler`.
    ///
    /// The handler is wrapped with the retry manager once per queue.
    pub async fn start(&self, handler: BoxHandler) -> Result<(), SupervisorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let publisher = self.connector.connect().await?;
        if let Err(e) = self.retry.init_publisher(Arc::clone(&publisher)).await {
            close_connection(publisher, "publisher").await;
            return Err(e.into());
        }

        let consumer = match self.connector.connect().await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "Failed to connect consumer");
                if let Some(publisher) = self.retry.take_publisher() {
                    close_connection(publisher, "publisher").await;
                }
                return Err(e.into());
            }
        };
        let subscriptions = match self.subscribe(&consumer).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(error = %e, "Failed to start consumers");
                close_connections(self.retry.take_publisher(), consumer).await;
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed) = mpsc::channel(subscriptions.len().max(1));
        let queues = subscriptions.len();
        let mut tasks = JoinSet::new();

        for subscription in subscriptions {
            let queue = subscription.config.queue_name.clone();
            let handler = self.retry.wrap(Arc::clone(&handler), queue.clone());
            tasks.spawn(run_queue(
                subscription,
                handler,
                Arc::clone(self.retry.codec()),
                shutdown_rx.clone(),
                closed_tx.clone(),
            ));
            info!(queue = %queue, "Started consumer");
        }

        *running = Some(Running {
            shutdown,
            closed,
            tasks,
            consumer,
            queues,
        });
        Ok(())
    }

    async fn subscribe(&self, consumer: &SharedConnection) -> Result<Vec<Subscription>, SupervisorError> {
        let admin = consumer.channel().await?;
        let mut declared = Ok(());
        for config in self.retry.queues().iter() {
            declared = declare_topology(admin.as_ref(), &config.queue_name).await;
            if declared.is_err() {
                break;
            }
        }
        if let Err(e) = admin.close().await {
            warn!(error = %e, "Failed to close topology channel");
        }
        declared?;

        let mut subscriptions: Vec<Subscription> = Vec::new();
        for config in self.retry.queues().iter() {
            let subscribed = async {
                let channel = consumer.channel().await?;
                let stream = channel
                    .consume(
                        &queue_name(&config.queue_name, QueueType::Instant),
                        &format!("{}_consumer", config.queue_name),
                        config.prefetch(),
                    )
                    .await?;
                Ok::<_, SupervisorError>((channel, stream))
            }
            .await;

            match subscribed {
                Ok((channel, stream)) => subscriptions.push(Subscription {
                    config: Arc::clone(config),
                    channel,
                    stream,
                }),
                Err(e) => {
                    for mut subscription in subscriptions {
                        subscription.stream.close().await;
                        let _ = subscription.channel.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(subscriptions)
    }

    /// Stop every consumer, then close both connections.
    ///
    /// Returns once each queue reported its consumer closed and both the
    /// publisher and consumer connections signalled closure.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Err(SupervisorError::NotStarted);
        };

        info!(queues = running.queues, "Stopping consumers");
        running.shutdown.send_replace(true);

        for _ in 0..running.queues {
            match running.closed.recv().await {
                Some(queue) => info!(queue = %queue, "shutting down consumer"),
                None => break,
            }
        }
        while let Some(joined) = running.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task failed");
            }
        }

        close_connections(self.retry.take_publisher(), running.consumer).await;
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop.
    pub async fn run<F>(&self, handler: BoxHandler, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        self.start(handler).await?;
        shutdown.await;
        self.stop().await
    }
}

async fn close_connections(publisher: Option<SharedConnection>, consumer: SharedConnection) {
    let mut consumer_closed = consumer.close_signal();
    let mut publisher_closed = publisher.as_ref().map(|p| p.close_signal());

    if let Some(publisher) = &publisher
        && let Err(e) = publisher.close().await
    {
        warn!(error = %e, "Failed to close publisher connection");
    }
    if let Err(e) = consumer.close().await {
        warn!(error = %e, "Failed to close consumer connection");
    }

    if let Some(signal) = publisher_closed.as_mut() {
        signal.wait().await;
        info!("stopped publisher connection");
    }
    consumer_closed.wait().await;
    info!("stopped consumer connection");
}

async fn close_connection(connection: SharedConnection, role: &str) {
    let mut closed = connection.close_signal();
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close {} connection", role);
    }
    closed.wait().await;
    info!("stopped {} connection", role);
}

async fn run_queue(
    subscription: Subscription,
    handler: BoxHandler,
    codec: Arc<dyn Codec>,
    shutdown: watch::Receiver<bool>,
    closed: mpsc::Sender<String>,
) {
    let Subscription {
        config,
        channel,
        stream,
    } = subscription;
    let stream = Arc::new(Mutex::new(stream));

    let mut workers = JoinSet::new();
    for worker in 0..config.workers() {
        workers.spawn(consume(
            config.queue_name.clone(),
            worker,
            Arc::clone(&stream),
            Arc::clone(&handler),
            Arc::clone(&codec),
            shutdown.clone(),
        ));
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(queue = %config.queue_name, error = %e, "Worker failed");
        }
    }

    stream.lock().await.close().await;
    if let Err(e) = channel.close().await {
        warn!(queue = %config.queue_name, error = %e, "Failed to close consumer channel");
    }

    if closed.send(config.queue_name.clone()).await.is_err() {
        debug!(queue = %config.queue_name, "Supervisor no longer listening for closures");
    }
}

async fn consume(
    queue: String,
    worker: usize,
    stream: Arc<Mutex<DeliveryStream>>,
    handler: BoxHandler,
    codec: Arc<dyn Codec>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(queue = %queue, worker, "Worker started");
    while !*shutdown.borrow() {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = async { stream.lock().await.next().await } => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        process(&queue, delivery, &handler, codec.as_ref()).await;
    }
    debug!(queue = %queue, worker, "Worker stopped");
}

async fn process(queue: &str, delivery: Delivery, handler: &BoxHandler, codec: &dyn Codec) {
    let event = match codec.decode(&delivery.body) {
        Ok(event) => event,
        Err(e) => {
            error!(queue = %queue, error = %e, "Rejecting undecodable message");
            if let Err(e) = delivery.reject(true).await {
                warn!(queue = %queue, error = %e, "Failed to reject message");
            }
            return;
        }
    };

    debug!(queue = %queue, path = %event.routing_path(), "Processing message");
    let outcome = handler.handle(event).await;
    if let ProcessingOutcome::Invalid(code) = &outcome {
        warn!(queue = %queue, code = %code, "Unrecognized processing outcome");
    }

    if let Err(e) = delivery.ack().await {
        warn!(queue = %queue, error = %e, "Failed to ack message");
    }
}
