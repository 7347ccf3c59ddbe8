//! Relay Worker Service
//!
//! Consumes every configured queue, routes events by path and retries failed
//! ones through the delay queue until they land in the dead-letter queue.
//!
//! ## Architecture
//!
//! ```text
//! <q>_instant_queue
//!   ↓ (ConsumerSupervisor: worker_count workers per queue)
//! RetryManager wrapper ── Retry ──► <q>_delay_queue ── TTL ──► <q>_instant_exchange
//!   ↓                           └─► <q>_dlq_queue (retry budget spent)
//! Pipeline (handler metrics, message lag)
//!   ↓
//! RouteTable (exact match, then longest prefix)
//! ```
//!
//! ## Configuration
//!
//! - `RELAY_QUEUES`: JSON array of queue configs, e.g.
//!   `[{"queue_name":"orders","retry_count":3,"worker_count":2}]`
//! - `RELAY_DLQ_REPORT_INTERVAL_MS`: dead-letter depth gauge interval
//! - `RELAY_SWEEP_INTERVAL_MS`: message expiry sweep interval
//! - `BROKER_*`: see [`core_config::broker::BrokerConfig`]; the worker dials
//!   every host in turn with the configured credentials and timeout
//! - `ADMIN_*`: see [`core_config::server::ServerConfig`]

use axum::Router;
use core_config::{
    app_info, broker::BrokerConfig, env_or_default, server::ServerConfig, ConfigError,
    Environment, FromEnv,
};
use eyre::{Result, WrapErr};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_router::{
    admin_router, handler_fn, metrics, AdminState, BoxHandler, Connector, ConsumerSupervisor,
    DeadLetterStore, Dialer, Event, MemoryBroker, Pipeline, ProcessingOutcome, PrometheusSink,
    QueueConfig, QueueSet, RetryManager, RouteTable, SharedSink,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_QUEUES: &str = r#"[{"queue_name":"default","retry_count":3}]"#;

/// Worker settings beyond the broker and server configs
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub queues: QueueSet,
    pub dlq_report_interval: Duration,
    pub sweep_interval: Duration,
}

impl RelayConfig {
    /// Read `RELAY_*` variables, filling queue delays from `broker`.
    pub fn from_env(broker: &BrokerConfig) -> Result<Self> {
        let queues = load_queues(
            &env_or_default("RELAY_QUEUES", DEFAULT_QUEUES),
            broker.delay_expiration,
        )?;

        Ok(Self {
            queues,
            dlq_report_interval: millis_from_env("RELAY_DLQ_REPORT_INTERVAL_MS", "10000")?,
            sweep_interval: millis_from_env("RELAY_SWEEP_INTERVAL_MS", "100")?,
        })
    }
}

fn millis_from_env(key: &str, default: &str) -> Result<Duration> {
    let millis: u64 = env_or_default(key, default)
        .parse()
        .map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        })?;
    Ok(Duration::from_millis(millis))
}

/// Parse queue configs from JSON.
///
/// Entries without `delay_ms` (or `delay_expiration_ms`) take
/// `default_delay`.
pub fn load_queues(json: &str, default_delay: Duration) -> Result<QueueSet> {
    let entries: Vec<Value> =
        serde_json::from_str(json).wrap_err("RELAY_QUEUES must be a JSON array")?;

    let configs = entries
        .into_iter()
        .map(|mut entry| {
            if let Some(object) = entry.as_object_mut()
                && !object.contains_key("delay_ms")
                && !object.contains_key("delay_expiration_ms")
            {
                object.insert("delay_ms".to_string(), (default_delay.as_millis() as u64).into());
            }
            serde_json::from_value::<QueueConfig>(entry)
        })
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("Invalid queue config in RELAY_QUEUES")?;

    QueueSet::new(configs).wrap_err("Invalid RELAY_QUEUES")
}

/// Route table with one logging handler per queue, wrapped in the metrics
/// pipeline.
pub fn build_handler(queues: &QueueSet, sink: SharedSink) -> Result<BoxHandler> {
    let mut routes = RouteTable::new();
    for queue in queues.names() {
        let queue_name = queue.to_string();
        routes
            .register_shared(
                queue,
                handler_fn(move |event: Event| {
                    let queue = queue_name.clone();
                    async move {
                        info!(
                            queue = %queue,
                            route = %event.routing_path(),
                            retry_count = event.retry_count(),
                            bytes = event.value().len(),
                            "Relayed event"
                        );
                        ProcessingOutcome::Success
                    }
                }),
            )
            .wrap_err_with(|| format!("Failed to register route for {}", queue))?;
    }

    let pipeline = Pipeline::new()
        .layer(metrics::handler_metrics(Arc::clone(&sink)))
        .layer(metrics::message_lag(sink));

    Ok(pipeline.build(Arc::new(routes)))
}

/// Start the admin HTTP server
///
/// Provides endpoints for:
/// - Liveness: `/v1/ping`, `/health`
/// - Prometheus metrics: `/metrics`
/// - DLQ admin: `/v1/dlq/view`, `/v1/dlq/replay`
///
/// Stops accepting connections once `shutdown` flips to true.
async fn start_admin_server(
    state: AdminState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app: Router = admin_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(address = %listener.local_addr()?, "Admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Admin server failed")?;

    info!("Admin server stopped");
    Ok(())
}

/// Dial `broker` through every configured host with the configured
/// credentials and timeout.
fn broker_connector(broker: &MemoryBroker, config: &BrokerConfig) -> Arc<dyn Connector> {
    broker.listen(config.hosts.clone(), &config.username, &config.password);
    Arc::new(Dialer::new(broker.clone(), config.amqp_urls(), config.dial_timeout))
}

/// Run the relay worker
///
/// # Errors
///
/// Returns an error if:
/// - Broker, server or queue configuration is invalid
/// - The metrics recorder can't be installed
/// - The supervisor fails to start or stop
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting relay worker");
    info!("Environment: {:?}", environment);

    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let relay_config = RelayConfig::from_env(&broker_config)?;
    info!(
        hosts = broker_config.hosts.len(),
        queues = relay_config.queues.len(),
        dial_timeout_ms = broker_config.dial_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let admin_addr = server_config
        .socket_addr()
        .wrap_err("Invalid admin server address")?;

    let sink: SharedSink = Arc::new(PrometheusSink::new(&app_info.name));
    let broker = MemoryBroker::new();
    let connector = broker_connector(&broker, &broker_config);
    let retry = Arc::new(
        RetryManager::new(relay_config.queues.clone()).with_metrics(Arc::clone(&sink)),
    );
    let dlq = Arc::new(DeadLetterStore::new(Arc::clone(&connector), Arc::clone(&retry)));
    let supervisor = ConsumerSupervisor::new(connector, Arc::clone(&retry));
    let handler = build_handler(&relay_config.queues, Arc::clone(&sink))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = broker.spawn_sweeper(relay_config.sweep_interval, shutdown_rx.clone());
    let reporter = dlq.spawn_depth_reporter(
        Arc::clone(&sink),
        relay_config.dlq_report_interval,
        shutdown_rx.clone(),
    );

    let admin_state = AdminState::new(Arc::clone(&dlq), app_info.name, app_info.version);
    let admin_shutdown = shutdown_rx.clone();
    let admin = tokio::spawn(async move {
        if let Err(e) = start_admin_server(admin_state, admin_addr, admin_shutdown).await {
            error!(error = %e, "Admin server failed");
        }
    });

    let mut stop = shutdown_rx;
    let shutdown = async move {
        tokio::select! {
            result = shutdown_signal() => {
                if let Err(e) = result {
                    error!("Error waiting for shutdown signal: {}", e);
                }
            }
            _ = stop.changed() => {}
        }
    };

    let result = supervisor
        .run(handler, shutdown)
        .await
        .wrap_err("Consumer supervisor failed");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, reporter);
    if tokio::time::timeout(server_config.shutdown_timeout, admin)
        .await
        .is_err()
    {
        warn!(
            timeout_ms = server_config.shutdown_timeout.as_millis() as u64,
            "Admin server did not drain in time"
        );
    }

    result?;
    info!("Relay worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
