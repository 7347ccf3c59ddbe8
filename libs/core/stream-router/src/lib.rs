//! Stream Router
//!
//! Message dispatch and retry core for queue consumers.
//!
//! ## Features
//!
//! - **Pattern routing**: `RouteTable` maps routing paths to handlers by exact
//!   match or longest registered prefix
//! - **Middleware pipelines**: `Pipeline` composes handler decorators, first
//!   registered runs outermost
//! - **Queue topology**: instant, delay and dead-letter queue per logical queue
//! - **Delay-queue retries**: `RetryManager` republishes failed events with a
//!   TTL until the retry budget is spent, then parks them in the DLQ
//! - **Dead-letter replay**: `DeadLetterStore` views and replays parked events
//! - **Consumer supervision**: `ConsumerSupervisor` runs and drains one consumer
//!   per queue
//! - **Prometheus metrics** and an axum admin router
//!
//! ## Example
//!
//! ```ignore
//! use stream_router::{
//!     handler_fn, ConsumerSupervisor, MemoryBroker, ProcessingOutcome, QueueConfig, QueueSet,
//!     RetryManager, RouteTable,
//! };
//!
//! let queues = QueueSet::new([QueueConfig::new("orders").with_retry_count(3)])?;
//! let retry = Arc::new(RetryManager::new(queues));
//!
//! let mut routes = RouteTable::new();
//! routes.register("localhost:9092/orders", handler_fn(|event| async move {
//!     ProcessingOutcome::Success
//! }))?;
//!
//! let broker = MemoryBroker::new();
//! let supervisor = ConsumerSupervisor::new(Arc::new(broker), retry);
//! supervisor.run(Arc::new(routes), shutdown_signal()).await?;
//! ```

pub mod admin;
pub mod broker;
mod codec;
mod config;
mod dlq;
mod error;
mod event;
mod handler;
pub mod memory;
pub mod metrics;
mod pipeline;
mod retry;
mod router;
mod supervisor;
pub mod topology;

// Re-export main types
pub use admin::{router as admin_router, AdminState};
pub use broker::{Channel, Connection, Connector, Delivery, Dialer, SharedConnection, Transport};
pub use codec::{Codec, JsonCodec};
pub use config::{QueueConfig, QueueSet, DEFAULT_DELAY_MS};
pub use dlq::{DeadLetterStore, ReplayReport};
pub use error::{
    BrokerError, CodecError, ConfigError, DlqError, RetryError, RouteError, SupervisorError,
};
pub use event::{Event, RETRY_COUNT_HEADER};
pub use handler::{handler_fn, BoxHandler, Handler, HandlerFn, ProcessingOutcome};
pub use memory::MemoryBroker;
pub use metrics::{init_metrics, MetricsSink, NoopSink, PrometheusSink, SharedSink};
pub use pipeline::{compose, BoxMiddleware, Middleware, Pipeline};
pub use retry::RetryManager;
pub use router::{RouteMatch, RouteTable};
pub use supervisor::ConsumerSupervisor;
pub use topology::{declare_topology, QueueType};
