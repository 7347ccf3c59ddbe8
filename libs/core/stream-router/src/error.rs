//! Error types for routing, transport, retry and dead-letter handling
//!
//! Errors are split by the component that raises them so callers can tell a
//! fatal configuration problem apart from a recoverable runtime failure:
//! - **Configuration**: `RouteError` registration variants and `ConfigError`,
//!   both meant to abort startup
//! - **Routing miss**: `RouteError::NotFound`, recoverable per message
//! - **Transport**: `BrokerError`, propagated to the caller
//! - **Decode**: `CodecError`, the message is requeued
//! - **Retry**: `RetryError`, including the distinct uninitialized-publisher case

use thiserror::Error;

/// Pattern registration and dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Pattern was empty, or only a separator
    #[error("pattern cannot be empty: {0:?}")]
    EmptyPattern(String),

    /// Wildcard marker with nothing after it
    #[error("invalid wildcard segment in pattern {0:?}")]
    InvalidWildcard(String),

    /// The normalized pattern is already registered
    #[error("multiple registrations for {0}")]
    DuplicatePattern(String),

    /// No registered pattern matches the path
    #[error("no pattern registered for {0}")]
    NotFound(String),
}

impl RouteError {
    /// Registration errors must abort startup; a miss is recoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RouteError::NotFound(_))
    }
}

/// Queue configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue name cannot be empty")]
    EmptyQueueName,

    #[error("queue {0} is configured more than once")]
    DuplicateQueue(String),

    #[error("unknown queue {0}")]
    UnknownQueue(String),

    #[error("invalid queue configuration: {0}")]
    Invalid(String),
}

/// Broker transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("delivery already settled")]
    AlreadySettled,

    #[error("publish to {exchange} failed: {reason}")]
    Publish { exchange: String, reason: String },

    #[error("dial {host} failed: {reason}")]
    Dial { host: String, reason: String },

    #[error("no broker urls configured")]
    NoEndpoints,

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::QueueNotFound(_) | BrokerError::ExchangeNotFound(_)
        )
    }
}

/// Event encode/decode errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Retry manager errors
#[derive(Error, Debug)]
pub enum RetryError {
    /// `publish` was called before `init_publisher`
    #[error("auto retry publish error: publisher not initialized, call init_publisher first")]
    PublisherNotInitialized,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Dead-letter view/replay errors
#[derive(Error, Debug)]
pub enum DlqError {
    #[error("couldn't decode dead-lettered message: {0}")]
    Decode(#[source] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Retry(#[from] RetryError),
}

/// Consumer supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("supervisor not started")]
    NotStarted,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Retry(#[from] RetryError),
}
