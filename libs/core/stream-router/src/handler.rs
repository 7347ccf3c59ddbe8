//! Handler trait and processing outcomes.
//!
//! Every stage of the pipeline (router, middleware, retry wrapper, user code)
//! is a `Handler`. They are shared as `Arc<dyn Handler>` and may be invoked
//! concurrently, so implementations must be `Send + Sync`.

use crate::event::Event;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use strum::AsRefStr;

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Event was processed.
    Success,
    /// Event could not be processed now; send it through the delay path.
    Retry,
    /// Event is dropped without retrying.
    Skip,
    /// Handler produced a code this framework does not know.
    Invalid(String),
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOutcome::Invalid(code) => write!(f, "invalid({})", code),
            other => f.write_str(other.as_ref()),
        }
    }
}

impl ProcessingOutcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, ProcessingOutcome::Retry)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ProcessingOutcome::Invalid(_))
    }
}

impl FromStr for ProcessingOutcome {
    type Err = std::convert::Infallible;

    /// Parse an outcome code; unknown codes map to `Invalid`.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Ok(match code.trim().to_ascii_lowercase().as_str() {
            "success" => ProcessingOutcome::Success,
            "retry" => ProcessingOutcome::Retry,
            "skip" => ProcessingOutcome::Skip,
            _ => ProcessingOutcome::Invalid(code.to_string()),
        })
    }
}

/// Anything that can process an event.
///
/// # Example
///
/// ```rust,ignore
/// use stream_router::{Event, Handler, ProcessingOutcome};
///
/// struct OrderHandler;
///
/// #[async_trait]
/// impl Handler for OrderHandler {
///     async fn handle(&self, event: Event) -> ProcessingOutcome {
///         match serde_json::from_slice::<Order>(event.value()) {
///             Ok(_) => ProcessingOutcome::Success,
///             Err(_) => ProcessingOutcome::Skip,
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event) -> ProcessingOutcome;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, event: Event) -> ProcessingOutcome {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into a `Handler`.
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessingOutcome> + Send,
{
    async fn handle(&self, event: Event) -> ProcessingOutcome {
        (self.f)(event).await
    }
}

/// Build a shared handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingOutcome> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}
