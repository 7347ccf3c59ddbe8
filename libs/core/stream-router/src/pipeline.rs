//! Middleware pipeline
//!
//! A middleware takes the next handler and returns a handler wrapping it.
//! `compose(terminal, [a, b])` builds `a(b(terminal))`, so `a` runs first on
//! the way in and last on the way out.

use crate::handler::BoxHandler;
use std::sync::Arc;

/// Wraps a handler with cross-cutting behavior.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

impl<F> Middleware for F
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        self(next)
    }
}

/// Shared middleware.
pub type BoxMiddleware = Arc<dyn Middleware>;

/// Build one handler out of `terminal` and `middlewares`, first outermost.
pub fn compose(terminal: BoxHandler, middlewares: &[BoxMiddleware]) -> BoxHandler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.wrap(next))
}

/// Ordered middleware list, composed once with [`Pipeline::build`].
///
/// ```rust,ignore
/// let handler = Pipeline::new()
///     .layer(metrics::handler_metrics(sink.clone()))
///     .layer(logging)
///     .build(Arc::new(routes));
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<BoxMiddleware>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; earlier layers wrap later ones.
    pub fn layer(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn build(&self, terminal: BoxHandler) -> BoxHandler {
        compose(terminal, &self.middlewares)
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::handler::{handler_fn, ProcessingOutcome};
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn recording(name: &'static str, log: CallLog) -> BoxMiddleware {
        Arc::new(move |next: BoxHandler| {
            let log = Arc::clone(&log);
            handler_fn(move |event: Event| {
                let next = Arc::clone(&next);
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("{}-enter", name));
                    let outcome = next.handle(event).await;
                    log.lock().unwrap().push(format!("{}-exit", name));
                    outcome
                }
            })
        })
    }

    fn terminal(log: CallLog) -> BoxHandler {
        handler_fn(move |_event: Event| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push("T".to_string());
                ProcessingOutcome::Success
            }
        })
    }

    #[tokio::test]
    async fn test_compose_order() {
        let log: CallLog = Arc::default();
        let handler = compose(
            terminal(log.clone()),
            &[recording("A", log.clone()), recording("B", log.clone())],
        );

        let outcome = handler.handle(Event::new("k", "v", "a/b")).await;

        assert_eq!(outcome, ProcessingOutcome::Success);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-enter", "B-enter", "T", "B-exit", "A-exit"]
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_terminal() {
        let log: CallLog = Arc::default();
        let handler = Pipeline::new().build(terminal(log.clone()));

        handler.handle(Event::new("k", "v", "a/b")).await;
        assert_eq!(*log.lock().unwrap(), vec!["T"]);
    }

    #[tokio::test]
    async fn test_pipeline_builder_matches_compose() {
        let log: CallLog = Arc::default();
        let a = recording("A", log.clone());
        let b = recording("B", log.clone());
        let pipeline = Pipeline::new()
            .layer(move |next: BoxHandler| a.wrap(next))
            .layer(move |next: BoxHandler| b.wrap(next));
        assert_eq!(pipeline.len(), 2);

        let handler = pipeline.build(terminal(log.clone()));
        handler.handle(Event::new("k", "v", "a/b")).await;
        handler.handle(Event::new("k", "v", "a/b")).await;

        let calls = log.lock().unwrap();
        assert_eq!(calls.len(), 10);
        assert_eq!(calls[..5], ["A-enter", "B-enter", "T", "B-exit", "A-exit"]);
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let log: CallLog = Arc::default();
        let skip_all: BoxMiddleware = Arc::new(|_next: BoxHandler| {
            handler_fn(|_event: Event| async { ProcessingOutcome::Skip })
        });

        let handler = compose(terminal(log.clone()), &[skip_all]);
        assert_eq!(handler.handle(Event::new("k", "v", "a/b")).await, ProcessingOutcome::Skip);
        assert!(log.lock().unwrap().is_empty());
    }
}
