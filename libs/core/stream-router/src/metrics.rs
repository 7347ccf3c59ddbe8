//! Metrics for routing and retry
//!
//! Components report through a [`MetricsSink`]. [`PrometheusSink`] forwards to
//! the `metrics` facade, which [`init_metrics`] backs with a Prometheus
//! recorder rendered by [`render_metrics`].

use crate::event::Event;
use crate::handler::{handler_fn, BoxHandler, ProcessingOutcome};
use crate::pipeline::Middleware;
use metrics::{counter, gauge, Label};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Handler execution time in milliseconds, tagged by route.
pub const HANDLER_EXEC_TIME: &str = "handler_exec_time_ms";
/// Events the handler did not retry or skip, tagged by route.
pub const PROCESSING_SUCCESS: &str = "message_processing_success_total";
/// Events the handler retried or skipped.
pub const PROCESSING_FAILURE_SKIP: &str = "message_processing_failure_skip_total";
/// Age of an event when it reached its handler, in milliseconds.
pub const MESSAGE_LAG: &str = "message_lag_ms";
/// Messages parked in a queue's dead-letter path.
pub const DLQ_DEPTH: &str = "dlq_depth";
/// Events published to the delay or dead-letter path.
pub const RETRY_PUBLISHED: &str = "retry_published_total";

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the installed handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Render metrics in Prometheus text format; `None` before `init_metrics`.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &str, value: u64, tags: &[(&str, &str)]);
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Shared metrics sink.
pub type SharedSink = Arc<dyn MetricsSink>;

/// Forwards to the `metrics` facade, adding an `app_name` label.
#[derive(Debug, Clone)]
pub struct PrometheusSink {
    app_name: String,
}

impl PrometheusSink {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    fn labels(&self, tags: &[(&str, &str)]) -> Vec<Label> {
        tags.iter()
            .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
            .chain(std::iter::once(Label::new("app_name", self.app_name.clone())))
            .collect()
    }
}

impl MetricsSink for PrometheusSink {
    fn inc_counter(&self, name: &str, value: u64, tags: &[(&str, &str)]) {
        counter!(name.to_string(), self.labels(tags)).increment(value);
    }

    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        gauge!(name.to_string(), self.labels(tags)).set(value);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn inc_counter(&self, _name: &str, _value: u64, _tags: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}

/// Middleware recording execution time and outcome per route.
///
/// `Retry` and `Skip` count as failures; any other outcome, including an
/// unrecognized one, counts as success.
pub fn handler_metrics(sink: SharedSink) -> impl Middleware {
    move |next: BoxHandler| {
        let sink = Arc::clone(&sink);
        handler_fn(move |event: Event| {
            let sink = Arc::clone(&sink);
            let next = Arc::clone(&next);
            async move {
                let route = event.routing_path().to_string();
                let started = Instant::now();
                let outcome = next.handle(event).await;
                let tags = [("route", route.as_str())];

                sink.gauge(HANDLER_EXEC_TIME, started.elapsed().as_millis() as f64, &tags);
                match outcome {
                    ProcessingOutcome::Retry | ProcessingOutcome::Skip => {
                        sink.inc_counter(PROCESSING_FAILURE_SKIP, 1, &tags)
                    }
                    _ => sink.inc_counter(PROCESSING_SUCCESS, 1, &tags),
                }
                outcome
            }
        })
    }
}

/// Middleware recording how old an event is when it reaches the handler.
pub fn message_lag(sink: SharedSink) -> impl Middleware {
    move |next: BoxHandler| {
        let sink = Arc::clone(&sink);
        handler_fn(move |event: Event| {
            let sink = Arc::clone(&sink);
            let next = Arc::clone(&next);
            async move {
                let lag = event.age().num_milliseconds().max(0);
                sink.gauge(MESSAGE_LAG, lag as f64, &[("route", event.routing_path())]);
                next.handle(event).await
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::pipeline::compose;

    fn returning(outcome: ProcessingOutcome) -> BoxHandler {
        handler_fn(move |_event: Event| {
            let outcome = outcome.clone();
            async move { outcome }
        })
    }

    #[tokio::test]
    async fn test_handler_metrics_counts_outcomes() {
        let sink = Arc::new(RecordingSink::default());
        let middleware: Arc<dyn Middleware> = Arc::new(handler_metrics(sink.clone()));

        let ok = compose(returning(ProcessingOutcome::Success), &[middleware.clone()]);
        let retry = compose(returning(ProcessingOutcome::Retry), &[middleware.clone()]);
        let skip = compose(returning(ProcessingOutcome::Skip), &[middleware.clone()]);
        let unknown = compose(returning(ProcessingOutcome::Invalid("later".into())), &[middleware]);

        ok.handle(Event::new("k", "v", "broker/orders/0")).await;
        retry.handle(Event::new("k", "v", "broker/orders/0")).await;
        skip.handle(Event::new("k", "v", "broker/orders/0")).await;
        unknown.handle(Event::new("k", "v", "broker/orders/0")).await;

        assert_eq!(sink.counter_total(PROCESSING_SUCCESS), 2);
        assert_eq!(sink.counter_total(PROCESSING_FAILURE_SKIP), 2);

        let (_, tags) = sink.last_gauge(HANDLER_EXEC_TIME).unwrap();
        assert_eq!(tags, vec![("route".to_string(), "broker/orders/0".to_string())]);
    }

    #[tokio::test]
    async fn test_message_lag_reports_age() {
        let sink = Arc::new(RecordingSink::default());
        let lag: Arc<dyn Middleware> = Arc::new(message_lag(sink.clone()));
        let handler = compose(returning(ProcessingOutcome::Success), &[lag]);

        let event = Event::new("k", "v", "a/b").with_timestamp(chrono::Utc::now() - chrono::Duration::seconds(2));
        assert_eq!(handler.handle(event).await, ProcessingOutcome::Success);

        let (lag, _) = sink.last_gauge(MESSAGE_LAG).unwrap();
        assert!(lag >= 2000.0);
    }

    #[test]
    fn test_prometheus_sink_labels() {
        let sink = PrometheusSink::new("relay");
        let labels = sink.labels(&[("route", "a/b")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].key(), "app_name");
        assert_eq!(labels[1].value(), "relay");
    }
}
