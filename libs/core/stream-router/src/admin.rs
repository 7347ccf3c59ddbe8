//! Admin HTTP surface
//!
//! - `GET /v1/ping` - liveness, answers `pong`
//! - `GET /health` - name and version
//! - `GET /metrics` - Prometheus text format
//! - `GET /v1/dlq/view?queue=<q>&count=<n>` - peek at dead-lettered events
//! - `POST /v1/dlq/replay?queue=<q>&count=<n>` - move dead-lettered events back

use crate::dlq::{DeadLetterStore, ReplayReport};
use crate::event::Event;
use crate::metrics;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub dlq: Arc<DeadLetterStore>,
    pub app_name: String,
    pub app_version: String,
}

impl AdminState {
    pub fn new(dlq: Arc<DeadLetterStore>, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            dlq,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/v1/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/dlq/view", get(view_handler))
        .route("/v1/dlq/replay", post(replay_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Raw `queue`/`count` query; validated by [`DlqParams::validate`].
#[derive(Debug, Default, Deserialize)]
pub struct DlqParams {
    pub queue: Option<String>,
    pub count: Option<String>,
}

impl DlqParams {
    fn validate(self) -> Result<(String, usize), String> {
        let queue = self
            .queue
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| "queue name cannot be empty".to_string())?;
        let count = self
            .count
            .ok_or_else(|| "count is required".to_string())?
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid count: {}", e))?;
        if count == 0 {
            return Err("count should be greater than zero".to_string());
        }
        Ok((queue, count))
    }
}

/// `GET /v1/dlq/view` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ViewResponse {
    pub events: Vec<Event>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub async fn ping_handler() -> &'static str {
    "pong"
}

pub async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Prometheus scrape endpoint; 503 until the recorder is installed.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

/// Non-destructive dead-letter view.
pub async fn view_handler(
    State(state): State<AdminState>,
    Query(params): Query<DlqParams>,
) -> Result<Json<ViewResponse>, ApiError> {
    let (queue, count) = params
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    match state.dlq.view(&queue, count, false).await {
        Ok(events) => Ok(Json(ViewResponse {
            count: events.len(),
            events,
        })),
        Err(e) => {
            error!(queue = %queue, error = %e, "Dead-letter view failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("couldn't view messages from dlq: {}", e),
            ))
        }
    }
}

/// Replay dead-lettered events onto the instant path.
pub async fn replay_handler(
    State(state): State<AdminState>,
    Query(params): Query<DlqParams>,
) -> Result<Json<ReplayReport>, ApiError> {
    let (queue, count) = params
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    state.dlq.replay(&queue, count).await.map(Json).map_err(|e| {
        error!(queue = %queue, error = %e, "Dead-letter replay failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
