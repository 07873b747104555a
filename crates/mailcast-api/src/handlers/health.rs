//! Health and metrics handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Readiness with the queue's current counts
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub store: String,
    pub queue_ready: usize,
    pub queue_delayed: usize,
    pub queue_in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let stats = state.queue.stats().await;
    let check = state.stores.health_check().await;
    let closed = state.queue.is_closed().await;

    let (status, store, error) = match check {
        Ok(()) if !closed => (StatusCode::OK, "healthy", None),
        Ok(()) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "healthy",
            Some("queue is closed".to_string()),
        ),
        Err(e) => {
            warn!(error = %e, "store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", Some(e.to_string()))
        }
    };

    (
        status,
        Json(ReadinessResponse {
            status: if status.is_success() { "ready" } else { "not_ready" }.to_string(),
            store: store.to_string(),
            queue_ready: stats.ready,
            queue_delayed: stats.delayed,
            queue_in_flight: stats.in_flight,
            error,
        }),
    )
}

/// Prometheus metrics
///
/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    state.telemetry.observe_queue(state.queue.stats().await);
    match state.telemetry.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
