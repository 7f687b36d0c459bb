//! Health endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::super::app::AppState;

/// Aggregate component health. 503 while any component is unhealthy.
pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.health.snapshot();
    let healthy = state.health.all_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "healthy": healthy,
            "components": snapshot,
        })),
    )
        .into_response()
}

/// Liveness: the process is up and serving.
pub async fn live() -> &'static str {
    "ok"
}
