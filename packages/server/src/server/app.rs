//! Application router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::{HealthRegistry, Orchestrator};

use super::routes;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub health: HealthRegistry,
}

/// Build the axum application.
pub fn build_app(orchestrator: Arc<Orchestrator>, health: HealthRegistry) -> Router {
    let state = AppState {
        orchestrator,
        health,
    };

    Router::new()
        .route("/webhooks/ci", post(routes::webhook::receive))
        .route("/health", get(routes::health::health))
        .route("/health/live", get(routes::health::live))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
