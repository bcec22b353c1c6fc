//! Observability HTTP Routes
//!
//! Liveness of the gateway plus the supervised runtime's state.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::functions::{RuntimeState, Service};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" when the runtime is healthy, "degraded" otherwise
    pub status: String,
    pub version: String,
    pub runtime: RuntimeState,
}

/// Health check route at the root
pub fn health_routes(service: Arc<Service>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(service)
}

/// The gateway itself is up whenever it answers; runtime trouble is
/// reported in the body, not the status code.
async fn health_handler(State(service): State<Arc<Service>>) -> impl IntoResponse {
    let healthy = service.is_healthy();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime: service.runtime().state(),
    };

    (StatusCode::OK, Json(response))
}
