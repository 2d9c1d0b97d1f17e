use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the job broker answers a ping.
    pub broker_healthy: bool,
}

/// GET /health -- returns service and broker health. No token required.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker_healthy = match state.registry.backend().ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Broker health check failed");
            false
        }
    };

    let status = if broker_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        broker_healthy,
    })
}

/// Mount health check routes (outside the authenticated tree).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
