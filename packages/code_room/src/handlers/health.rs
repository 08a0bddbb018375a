use axum::{Json, extract::State, response::IntoResponse};
use std::time::Duration;

use crate::AppState;
use crate::metrics;

/// How long a failed run launch keeps `/health` degraded
const RECENT_RUN_ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.len().await as u64;
    let metrics = state.metrics.snapshot();

    // launch failures point at a broken toolchain setup
    let status = if state.metrics.run_errored_within(RECENT_RUN_ERROR_WINDOW) {
        "degraded"
    } else {
        "healthy"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions,
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
