//! Health check endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "state": state.status.state(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /version - Installed and running version
pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    let installation = state.status.installation().await;

    Json(json!({
        "installed": installation.current_version,
        "running": env!("CARGO_PKG_VERSION"),
    }))
}
