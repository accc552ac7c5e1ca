//! Update status and manual check endpoints.

use super::AppState;
use crate::update::{OutcomeSummary, UpdateState};
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: UpdateState,
    pub busy: bool,
    pub current_version: String,
    pub root: PathBuf,
    pub last_outcome: Option<OutcomeSummary>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub status: &'static str,
    pub state: UpdateState,
}

/// GET /update/status - Current orchestrator state and last cycle outcome
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let installation = state.status.installation().await;

    Json(StatusResponse {
        state: state.status.state(),
        busy: state.status.is_busy(),
        current_version: installation.current_version,
        root: installation.root,
        last_outcome: state.status.last_outcome(),
    })
}

/// POST /update/check - Run a cycle now instead of waiting for the next interval
pub async fn check(State(state): State<AppState>) -> (StatusCode, Json<CheckResponse>) {
    let current = state.status.state();

    if state.status.request_check() {
        tracing::info!("Update check queued via API");
        (
            StatusCode::ACCEPTED,
            Json(CheckResponse {
                status: "queued",
                state: current,
            }),
        )
    } else {
        tracing::warn!(state = %current, "Update check rejected, cycle in flight or agent halted");
        (
            StatusCode::CONFLICT,
            Json(CheckResponse {
                status: "busy",
                state: current,
            }),
        )
    }
}
