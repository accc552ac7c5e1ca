//! HTTP status API for the update agent.

pub mod health;
pub mod update;

use crate::update::StatusHandle;
use axum::{
    routing::{get, post},
    Router,
};
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub status: StatusHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(status: StatusHandle) -> Self {
        Self {
            status,
            started_at: Instant::now(),
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Update endpoints
        .route("/update/status", get(update::status))
        .route("/update/check", post(update::check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{
        BackupManager, InstallationState, Manifest, Orchestrator, UpdateSource,
    };
    use crate::utils::errors::{AgentError, Result};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Source whose manifest request never completes
    struct StalledSource;

    impl UpdateSource for StalledSource {
        async fn fetch_manifest(&self) -> Result<Manifest> {
            std::future::pending().await
        }

        async fn download(&self, _manifest: &Manifest, _dest: &Path) -> Result<u64> {
            Err(AgentError::Network("unreachable".into()))
        }
    }

    fn orchestrator(temp: &TempDir) -> Arc<Orchestrator<StalledSource>> {
        Arc::new(Orchestrator::new(
            StalledSource,
            InstallationState::new("1.0.15", temp.path()),
            BackupManager::new(temp.path().join("backups"), vec![]),
            temp.path().join("temp"),
        ))
    }

    async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let temp = TempDir::new().unwrap();
        let router = create_router(AppState::new(orchestrator(&temp).status()));

        let (status, body) = send(router.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["state"], "idle");

        let (status, body) = send(router, "GET", "/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["installed"], "1.0.15");
        assert_eq!(body["running"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_status_before_first_cycle() {
        let temp = TempDir::new().unwrap();
        let router = create_router(AppState::new(orchestrator(&temp).status()));

        let (status, body) = send(router, "GET", "/update/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["busy"], false);
        assert_eq!(body["current_version"], "1.0.15");
        assert!(body["last_outcome"].is_null());
    }

    #[tokio::test]
    async fn test_check_queued_when_idle() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);
        let trigger = orchestrator.trigger();
        let router = create_router(AppState::new(orchestrator.status()));

        let (status, body) = send(router, "POST", "/update/check").await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_rejected_while_cycle_runs() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);
        let router = create_router(AppState::new(orchestrator.status()));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_cycle().await })
        };
        while !orchestrator.status().is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, body) = send(router.clone(), "POST", "/update/check").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["state"], "checking_for_update");

        let (_, body) = send(router, "GET", "/update/status").await;
        assert_eq!(body["busy"], true);

        running.abort();
    }
}
