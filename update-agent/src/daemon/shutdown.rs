//! Shutdown on SIGTERM and SIGINT.
//!
//! A signal cancels the shared token. The poller only looks at the token
//! between cycles, so an update in progress finishes (or rolls back) first.
//! Handlers are registered before [`ShutdownCoordinator::listen`] returns, so
//! from then on a signal can no longer kill the process mid-update.

use crate::utils::errors::AgentError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Turns process signals into a cancelled token
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token every long-running task watches
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been requested
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register SIGINT and SIGTERM handlers and cancel the token on the first signal.
    ///
    /// The returned task also ends when the token is cancelled some other way.
    #[cfg(unix)]
    pub fn listen(&self) -> Result<JoinHandle<()>, AgentError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|e| AgentError::Daemon(format!("failed to install SIGINT handler: {e}")))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| AgentError::Daemon(format!("failed to install SIGTERM handler: {e}")))?;
        let token = self.token.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                }
                _ = token.cancelled() => return,
            }
            token.cancel();
        }))
    }

    #[cfg(not(unix))]
    pub fn listen(&self) -> Result<JoinHandle<()>, AgentError> {
        let mut ctrl_c = tokio::signal::windows::ctrl_c()
            .map_err(|e| AgentError::Daemon(format!("failed to install Ctrl+C handler: {e}")))?;
        let token = self.token.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = ctrl_c.recv() => {
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                }
                _ = token.cancelled() => return,
            }
            token.cancel();
        }))
    }
}
