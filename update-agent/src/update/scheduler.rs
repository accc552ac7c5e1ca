//! Periodic update polling.

use super::orchestrator::{CycleOutcome, Orchestrator};
use super::source::UpdateSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Why the poller stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerExit {
    /// Shutdown was requested between cycles
    Shutdown,
    /// A new version is installed and the process must restart
    Restart { from: String, to: String },
    /// Rollback failed; no further cycles run
    Failed { target: String, error: String },
}

/// Runs a cycle at a fixed interval and whenever a check is requested.
///
/// Shutdown is only observed between cycles, so a running cycle always
/// reaches a defined end state before the poller returns.
pub async fn run_poller<S: UpdateSource>(
    orchestrator: Arc<Orchestrator<S>>,
    every: Duration,
    cancel: CancellationToken,
) -> PollerExit {
    let trigger = orchestrator.trigger();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_secs = every.as_secs(), "Update poller started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Update poller stopped");
                return PollerExit::Shutdown;
            }
            _ = trigger.notified() => {
                tracing::info!("Update check requested");
            }
            _ = interval.tick() => {}
        }

        match orchestrator.run_cycle().await {
            CycleOutcome::RestartPending { from, to } => return PollerExit::Restart { from, to },
            CycleOutcome::Failed { target, error } => {
                return PollerExit::Failed {
                    target,
                    error: error.to_string(),
                }
            }
            CycleOutcome::Halted { state } => {
                return PollerExit::Failed {
                    target: "unknown".to_string(),
                    error: format!("agent halted in state {state}"),
                }
            }
            _ => interval.reset(),
        }
    }
}
