//! Demo workload that stands in for the supervised application.
//!
//! It reads the installed version under the read half of the install guard,
//! so a heartbeat never lands in the middle of a backup, apply or rollback.

use crate::update::{InstallGuard, StatusHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Emit a heartbeat every `every` until cancelled. Returns the number of beats.
pub async fn run_heartbeat(
    status: StatusHandle,
    guard: InstallGuard,
    every: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut interval = tokio::time::interval(every);
    let mut beats = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let _files = guard.read().await;
                beats += 1;
                let installation = status.installation().await;
                tracing::info!(
                    beat = beats,
                    version = %installation.current_version,
                    state = %status.state(),
                    "Heartbeat"
                );
            }
        }
    }

    tracing::info!(beats, "Workload stopped");
    beats
}
