//! Self-update: manifest check, download, verification, backup, apply and rollback.

pub mod apply;
pub mod backup;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod verify;

pub use backup::{BackupManager, BackupSnapshot};
pub use manifest::Manifest;
pub use orchestrator::{CycleOutcome, Orchestrator, OutcomeSummary, StatusHandle};
pub use scheduler::{run_poller, PollerExit};
pub use source::{HttpUpdateSource, UpdateSource};
pub use state::{InstallGuard, InstallationState, UpdateState};
