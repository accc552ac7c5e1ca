//! Update Agent Library
//!
//! Keeps an installation on the latest published release: polls a manifest,
//! downloads and verifies the package, backs up the installation, applies the
//! package in place and rolls back if anything goes wrong.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod update;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use update::{CycleOutcome, Orchestrator, UpdateState};
pub use utils::errors::{AgentError, Result};
