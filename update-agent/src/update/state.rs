//! Orchestrator states, the installation record and the installation guard.

use crate::fs::write_replacing;
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// States of one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    CheckingForUpdate,
    Downloading,
    Verifying,
    BackingUp,
    Applying,
    RollingBack,
    RestartPending,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingForUpdate => "checking_for_update",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::BackingUp => "backing_up",
            Self::Applying => "applying",
            Self::RollingBack => "rolling_back",
            Self::RestartPending => "restart_pending",
            Self::Failed => "failed",
        }
    }

    /// States that may write to the installation root
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::BackingUp | Self::Applying | Self::RollingBack)
    }

    /// States no cycle leaves in this process
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RestartPending | Self::Failed)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The running installation: what version is live and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationState {
    pub current_version: String,
    pub root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionRecord {
    version: String,
    updated_at: DateTime<Utc>,
}

impl InstallationState {
    pub fn new(current_version: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            current_version: current_version.into(),
            root: root.into(),
        }
    }

    /// Installed version from the state file, or `fallback` when there is none
    pub fn load(state_file: &Path, root: PathBuf, fallback: &str) -> Result<Self> {
        if !state_file.exists() {
            return Ok(Self::new(fallback, root));
        }

        let body = std::fs::read(state_file)?;
        let record: VersionRecord = serde_json::from_slice(&body)?;
        Ok(Self::new(record.version, root))
    }

    /// Record the installed version so the next process starts from it
    pub fn persist(&self, state_file: &Path) -> Result<()> {
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let record = VersionRecord {
            version: self.current_version.clone(),
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&record)?;

        write_replacing(state_file, |file| {
            use std::io::Write;
            file.write_all(&body)?;
            Ok(body.len() as u64)
        })
        .map_err(|e| AgentError::file_system("failed to write installed version", e))?;

        Ok(())
    }
}

/// Guard over the installation root.
///
/// The orchestrator holds the write half while backing up, applying and
/// rolling back. Application code takes the read half around any access to
/// installed files, so it never observes a half-written tree.
#[derive(Debug, Clone, Default)]
pub struct InstallGuard {
    lock: Arc<RwLock<()>>,
}

impl InstallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Whether the critical section is currently held
    pub fn is_locked(&self) -> bool {
        self.lock.try_read().is_err()
    }
}
