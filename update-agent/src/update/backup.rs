//! Single-slot installation snapshots.
//!
//! A snapshot is a full copy of the installation root in `<backup_dir>/current`
//! plus a record `<backup_dir>/snapshot.json` listing every entry. The record
//! is written last: a slot without a record is incomplete and is never
//! restored. Each new backup overwrites the previous slot.

use crate::fs::metadata::{create_symlink, EntryKind, EntryMetadata};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::fs::{relative_key, write_replacing};
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SLOT_DIR: &str = "current";
const STAGING_DIR: &str = "staging";
const RECORD_FILE: &str = "snapshot.json";

/// Record of a complete backup slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Version that was installed when the snapshot was taken
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// Installation root the snapshot restores onto
    pub root: PathBuf,
    pub slot: PathBuf,
    pub entries: BTreeMap<String, EntryMetadata>,
    pub total_bytes: u64,
}

impl BackupSnapshot {
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.kind == EntryKind::File)
            .count()
    }
}

/// Creates and restores the backup slot.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
    exclude: Vec<PathBuf>,
}

impl BackupManager {
    /// `exclude` lists agent-owned directories that may live inside the root.
    pub fn new(backup_dir: impl Into<PathBuf>, exclude: Vec<PathBuf>) -> Self {
        let backup_dir = backup_dir.into();

        let mut all = Vec::new();
        for path in std::iter::once(backup_dir.clone()).chain(exclude) {
            if let Ok(canonical) = path.canonicalize() {
                if canonical != path {
                    all.push(canonical);
                }
            }
            all.push(path);
        }

        Self {
            backup_dir,
            exclude: all,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn slot_path(&self) -> PathBuf {
        self.backup_dir.join(SLOT_DIR)
    }

    fn staging_path(&self) -> PathBuf {
        self.backup_dir.join(STAGING_DIR)
    }

    fn record_path(&self) -> PathBuf {
        self.backup_dir.join(RECORD_FILE)
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions::excluding(self.exclude.iter().cloned())
    }

    /// Copy the whole installation root into the backup slot.
    pub fn create_backup(&self, root: &Path, version: &str) -> Result<BackupSnapshot> {
        let backup_err = |context: &str, e: std::io::Error| AgentError::Backup(format!("{context}: {e}"));

        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| backup_err("failed to create backup directory", e))?;

        let staging = self.staging_path();
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| backup_err("failed to clear stale staging directory", e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| backup_err("failed to create staging directory", e))?;

        let tree = walk_directory(root, &self.walk_options())
            .map_err(|e| backup_err("failed to scan installation root", e))?;

        let mut entries = BTreeMap::new();
        let mut total_bytes = 0u64;

        for info in &tree {
            let dest = staging.join(&info.relative_path);
            copy_entry(&info.path, &dest, &info.metadata).map_err(|e| {
                backup_err(&format!("failed to copy {}", info.relative_path.display()), e)
            })?;

            total_bytes += info.metadata.size;
            entries.insert(relative_key(&info.relative_path), info.metadata.clone());
        }

        // Directory modes last, so read-only directories can still be filled
        for info in tree.iter().filter(|info| info.is_dir()) {
            info.metadata
                .apply_to_path(&staging.join(&info.relative_path))
                .map_err(|e| backup_err("failed to set directory permissions", e))?;
        }

        // Swap the slot: drop the old record first so a half-swapped slot is never trusted
        let record = self.record_path();
        if record.exists() {
            fs::remove_file(&record).map_err(|e| backup_err("failed to remove previous record", e))?;
        }
        let slot = self.slot_path();
        if slot.exists() {
            debug!("Overwriting previous backup slot at {}", slot.display());
            fs::remove_dir_all(&slot).map_err(|e| backup_err("failed to remove previous slot", e))?;
        }
        fs::rename(&staging, &slot).map_err(|e| backup_err("failed to move staging into slot", e))?;

        let snapshot = BackupSnapshot {
            version: version.to_string(),
            created_at: Utc::now(),
            root: root.to_path_buf(),
            slot,
            entries,
            total_bytes,
        };

        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| AgentError::Backup(format!("failed to encode snapshot record: {e}")))?;
        write_replacing(&record, |file| {
            use std::io::Write;
            file.write_all(&body)?;
            Ok(body.len() as u64)
        })
        .map_err(|e| backup_err("failed to write snapshot record", e))?;

        info!(
            version = %snapshot.version,
            files = snapshot.file_count(),
            bytes = snapshot.total_bytes,
            "Backup created at {}",
            snapshot.slot.display()
        );

        Ok(snapshot)
    }

    /// Load the record of the current slot, if a complete one exists.
    pub fn latest(&self) -> Result<Option<BackupSnapshot>> {
        let record = self.record_path();
        if !record.exists() {
            return Ok(None);
        }

        let body = fs::read(&record)
            .map_err(|e| AgentError::Backup(format!("failed to read snapshot record: {e}")))?;
        let snapshot = serde_json::from_slice(&body)
            .map_err(|e| AgentError::Backup(format!("corrupt snapshot record: {e}")))?;

        Ok(Some(snapshot))
    }

    /// Make the installation root identical to `snapshot`.
    ///
    /// The slot is checked against the record before the root is touched.
    /// Every failure is a `Restore` error, which is not retried.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let restore_err = |context: &str, e: std::io::Error| AgentError::Restore(format!("{context}: {e}"));

        self.check_slot(snapshot)?;

        let root = &snapshot.root;
        let current = walk_directory(root, &self.walk_options())
            .map_err(|e| restore_err("failed to scan installation root", e))?;

        // Deepest first, so children go before their directories
        for info in current.iter().rev() {
            let key = relative_key(&info.relative_path);
            let keep = snapshot
                .entries
                .get(&key)
                .is_some_and(|expected| expected.kind == info.metadata.kind);
            if keep || fs::symlink_metadata(&info.path).is_err() {
                continue;
            }

            debug!("Removing {} (not in snapshot)", key);
            let removed = if info.is_dir() {
                fs::remove_dir_all(&info.path)
            } else {
                fs::remove_file(&info.path)
            };
            removed.map_err(|e| restore_err(&format!("failed to remove {key}"), e))?;
        }

        for (key, entry) in &snapshot.entries {
            let source = snapshot.slot.join(key);
            let dest = root.join(key);

            if entry.kind == EntryKind::Symlink && fs::symlink_metadata(&dest).is_ok() {
                fs::remove_file(&dest)
                    .map_err(|e| restore_err(&format!("failed to replace link {key}"), e))?;
            }

            copy_entry(&source, &dest, entry)
                .map_err(|e| restore_err(&format!("failed to restore {key}"), e))?;
        }

        for (key, entry) in snapshot.entries.iter().filter(|(_, e)| e.kind == EntryKind::Dir) {
            entry
                .apply_to_path(&root.join(key))
                .map_err(|e| restore_err(&format!("failed to restore permissions of {key}"), e))?;
        }

        info!(
            version = %snapshot.version,
            files = snapshot.file_count(),
            "Installation restored from backup"
        );

        Ok(())
    }

    fn check_slot(&self, snapshot: &BackupSnapshot) -> Result<()> {
        if !snapshot.slot.is_dir() {
            return Err(AgentError::Restore(format!(
                "backup slot {} is missing",
                snapshot.slot.display()
            )));
        }

        for (key, entry) in &snapshot.entries {
            let path = snapshot.slot.join(key);
            let found = EntryMetadata::from_path(&path)
                .map_err(|e| AgentError::Restore(format!("backup entry {key} unreadable: {e}")))?;

            if found.kind != entry.kind || (entry.kind == EntryKind::File && found.size != entry.size) {
                return Err(AgentError::Restore(format!(
                    "backup entry {key} does not match its record"
                )));
            }
        }

        if snapshot.root.exists() {
            Ok(())
        } else {
            warn!("Installation root {} is gone, recreating it", snapshot.root.display());
            fs::create_dir_all(&snapshot.root)
                .map_err(|e| AgentError::Restore(format!("failed to recreate installation root: {e}")))
        }
    }
}

fn copy_entry(source: &Path, dest: &Path, metadata: &EntryMetadata) -> std::io::Result<()> {
    match metadata.kind {
        EntryKind::Dir => fs::create_dir_all(dest),
        EntryKind::Symlink => {
            let target = match &metadata.link_target {
                Some(target) => target.clone(),
                None => fs::read_link(source)?,
            };
            create_symlink(&target, dest)
        }
        EntryKind::File => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            write_replacing(dest, |file| {
                let mut reader = fs::File::open(source)?;
                std::io::copy(&mut reader, file)
            })?;
            metadata.apply_to_path(dest)
        }
    }
}
