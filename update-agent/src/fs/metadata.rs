//! Entry metadata captured in backup snapshots.
//!
//! Only what is needed to reproduce an installation verbatim: the entry kind,
//! size, unix mode bits and symlink targets.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Metadata for one entry of an installation tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub kind: EntryKind,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,

    /// File permissions (Unix mode bits)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    /// Symlink target, stored as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

impl EntryMetadata {
    /// Read metadata without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();

        let (kind, size, link_target) = if file_type.is_symlink() {
            (EntryKind::Symlink, 0, Some(fs::read_link(path)?))
        } else if file_type.is_dir() {
            (EntryKind::Dir, 0, None)
        } else {
            (EntryKind::File, metadata.len(), None)
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let mode = None;

        Ok(Self {
            kind,
            size,
            mode,
            link_target,
        })
    }

    /// Apply the recorded permissions to a path
    #[cfg(unix)]
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if self.kind == EntryKind::Symlink {
            return Ok(());
        }

        if let Some(mode) = self.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_to_path(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// Recreate a symlink at `path` pointing at `target`
#[cfg(unix)]
pub fn create_symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
pub fn create_symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}
