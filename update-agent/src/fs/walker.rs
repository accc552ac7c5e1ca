//! Installation tree traversal.
//!
//! Walks an installation root and reports every entry below it (files,
//! directories and symlinks) with its metadata, skipping excluded subtrees.

use super::metadata::{EntryKind, EntryMetadata};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Absolute paths whose whole subtree is skipped
    pub exclude: Vec<PathBuf>,
}

impl WalkOptions {
    pub fn excluding<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        Self {
            exclude: paths.into_iter().collect(),
        }
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    pub metadata: EntryMetadata,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let metadata = EntryMetadata::from_path(&path)?;

        Ok(Self {
            path,
            relative_path,
            metadata,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.kind == EntryKind::Dir
    }
}

/// Walk a directory tree and collect every entry below `root`
///
/// Directories come before their contents. The root itself is not reported.
/// Symlinks are reported as links and never followed.
///
/// # Example
/// ```no_run
/// use update_agent::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let entries = walk_directory(Path::new("/opt/app"), &WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.path(), &options.exclude));

    for entry in walker {
        let entry = entry?;
        entries.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(entries)
}

fn is_excluded(path: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|excluded| path.starts_with(excluded))
}
