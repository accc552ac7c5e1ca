//! File system helpers for snapshotting and replacing installation trees.

pub mod metadata;
pub mod walker;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path};

/// Write `target` through a sibling temp file and rename it into place.
///
/// Renaming over a running executable succeeds where truncating it would not.
/// The temp file is removed when writing or renaming fails.
pub fn write_replacing<F>(target: &Path, write: F) -> io::Result<u64>
where
    F: FnOnce(&mut File) -> io::Result<u64>,
{
    let file_name = target
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
    let tmp = target.with_file_name(format!(".{}.update-tmp", file_name.to_string_lossy()));

    let result: io::Result<u64> = (|| {
        let mut file = File::create(&tmp)?;
        let written = write(&mut file)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, target)?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    result
}

/// Slash-separated key for a relative path, stable across platforms
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
