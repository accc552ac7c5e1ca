//! Extraction of a verified update package over the installation root.
//!
//! The archive is a zip rooted at the installation root. All entry names are
//! checked before the first write, so an archive that would escape the root is
//! rejected whole and never partially applied.

use crate::fs::write_replacing;
use crate::utils::errors::{AgentError, Result};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// What an apply wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

/// Extract `artifact` over `root`, replacing files in place.
///
/// Structural problems with the archive are `Extraction` errors; I/O failures
/// while writing are `FileSystem` errors. Either one means the root may be
/// partially written and must be rolled back by the caller.
pub fn apply(artifact: &[u8], root: &Path) -> Result<ApplySummary> {
    let mut archive = zip::ZipArchive::new(Cursor::new(artifact))
        .map_err(|e| AgentError::Extraction(format!("failed to read archive: {e}")))?;

    let plan = plan_entries(&mut archive)?;
    check_destinations(root, &plan)?;
    debug!("Archive passed path checks ({} entries)", plan.len());

    let mut summary = ApplySummary::default();

    for planned in &plan {
        let dest = root.join(&planned.relative);

        if planned.is_dir {
            fs::create_dir_all(&dest).map_err(|e| {
                AgentError::file_system(format!("failed to create {}", planned.relative.display()), e)
            })?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AgentError::file_system(format!("failed to create {}", parent.display()), e)
            })?;
        }

        let mut entry = archive.by_index(planned.index).map_err(|e| {
            AgentError::Extraction(format!("failed to open {}: {e}", planned.relative.display()))
        })?;

        let written = write_replacing(&dest, |file| std::io::copy(&mut entry, file)).map_err(|e| {
            let context = format!("failed to write {}", planned.relative.display());
            if e.kind() == std::io::ErrorKind::InvalidData {
                AgentError::Extraction(format!("{context}: {e}"))
            } else {
                AgentError::file_system(context, e)
            }
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = planned.mode {
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777)).map_err(
                    |e| {
                        AgentError::file_system(
                            format!("failed to set permissions on {}", planned.relative.display()),
                            e,
                        )
                    },
                )?;
            }
        }

        summary.files += 1;
        summary.bytes += written;
    }

    info!(
        files = summary.files,
        directories = summary.directories,
        bytes = summary.bytes,
        "Package extracted into {}",
        root.display()
    );

    Ok(summary)
}

fn plan_entries(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> Result<Vec<PlannedEntry>> {
    let mut plan = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| AgentError::Extraction(format!("failed to read entry {index}: {e}")))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(AgentError::Extraction(format!(
                "entry '{}' escapes the installation root",
                entry.name()
            )));
        };

        let mode = entry.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            return Err(AgentError::Extraction(format!(
                "entry '{}' is a symlink, which packages may not contain",
                entry.name()
            )));
        }

        if relative.as_os_str().is_empty() {
            continue;
        }

        plan.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
            mode,
        });
    }

    Ok(plan)
}

/// Reject the archive if any existing directory on a destination path is a symlink.
///
/// Writes below a linked directory would land wherever the link points, and a
/// rollback walks the root without following links, so it could not undo them.
fn check_destinations(root: &Path, plan: &[PlannedEntry]) -> Result<()> {
    for planned in plan {
        let mut components: Vec<_> = planned.relative.components().collect();
        if !planned.is_dir {
            // The file itself is renamed into place, which replaces a link instead of following it
            components.pop();
        }

        let mut dest = root.to_path_buf();
        for component in components {
            dest.push(component);
            match fs::symlink_metadata(&dest) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(AgentError::Extraction(format!(
                        "entry '{}' would be written through symlink {}",
                        planned.relative.display(),
                        dest.display()
                    )));
                }
                Ok(_) => {}
                // Nothing below a missing component exists yet
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(AgentError::file_system(
                        format!("failed to inspect {}", dest.display()),
                        e,
                    ))
                }
            }
        }
    }

    Ok(())
}
