//! Handing over to the newly installed version.
//!
//! `exec` replaces the process image with the installed executable, keeping
//! the pid and arguments. `exit` leaves with a dedicated code so a service
//! supervisor starts the new version.

use crate::config::{RestartConfig, RestartMode};
use crate::utils::errors::AgentError;
use std::convert::Infallible;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// What the agent does once an update is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPlan {
    Exec { program: PathBuf, args: Vec<OsString> },
    Exit { code: i32 },
}

impl RestartPlan {
    pub fn from_config(config: &RestartConfig) -> Result<Self, AgentError> {
        match config.mode {
            RestartMode::Exit => Ok(Self::Exit {
                code: config.exit_code,
            }),
            RestartMode::Exec => {
                let exe = std::env::current_exe()
                    .map_err(|e| AgentError::file_system("failed to get current executable", e))?;
                Ok(Self::Exec {
                    program: installed_path(&exe),
                    args: std::env::args_os().skip(1).collect(),
                })
            }
        }
    }

    /// Run the plan. Only returns if the handover could not happen.
    pub fn execute(self) -> Result<Infallible, AgentError> {
        match self {
            Self::Exit { code } => {
                info!(code, "Exiting for supervisor restart");
                std::process::exit(code)
            }
            Self::Exec { program, args } => exec(&program, &args),
        }
    }
}

/// Path of the replaced executable.
///
/// On Linux a replaced running binary reports its old inode as
/// `<path> (deleted)`; the new file lives at `<path>`.
pub fn installed_path(exe: &Path) -> PathBuf {
    let raw = exe.to_string_lossy();
    match raw.strip_suffix(" (deleted)") {
        Some(fixed) if cfg!(target_os = "linux") => {
            info!("Adjusted exe path from deleted inode: {}", fixed);
            PathBuf::from(fixed)
        }
        _ => exe.to_path_buf(),
    }
}

#[cfg(unix)]
fn exec(program: &Path, args: &[OsString]) -> Result<Infallible, AgentError> {
    use std::os::unix::process::CommandExt;

    info!("Restarting from: {}", program.display());
    let error = std::process::Command::new(program).args(args).exec();
    Err(AgentError::file_system(
        format!("failed to exec {}", program.display()),
        error,
    ))
}

#[cfg(not(unix))]
fn exec(program: &Path, args: &[OsString]) -> Result<Infallible, AgentError> {
    info!("Restarting from: {}", program.display());
    std::process::Command::new(program)
        .args(args)
        .spawn()
        .map_err(|e| AgentError::file_system(format!("failed to start {}", program.display()), e))?;
    std::process::exit(0)
}
