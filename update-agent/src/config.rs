//! Configuration management for the update agent.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides (`UPDATE_AGENT__SECTION__KEY`). Every field has a default.

use crate::utils::errors::AgentError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "UPDATE_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub update: UpdateConfig,
    pub install: InstallConfig,
    pub restart: RestartConfig,
    pub log: LogConfig,
    pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Status API port (0 disables the API)
    pub port: u16,

    /// Working directory for agent state
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Base URL of the update server
    pub base_url: String,

    /// Path of the manifest endpoint, relative to `base_url`
    pub manifest_path: String,

    /// Path of the artifact endpoint, used when the manifest has no download URL
    pub download_path: String,

    /// Seconds between update checks
    pub poll_interval_secs: u64,

    /// Total timeout for a single HTTP request
    pub timeout_secs: u64,

    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Live installation directory (defaults to the running executable's directory)
    pub root: Option<PathBuf>,

    /// Backup slot directory (defaults to `<data_dir>/backups`)
    pub backup_dir: Option<PathBuf>,

    /// Download staging directory (defaults to `<data_dir>/temp`)
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Replace the current process image with the updated executable
    Exec,
    /// Exit with `exit_code` and let the supervisor start the new version
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub mode: RestartMode,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Seconds between heartbeat lines of the demo workload
    pub heartbeat_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 9991,
            data_dir: PathBuf::from("/var/lib/update-agent"),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            manifest_path: "/api/version".to_string(),
            download_path: "/api/download".to_string(),
            poll_interval_secs: 300,
            timeout_secs: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            mode: RestartMode::Exec,
            // EX_TEMPFAIL
            exit_code: 75,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 5 }
    }
}

impl UpdateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Absolute URL of the manifest endpoint
    pub fn manifest_url(&self) -> String {
        join_url(&self.base_url, &self.manifest_path)
    }

    /// Absolute URL of the default artifact endpoint
    pub fn download_url(&self) -> String {
        join_url(&self.base_url, &self.download_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, AgentError> {
        toml::to_string_pretty(self).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Directory holding the live application files
    pub fn install_root(&self) -> Result<PathBuf, AgentError> {
        if let Some(root) = &self.install.root {
            return Ok(root.clone());
        }

        let exe = std::env::current_exe()?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| AgentError::Config("executable has no parent directory".to_string()))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.install
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.agent.data_dir.join("backups"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.install
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.agent.data_dir.join("temp"))
    }

    /// File recording the installed version across restarts
    pub fn state_file(&self) -> PathBuf {
        self.agent.data_dir.join("installed-version.json")
    }
}
