//! Custom error types for the update agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("File system error: {context}: {source}")]
    FileSystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

impl AgentError {
    pub fn file_system(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileSystem {
            context: context.into(),
            source,
        }
    }

    /// Only a failed restore leaves the installation in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Restore(_))
    }

    /// Network-class failures are retried on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }

    /// Short, stable name used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Network(_) | Self::Http(_) => "network",
            Self::Serialization(_) => "serialization",
            Self::ManifestParse(_) => "manifest_parse",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Backup(_) => "backup",
            Self::Extraction(_) => "extraction",
            Self::FileSystem { .. } => "file_system",
            Self::Restore(_) => "restore",
            Self::Daemon(_) => "daemon",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
