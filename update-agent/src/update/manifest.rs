//! Release manifest and version comparison.
//!
//! The manifest is what the update server reports as the latest available
//! release. It is immutable once fetched: a cycle commits to the manifest it
//! read first and never re-reads it.

use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Latest-release record served by the manifest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,

    /// Hex-encoded SHA-256 of the artifact
    pub checksum: String,

    /// Explicit artifact location; the configured download endpoint is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// Advertised artifact size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl Manifest {
    /// Parse and validate a manifest body
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(body)
            .map_err(|e| AgentError::ManifestParse(format!("invalid manifest body: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// A manifest is only usable with a well-formed version and a hex checksum.
    pub fn validate(&self) -> Result<()> {
        parse_version(&self.version)?;

        let checksum = self.checksum.trim();
        if checksum.is_empty() {
            return Err(AgentError::ManifestParse("manifest checksum is empty".to_string()));
        }
        if !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AgentError::ManifestParse(format!(
                "manifest checksum is not hex: {checksum}"
            )));
        }

        Ok(())
    }
}

/// Parse a `major.minor.patch` version, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed)
        .map_err(|e| AgentError::ManifestParse(format!("invalid version '{raw}': {e}")))
}

/// Whether `candidate` is strictly newer than `current`.
///
/// Ordering is semantic, so `1.0.10` is newer than `1.0.9`. Equal versions are
/// not newer. A malformed version on either side is a `ManifestParse` error.
pub fn is_newer(candidate: &str, current: &str) -> Result<bool> {
    Ok(parse_version(candidate)? > parse_version(current)?)
}
