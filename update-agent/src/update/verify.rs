//! Artifact integrity verification.

use crate::utils::errors::{AgentError, Result};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check the whole artifact against the manifest checksum.
///
/// The comparison is case-insensitive. Nothing about the artifact may be
/// interpreted before this returns `Ok`.
pub fn verify(artifact: &[u8], expected_checksum: &str) -> Result<()> {
    let expected = expected_checksum.trim();
    let actual = sha256_hex(artifact);

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(AgentError::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}
