//! Content hash of a configuration document
//!
//! The hash is the agreement token between the control plane and the data plane:
//! both sides hash the typed document, never the raw file bytes, so formatting and
//! key order in the persisted JSON do not matter.

use super::{ConfigDocument, DocumentError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 digest of a configuration document
///
/// The default value is the empty string, served when no document is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    /// Hash arbitrary bytes
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Get the hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare with a hash reported by another process
    pub fn matches(&self, reported: &str) -> bool {
        self.0 == reported.trim()
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a document over its canonical serialisation
///
/// Canonical means compact `serde_json` output of the typed document: struct fields
/// are emitted in declaration order and unknown keys were already dropped at parse
/// time, so two parses of semantically equal JSON produce the same bytes.
pub fn digest(document: &ConfigDocument) -> Result<ConfigHash, DocumentError> {
    let canonical = serde_json::to_vec(document).map_err(DocumentError::Serialize)?;
    Ok(ConfigHash::of_bytes(&canonical))
}
