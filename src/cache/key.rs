//! Cache keys for worker results.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::compositor::protocol::CommandType;

/// Composite key: source identity, logical offset, and command type.
///
/// `fingerprint` covers the remaining request parameters so that requests
/// differing only in flags do not share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source: String,
    offset_micros: Option<i64>,
    command: CommandType,
    fingerprint: String,
}

impl CacheKey {
    pub fn new(
        source: impl Into<String>,
        offset_micros: Option<i64>,
        command: CommandType,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            offset_micros,
            command,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Logical offset (e.g. frame timestamp) in microseconds.
    pub fn offset_micros(&self) -> Option<i64> {
        self.offset_micros
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Short content hash of a serializable value, for use in cache keys.
///
/// The value is serialized to JSON and hashed with SHA-256; the first 16
/// bytes are returned as 32 lowercase hex characters.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&json);
    Ok(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
}
