use std::fmt;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Hex-encoded SHA-256 digest of an item's content.
///
/// Absent content has no hash; callers model it as `Option<ContentHash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.len() != 64 || !trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(anyhow!(
                "content hash must be 64 hex characters (sha256), got '{value}'"
            ));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(layerpatch_security::sha256_hex(bytes))
    }

    /// Hashes whatever currently exists at `path`; `None` when nothing does.
    pub fn of_path(path: &Path) -> io::Result<Option<Self>> {
        Ok(layerpatch_security::hash_path(path)?.map(Self))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}
