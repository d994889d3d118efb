use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Storage key derived from a strong content hash.
///
/// Layout: `<prefix>/<h[0..8]>/<h[8..16]>/<h[16..24]>/<h[24..32]>/<hash>`.
/// Identical content always maps to the same key, which doubles as the
/// resumable-upload session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    /// Builds the key for a hex SHA-256 digest.
    pub fn from_hash(prefix: &str, hash: &str) -> Result<Self, TransferError> {
        let hash = hash.trim().to_ascii_lowercase();
        if hash.is_empty() {
            return Err(TransferError::EmptyDigest);
        }
        if hash.len() < 32 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::InvalidPath(format!(
                "content hash must be at least 32 hex characters: {hash}"
            )));
        }

        let prefix = prefix.trim_matches('/');
        let mut key = String::with_capacity(prefix.len() + 36 + hash.len() + 1);
        if !prefix.is_empty() {
            key.push_str(prefix);
            key.push('/');
        }
        for segment in 0..4 {
            key.push_str(&hash[segment * 8..(segment + 1) * 8]);
            key.push('/');
        }
        key.push_str(&hash);
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The full hash (last path segment).
    pub fn hash(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
