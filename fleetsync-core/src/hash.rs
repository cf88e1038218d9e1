//! Content hashing over canonical encodings.
//!
//! A [`ContentHash`] is SHA-256 over a scheme tag followed by the canonical
//! JSON form of a value: object keys sorted, no insignificant whitespace.
//! Two differently-typed mirrors of the same logical spec hash equal as long
//! as they serialize to the same JSON document.
//!
//! Collisions are not defended against; equal hashes are treated as equal
//! values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HashError;

/// Bumped whenever the canonical encoding changes, so fingerprints from an
/// older scheme never compare equal to new ones.
pub const HASH_SCHEME: &str = "fleetsync.content-hash.v1";

/// Lowercase hex SHA-256 fingerprint of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines and tables.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

/// Strict parse for hashes coming from outside, e.g. a status report.
impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::Malformed(s.to_owned()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Canonical byte encoding of `value`.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    // Going through `Value` sorts object keys regardless of field or map order.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Hash `value` under the current [`HASH_SCHEME`].
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, HashError> {
    let bytes = canonical_bytes(value)?;
    let mut h = Sha256::new();
    h.update(HASH_SCHEME.as_bytes());
    h.update([0u8]);
    h.update(&bytes);
    Ok(ContentHash(hex::encode(h.finalize())))
}
