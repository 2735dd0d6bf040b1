//! ContentHash: BLAKE3 truncated to 128 bits (32 hex chars).
//!
//! Tiles are addressed by their content so identical tiles share one object
//! on disk. The same hash doubles as the HTTP entity tag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A content hash - 128 bits (16 bytes, 32 hex chars) of BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hash length: expected 32 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in hash")]
    InvalidHex,
}

impl ContentHash {
    /// Hash tile bytes.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    /// Parse a stored reference, validating its format.
    pub fn from_str_checked(s: &str) -> Result<Self, HashError> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    /// Shard directory (first two hex chars).
    pub fn prefix(&self) -> &str {
        &self.0[0..2]
    }

    /// File name inside the shard directory.
    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted strong entity tag, e.g. `"5c73..."`.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_shape() {
        let hash = ContentHash::from_data(b"tile bytes");
        assert_eq!(hash.as_str().len(), 32);
        assert_eq!(hash.prefix().len(), 2);
        assert_eq!(format!("{}{}", hash.prefix(), hash.remainder()), hash.as_str());
    }

    #[test]
    fn test_identical_tiles_share_a_hash() {
        let blank = vec![255u8; 64];
        assert_eq!(ContentHash::from_data(&blank), ContentHash::from_data(&blank));
        assert_ne!(ContentHash::from_data(&blank), ContentHash::from_data(&blank[..63]));
    }

    #[test]
    fn test_parse_tolerates_trailing_newline() {
        let hash = ContentHash::from_data(b"ref file");
        let parsed: ContentHash = format!("{}\n", hash).parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "abc".parse::<ContentHash>(),
            Err(HashError::InvalidLength(3))
        ));
        assert!(matches!(
            "g".repeat(32).parse::<ContentHash>(),
            Err(HashError::InvalidHex)
        ));
    }

    #[test]
    fn test_etag_is_quoted() {
        let hash = ContentHash::from_data(b"etag");
        let etag = hash.etag();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 34);
    }
}
