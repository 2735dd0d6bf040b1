//! Tile addressing and session key validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Position of one tile inside a pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileAddress {
    pub level: u32,
    pub row: u32,
    pub col: u32,
}

impl TileAddress {
    pub fn new(level: u32, row: u32, col: u32) -> Self {
        Self { level, row, col }
    }

    /// Reference file name, `{col}_{row}`, matching the public URL scheme.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.col, self.row)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.level, self.col, self.row)
    }
}

/// Errors a store reports that callers may want to match on.
///
/// Returned inside `anyhow::Error`; use `downcast_ref` to inspect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileStoreError {
    #[error("tile store is in read-only mode")]
    ReadOnly,

    #[error("invalid session key: {0:?}")]
    InvalidSessionKey(String),
}

/// Session keys become directory names, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_session_key(key: &str) -> Result<(), TileStoreError> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(TileStoreError::InvalidSessionKey(key.to_string()))
    }
}
