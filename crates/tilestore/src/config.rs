//! Tile store configuration.
//!
//! Default path: `~/.threadtiles/tiles`. The server passes the directory
//! resolved from its own config instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileStoreConfig {
    /// Objects in `{base_path}/objects/`, sidecars in `{base_path}/metadata/`,
    /// per-session references in `{base_path}/sessions/`.
    pub base_path: PathBuf,

    /// Refuse all writes. A viewer-only deployment can serve an existing
    /// tile directory this way.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            base_path: default_tile_path(),
            read_only: false,
        }
    }
}

fn default_tile_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".threadtiles").join("tiles"))
        .unwrap_or_else(|| PathBuf::from(".threadtiles/tiles"))
}

impl TileStoreConfig {
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: false,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: true,
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.base_path.join("metadata")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base_path.join("sessions")
    }
}
