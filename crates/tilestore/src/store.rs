//! FileTileStore: filesystem tile storage with content-addressed objects.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   └── ab/
//! │       └── cde123...            # encoded tile bytes
//! ├── metadata/
//! │   └── ab/
//! │       └── cde123....json       # {mime_type, size}
//! └── sessions/
//!     └── {session}/
//!         ├── tiles/
//!         │   └── {level}/
//!         │       └── {col}_{row}  # content hash of the tile
//!         └── manifest.json        # written last
//! ```
//!
//! Objects are never deleted by `remove_session`: another session may share
//! them, and an orphaned object costs only disk space.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::address::{validate_session_key, TileAddress, TileStoreError};
use crate::config::TileStoreConfig;
use crate::hash::ContentHash;
use crate::metadata::{StoredTile, TileMetadata};

const MANIFEST_FILE: &str = "manifest.json";
const FALLBACK_MIME: &str = "application/octet-stream";

/// Storage backend for built pyramids.
///
/// Writers put every tile of a session and then its manifest. Readers treat
/// a session without a manifest as absent.
pub trait TileStore: Send + Sync {
    /// Store one encoded tile, returning its content hash.
    fn put_tile(
        &self,
        session: &str,
        addr: TileAddress,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ContentHash>;

    /// Read a tile. `Ok(None)` if the session or tile is unknown.
    fn get_tile(&self, session: &str, addr: TileAddress) -> Result<Option<StoredTile>>;

    /// Store the session manifest. This commits the session.
    fn put_manifest(&self, session: &str, manifest_json: &[u8]) -> Result<()>;

    fn get_manifest(&self, session: &str) -> Result<Option<Vec<u8>>>;

    /// True once a manifest has been committed for the session.
    fn contains_session(&self, session: &str) -> bool;

    /// Drop every tile reference and the manifest of a session.
    fn remove_session(&self, session: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileTileStore {
    config: TileStoreConfig,
}

impl FileTileStore {
    /// Creates the layout directories unless read-only.
    pub fn new(config: TileStoreConfig) -> Result<Self> {
        if !config.read_only {
            fs::create_dir_all(config.objects_dir())
                .context("failed to create tile objects directory")?;
            fs::create_dir_all(config.metadata_dir())
                .context("failed to create tile metadata directory")?;
            fs::create_dir_all(config.sessions_dir())
                .context("failed to create tile sessions directory")?;
        }

        Ok(Self { config })
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(TileStoreConfig::with_base_path(path))
    }

    pub fn read_only_at(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(TileStoreConfig::read_only(path))
    }

    pub fn config(&self) -> &TileStoreConfig {
        &self.config
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.config
            .objects_dir()
            .join(hash.prefix())
            .join(hash.remainder())
    }

    fn metadata_path(&self, hash: &ContentHash) -> PathBuf {
        self.config
            .metadata_dir()
            .join(hash.prefix())
            .join(format!("{}.json", hash.remainder()))
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.config.sessions_dir().join(session)
    }

    fn tile_ref_path(&self, session: &str, addr: TileAddress) -> PathBuf {
        self.session_dir(session)
            .join("tiles")
            .join(addr.level.to_string())
            .join(addr.file_stem())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(TileStoreError::ReadOnly.into());
        }
        Ok(())
    }

    fn read_mime_type(&self, hash: &ContentHash) -> Result<String> {
        let meta_path = self.metadata_path(hash);
        if !meta_path.exists() {
            return Ok(FALLBACK_MIME.to_string());
        }
        let json = fs::read_to_string(&meta_path).context("failed to read tile metadata")?;
        let meta: TileMetadata =
            serde_json::from_str(&json).context("failed to parse tile metadata")?;
        Ok(meta.mime_type)
    }
}

/// Write via a uniquely named temp file and rename, so concurrent readers
/// never observe a partially written file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to rename into {}", path.display()));
    }
    Ok(())
}

impl TileStore for FileTileStore {
    fn put_tile(
        &self,
        session: &str,
        addr: TileAddress,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ContentHash> {
        self.ensure_writable()?;
        validate_session_key(session)?;

        let hash = ContentHash::from_data(bytes);

        // Content-addressed, so an existing object is already correct
        let obj_path = self.object_path(&hash);
        if !obj_path.exists() {
            write_atomic(&obj_path, bytes).context("failed to write tile object")?;
        }

        let meta_path = self.metadata_path(&hash);
        if !meta_path.exists() {
            let meta = TileMetadata {
                mime_type: mime_type.to_string(),
                size: bytes.len() as u64,
            };
            let json = serde_json::to_vec(&meta).context("failed to serialize tile metadata")?;
            write_atomic(&meta_path, &json).context("failed to write tile metadata")?;
        }

        write_atomic(&self.tile_ref_path(session, addr), hash.as_str().as_bytes())
            .context("failed to write tile reference")?;

        Ok(hash)
    }

    fn get_tile(&self, session: &str, addr: TileAddress) -> Result<Option<StoredTile>> {
        validate_session_key(session)?;

        let ref_path = self.tile_ref_path(session, addr);
        if !ref_path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&ref_path).context("failed to read tile reference")?;
        let hash: ContentHash = raw
            .parse()
            .with_context(|| format!("corrupt tile reference: {}", ref_path.display()))?;

        let obj_path = self.object_path(&hash);
        if !obj_path.exists() {
            warn!(session, tile = %addr, hash = %hash, "tile reference points at missing object");
            return Ok(None);
        }

        let bytes = fs::read(&obj_path).context("failed to read tile object")?;
        let mime_type = self.read_mime_type(&hash)?;

        Ok(Some(StoredTile {
            bytes,
            mime_type,
            hash,
        }))
    }

    fn put_manifest(&self, session: &str, manifest_json: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        validate_session_key(session)?;

        write_atomic(&self.session_dir(session).join(MANIFEST_FILE), manifest_json)
            .context("failed to write manifest")?;
        debug!(session, "manifest committed");
        Ok(())
    }

    fn get_manifest(&self, session: &str) -> Result<Option<Vec<u8>>> {
        validate_session_key(session)?;

        let path = self.session_dir(session).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).context("failed to read manifest")?;
        Ok(Some(data))
    }

    fn contains_session(&self, session: &str) -> bool {
        validate_session_key(session).is_ok()
            && self.session_dir(session).join(MANIFEST_FILE).exists()
    }

    fn remove_session(&self, session: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_session_key(session)?;

        let dir = self.session_dir(session);
        if dir.exists() {
            // Manifest first, so a half-removed session is never servable
            let manifest = dir.join(MANIFEST_FILE);
            if manifest.exists() {
                fs::remove_file(&manifest).context("failed to remove manifest")?;
            }
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove session dir {}", dir.display()))?;
            debug!(session, "session tiles removed");
        }
        Ok(())
    }
}
