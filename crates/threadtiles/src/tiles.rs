//! Tile Server
//!
//! Read-only lookups against built pyramids. Live sessions answer from the
//! session manager; anything no longer in memory (pruned, or from before a
//! restart) is served from the tile store.
//!
//! Deep Zoom clients address levels from the 1x1 end. Those levels map onto
//! stored levels, except the ones smaller than the last stored level, which
//! are reduced from it on request.

use moka::sync::Cache;
use std::sync::Arc;
use thiserror::Error;
use tilestore::{StoredTile, TileAddress, TileStore};

use crate::pyramid::{self, DziLevel, Manifest};
use crate::session::{SessionManager, SessionState};
use crate::types::SessionId;

#[derive(Debug, Error)]
pub enum TileError {
    #[error("thread not found: {0}")]
    NotFound(String),

    #[error("thread {0} is still being processed")]
    NotReady(SessionId),

    #[error("tile {address} is outside the pyramid of thread {session}")]
    OutOfRange {
        session: SessionId,
        address: TileAddress,
    },

    #[error("tile {address} of thread {session} is missing from storage")]
    Missing {
        session: SessionId,
        address: TileAddress,
    },

    #[error("tile storage error: {0}")]
    Storage(String),
}

/// Manifests kept in memory by [`TileServer::new`].
pub const DEFAULT_MANIFEST_CACHE_ENTRIES: u64 = 1024;

pub struct TileServer {
    sessions: SessionManager,
    store: Arc<dyn TileStore>,
    manifests: Cache<SessionId, Arc<Manifest>>,
}

impl TileServer {
    pub fn new(sessions: SessionManager, store: Arc<dyn TileStore>) -> Self {
        Self::with_cache_capacity(sessions, store, DEFAULT_MANIFEST_CACHE_ENTRIES)
    }

    /// Keep at most `entries` manifests cached; older ones are reloaded from
    /// the session manager or the store when next requested.
    pub fn with_cache_capacity(
        sessions: SessionManager,
        store: Arc<dyn TileStore>,
        entries: u64,
    ) -> Self {
        Self {
            sessions,
            store,
            manifests: Cache::builder().max_capacity(entries).build(),
        }
    }

    pub fn cached_manifests(&self) -> u64 {
        self.manifests.run_pending_tasks();
        self.manifests.entry_count()
    }

    /// Resolve a thread id as it appears in a URL. Malformed ids are simply
    /// not found.
    pub fn parse_id(raw: &str) -> Result<SessionId, TileError> {
        raw.parse()
            .map_err(|_| TileError::NotFound(raw.to_string()))
    }

    pub fn get_manifest(&self, id: SessionId) -> Result<Arc<Manifest>, TileError> {
        if let Some(manifest) = self.manifests.get(&id) {
            return Ok(manifest);
        }

        match self.sessions.state(id) {
            Some(SessionState::Created | SessionState::Collecting | SessionState::Completing) => {
                Err(TileError::NotReady(id))
            }
            Some(SessionState::Ready { manifest }) => Ok(self.cache(id, manifest)),
            Some(SessionState::Failed { .. } | SessionState::Expired { .. }) => {
                Err(TileError::NotFound(id.to_string()))
            }
            None => self.load_manifest(id),
        }
    }

    fn load_manifest(&self, id: SessionId) -> Result<Arc<Manifest>, TileError> {
        let raw = self
            .store
            .get_manifest(&id.key())
            .map_err(storage_error)?
            .ok_or_else(|| TileError::NotFound(id.to_string()))?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| TileError::Storage(format!("corrupt manifest for {id}: {e}")))?;
        tracing::debug!(session.id = %id, "Manifest loaded from store");
        Ok(self.cache(id, manifest))
    }

    fn cache(&self, id: SessionId, manifest: Manifest) -> Arc<Manifest> {
        let manifest = Arc::new(manifest);
        self.manifests.insert(id, Arc::clone(&manifest));
        manifest
    }

    /// Fetch one tile. `extension` is the file extension from the request
    /// and must match the pyramid's tile format.
    pub fn get_tile(
        &self,
        id: SessionId,
        address: TileAddress,
        extension: &str,
    ) -> Result<StoredTile, TileError> {
        let manifest = self.get_manifest(id)?;
        if !manifest.format.matches_extension(extension) {
            return Err(TileError::NotFound(format!("{id}/{address}.{extension}")));
        }
        if !manifest.contains(address) {
            return Err(TileError::OutOfRange {
                session: id,
                address,
            });
        }

        self.store
            .get_tile(&id.key(), address)
            .map_err(storage_error)?
            .ok_or(TileError::Missing {
                session: id,
                address,
            })
    }
}

impl TileServer {
    /// Fetch a tile by its Deep Zoom level.
    pub fn get_dzi_tile(
        &self,
        id: SessionId,
        dzi_level: u32,
        col: u32,
        row: u32,
        extension: &str,
    ) -> Result<StoredTile, TileError> {
        let manifest = self.get_manifest(id)?;
        let out_of_range = || TileError::OutOfRange {
            session: id,
            address: TileAddress::new(dzi_level, row, col),
        };

        match manifest.resolve_dzi_level(dzi_level) {
            None => Err(out_of_range()),
            Some(DziLevel::Stored(level)) => {
                self.get_tile(id, TileAddress::new(level, row, col), extension)
            }
            Some(DziLevel::Reduced { halvings }) => {
                if (col, row) != (0, 0) {
                    return Err(out_of_range());
                }
                let last = TileAddress::new(manifest.level_count - 1, 0, 0);
                let source = self.get_tile(id, last, extension)?;
                self.reduce(&manifest, &source, halvings)
                    .map_err(|e| TileError::Storage(format!("reducing {last} of {id}: {e}")))
            }
        }
    }

    fn reduce(
        &self,
        manifest: &Manifest,
        source: &StoredTile,
        halvings: u32,
    ) -> image::ImageResult<StoredTile> {
        let mut tile = image::load_from_memory(&source.bytes)?.into_rgba8();
        for _ in 0..halvings {
            if tile.dimensions() == (1, 1) {
                break;
            }
            tile = pyramid::downsample(&tile);
        }
        let quality = self.sessions.config().pyramid.jpeg_quality;
        let bytes = pyramid::encode(tile, manifest.format, quality)?;
        Ok(StoredTile::new(bytes, manifest.format.mime_type()))
    }
}

fn storage_error(e: anyhow::Error) -> TileError {
    TileError::Storage(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::MemoryFrameStore;
    use crate::session::{CompletionDetails, FrameUpload, LoggingAnalysisHook, ManagerConfig};
    use crate::stitch::tests::{capture, page};
    use tilestore::MemoryTileStore;

    fn setup() -> (SessionManager, TileServer) {
        let mut config = ManagerConfig::default();
        config.pyramid.tile_size = 64;
        let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
        let manager = SessionManager::new(
            config,
            Arc::new(MemoryFrameStore::new()),
            Arc::clone(&store),
            Arc::new(LoggingAnalysisHook),
        )
        .unwrap();
        let server = TileServer::new(manager.clone(), store);
        (manager, server)
    }

    async fn ready_session(manager: &SessionManager) -> SessionId {
        let id = manager.create().session_id;
        let frame = capture(&page(150, 100), 1, 0, 0, 100);
        manager
            .upload_frame(
                id,
                FrameUpload {
                    index: 1,
                    bytes: frame.bytes,
                    viewport_height: 100,
                    scroll_position: 0,
                    captured_at: None,
                },
            )
            .unwrap();
        manager
            .complete(
                id,
                CompletionDetails {
                    total_frames: 1,
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_manifest_states() {
        let (manager, server) = setup();

        let pending = manager.create().session_id;
        assert!(matches!(
            server.get_manifest(pending),
            Err(TileError::NotReady(_))
        ));

        assert!(matches!(
            server.get_manifest(SessionId::new()),
            Err(TileError::NotFound(_))
        ));

        let id = ready_session(&manager).await;
        let manifest = server.get_manifest(id).unwrap();
        assert_eq!((manifest.width, manifest.height), (150, 100));
        assert_eq!(server.cached_manifests(), 1);
    }

    #[tokio::test]
    async fn test_tiles_in_and_out_of_range() {
        let (manager, server) = setup();
        let id = ready_session(&manager).await;

        // 150x100 at 64px tiles: 3 cols x 2 rows
        let tile = server.get_tile(id, TileAddress::new(0, 1, 2), "png").unwrap();
        assert_eq!(tile.mime_type, "image/png");
        let decoded = image::load_from_memory(&tile.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (23, 37));

        assert!(matches!(
            server.get_tile(id, TileAddress::new(0, 2, 0), "png"),
            Err(TileError::OutOfRange { .. })
        ));
        assert!(matches!(
            server.get_tile(id, TileAddress::new(7, 0, 0), "png"),
            Err(TileError::OutOfRange { .. })
        ));
        assert!(matches!(
            server.get_tile(id, TileAddress::new(0, 0, 0), "jpg"),
            Err(TileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_served_from_store_after_restart() {
        let (manager, server) = setup();
        let id = ready_session(&manager).await;
        let store = manager.tile_store();

        // A fresh manager knows nothing about the session
        let restarted = SessionManager::new(
            ManagerConfig::default(),
            Arc::new(MemoryFrameStore::new()),
            Arc::clone(&store),
            Arc::new(LoggingAnalysisHook),
        )
        .unwrap();
        let fresh = TileServer::new(restarted, store);

        assert_eq!(
            fresh.get_manifest(id).unwrap().as_ref(),
            server.get_manifest(id).unwrap().as_ref()
        );
        assert!(fresh.get_tile(id, TileAddress::new(0, 0, 0), "png").is_ok());
    }

    #[tokio::test]
    async fn test_manifest_cache_is_bounded() {
        let (manager, _) = setup();
        let server = TileServer::with_cache_capacity(manager.clone(), manager.tile_store(), 2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(ready_session(&manager).await);
        }
        for &id in &ids {
            server.get_manifest(id).unwrap();
        }
        assert!(server.cached_manifests() <= 2);

        // Evicted entries are simply reloaded
        for &id in &ids {
            assert!(server.get_tile(id, TileAddress::new(0, 0, 0), "png").is_ok());
        }
        assert!(server.cached_manifests() <= 2);
    }

    #[tokio::test]
    async fn test_dzi_levels() {
        let (manager, server) = setup();
        let id = ready_session(&manager).await;

        // 150x100 at 64px: stored levels 150x100, 75x50, 38x25; Deep Zoom 0..=8
        let manifest = server.get_manifest(id).unwrap();
        assert_eq!(manifest.level_count, 3);
        assert_eq!(manifest.dzi_max_level(), 8);

        let top = server.get_dzi_tile(id, 8, 2, 1, "png").unwrap();
        let stored = server.get_tile(id, TileAddress::new(0, 1, 2), "png").unwrap();
        assert_eq!(top.bytes, stored.bytes);

        let last = server.get_dzi_tile(id, 6, 0, 0, "png").unwrap();
        let decoded = image::load_from_memory(&last.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (38, 25));

        // Below the stored levels: 19x13, then down to 1x1
        let reduced = server.get_dzi_tile(id, 5, 0, 0, "png").unwrap();
        assert_eq!(reduced.mime_type, "image/png");
        let decoded = image::load_from_memory(&reduced.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (19, 13));

        let single = server.get_dzi_tile(id, 0, 0, 0, "png").unwrap();
        let decoded = image::load_from_memory(&single.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1, 1));

        assert!(matches!(
            server.get_dzi_tile(id, 5, 1, 0, "png"),
            Err(TileError::OutOfRange { .. })
        ));
        assert!(matches!(
            server.get_dzi_tile(id, 9, 0, 0, "png"),
            Err(TileError::OutOfRange { .. })
        ));
        assert!(matches!(
            server.get_dzi_tile(id, 3, 0, 0, "jpg"),
            Err(TileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session_is_not_found() {
        let mut config = ManagerConfig::default();
        config.pyramid.tile_size = 64;
        config.idle_timeout = std::time::Duration::ZERO;
        config.retention = std::time::Duration::from_secs(3600);
        let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
        let manager = SessionManager::new(
            config,
            Arc::new(MemoryFrameStore::new()),
            Arc::clone(&store),
            Arc::new(LoggingAnalysisHook),
        )
        .unwrap();
        let server = TileServer::new(manager.clone(), store);

        let id = manager.create().session_id;
        let frame = capture(&page(150, 100), 1, 0, 0, 100);
        manager
            .upload_frame(
                id,
                FrameUpload {
                    index: 1,
                    bytes: frame.bytes,
                    viewport_height: 100,
                    scroll_position: 0,
                    captured_at: None,
                },
            )
            .unwrap();
        assert!(matches!(server.get_manifest(id), Err(TileError::NotReady(_))));

        manager.cleanup();
        assert!(matches!(server.get_manifest(id), Err(TileError::NotFound(_))));
        assert!(matches!(
            server.get_tile(id, TileAddress::new(0, 0, 0), "png"),
            Err(TileError::NotFound(_))
        ));
        assert!(matches!(
            server.get_dzi_tile(id, 0, 0, 0, "png"),
            Err(TileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pruned_expired_session_is_not_found() {
        let mut config = ManagerConfig::default();
        config.idle_timeout = std::time::Duration::ZERO;
        config.retention = std::time::Duration::ZERO;
        let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
        let manager = SessionManager::new(
            config,
            Arc::new(MemoryFrameStore::new()),
            Arc::clone(&store),
            Arc::new(LoggingAnalysisHook),
        )
        .unwrap();
        let server = TileServer::new(manager.clone(), store);

        let id = manager.create().session_id;
        manager.cleanup();
        manager.cleanup();
        assert!(manager.status(id).is_err());
        assert!(matches!(server.get_manifest(id), Err(TileError::NotFound(_))));
    }

    #[test]
    fn test_malformed_ids_are_not_found() {
        assert!(matches!(
            TileServer::parse_id("../../etc"),
            Err(TileError::NotFound(_))
        ));
    }
}
