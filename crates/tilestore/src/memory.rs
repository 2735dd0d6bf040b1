//! In-memory tile store for tests and ephemeral deployments.

use anyhow::Result;
use dashmap::DashMap;

use crate::address::{validate_session_key, TileAddress};
use crate::hash::ContentHash;
use crate::metadata::StoredTile;
use crate::store::TileStore;

#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: DashMap<(String, TileAddress), StoredTile>,
    manifests: DashMap<String, Vec<u8>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tiles held across all sessions.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

impl TileStore for MemoryTileStore {
    fn put_tile(
        &self,
        session: &str,
        addr: TileAddress,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ContentHash> {
        validate_session_key(session)?;
        let tile = StoredTile::new(bytes.to_vec(), mime_type);
        let hash = tile.hash.clone();
        self.tiles.insert((session.to_string(), addr), tile);
        Ok(hash)
    }

    fn get_tile(&self, session: &str, addr: TileAddress) -> Result<Option<StoredTile>> {
        validate_session_key(session)?;
        Ok(self
            .tiles
            .get(&(session.to_string(), addr))
            .map(|t| t.value().clone()))
    }

    fn put_manifest(&self, session: &str, manifest_json: &[u8]) -> Result<()> {
        validate_session_key(session)?;
        self.manifests
            .insert(session.to_string(), manifest_json.to_vec());
        Ok(())
    }

    fn get_manifest(&self, session: &str) -> Result<Option<Vec<u8>>> {
        validate_session_key(session)?;
        Ok(self.manifests.get(session).map(|m| m.value().clone()))
    }

    fn contains_session(&self, session: &str) -> bool {
        self.manifests.contains_key(session)
    }

    fn remove_session(&self, session: &str) -> Result<()> {
        validate_session_key(session)?;
        self.manifests.remove(session);
        self.tiles.retain(|(s, _), _| s != session);
        Ok(())
    }
}
