//! Object sidecar metadata and the value handed back to readers.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};

/// JSON sidecar stored next to every object: `{mime_type, size}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TileMetadata {
    /// e.g. "image/png", "image/jpeg".
    pub mime_type: String,

    pub size: u64,
}

/// A tile read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub hash: ContentHash,
}

impl StoredTile {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let hash = ContentHash::from_data(&bytes);
        Self {
            bytes,
            mime_type: mime_type.into(),
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_shape() {
        let meta = TileMetadata {
            mime_type: "image/png".to_string(),
            size: 4096,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["mime_type"], "image/png");
        assert_eq!(json["size"], 4096);
    }

    #[test]
    fn test_stored_tile_hashes_its_bytes() {
        let tile = StoredTile::new(vec![1, 2, 3], "image/jpeg");
        assert_eq!(tile.hash, ContentHash::from_data(&[1, 2, 3]));
        assert_eq!(tile.mime_type, "image/jpeg");
    }
}
