//! Tile storage for threadtiles.
//!
//! Holds the output of a pyramid build: every encoded tile, addressed by
//! `(session, level, row, col)`, plus one JSON manifest per session.
//!
//! - **threadtiles** jobs write tiles and the manifest after a stitch
//! - the tile server reads them back, possibly after a restart
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tilestore::{FileTileStore, TileAddress, TileStore};
//!
//! let store = FileTileStore::at_path("/var/lib/threadtiles/tiles").unwrap();
//!
//! let addr = TileAddress::new(0, 0, 0);
//! let hash = store.put_tile("a1b2c3", addr, b"png bytes", "image/png").unwrap();
//! println!("tile stored as {}", hash);
//!
//! store.put_manifest("a1b2c3", br#"{"width":1}"#).unwrap();
//!
//! if let Some(tile) = store.get_tile("a1b2c3", addr).unwrap() {
//!     println!("{} bytes of {}", tile.bytes.len(), tile.mime_type);
//! }
//! ```
//!
//! # Layout
//!
//! Tile bytes are content-addressed, so the blank tiles that dominate the
//! margins of a chat screenshot are written once and shared by every level
//! and session that produces them. Each session keeps small reference files
//! that point at object hashes. The manifest is written last; a session with
//! no manifest is not servable.

pub mod address;
pub mod config;
pub mod hash;
pub mod memory;
pub mod metadata;
pub mod store;

// Re-exports for convenience
pub use address::{validate_session_key, TileAddress, TileStoreError};
pub use config::TileStoreConfig;
pub use hash::{ContentHash, HashError};
pub use memory::MemoryTileStore;
pub use metadata::{StoredTile, TileMetadata};
pub use store::{FileTileStore, TileStore};
