//! threadtiles - chat screenshot stitching and tile pyramid server
//!
//! A browser extension scrolls through a conversation and uploads one
//! screenshot per viewport. threadtiles stitches the overlapping captures
//! into a single tall image, cuts it into a multi-resolution tile pyramid
//! and serves the tiles to a deep-zoom viewer.
//!
//! Library exposing core modules for testing and reuse.

pub mod frames;
pub mod jobs;
pub mod pyramid;
pub mod session;
pub mod stitch;
pub mod telemetry;
pub mod tiles;
pub mod types;
pub mod web;
