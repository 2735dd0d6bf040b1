//! Capture, stitch, pyramid and job tuning.
//!
//! Unlike infrastructure these are plain knobs, but they are still read once
//! at startup and handed to each component by value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Capture session limits and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions still collecting frames expire after this much inactivity.
    /// Default: 900 (15 minutes)
    #[serde(default = "SessionsConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the cleanup task looks for idle and finished sessions.
    /// Default: 30
    #[serde(default = "SessionsConfig::default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Terminal sessions are dropped from memory after this long. Ready
    /// pyramids stay servable from the tile store.
    /// Default: 3600
    #[serde(default = "SessionsConfig::default_retention_secs")]
    pub retention_secs: u64,

    /// Highest frame index a session accepts.
    /// Default: 500
    #[serde(default = "SessionsConfig::default_max_frames")]
    pub max_frames: u32,

    /// Largest decoded frame payload accepted.
    /// Default: 16 MiB
    #[serde(default = "SessionsConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// HTTP request body limit. Base64 inflates frames by a third.
    /// Default: 24 MiB
    #[serde(default = "SessionsConfig::default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl SessionsConfig {
    fn default_idle_timeout_secs() -> u64 {
        900
    }

    fn default_cleanup_interval_secs() -> u64 {
        30
    }

    fn default_retention_secs() -> u64 {
        3600
    }

    fn default_max_frames() -> u32 {
        500
    }

    fn default_max_frame_bytes() -> usize {
        16 * 1024 * 1024
    }

    fn default_max_request_bytes() -> usize {
        24 * 1024 * 1024
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            cleanup_interval_secs: Self::default_cleanup_interval_secs(),
            retention_secs: Self::default_retention_secs(),
            max_frames: Self::default_max_frames(),
            max_frame_bytes: Self::default_max_frame_bytes(),
            max_request_bytes: Self::default_max_request_bytes(),
        }
    }
}

/// Frame alignment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Candidate overlaps within this many pixels of the scroll-derived
    /// estimate are scored.
    /// Default: 32
    #[serde(default = "StitchConfig::default_search_radius")]
    pub search_radius: u32,

    /// Rows compared per candidate.
    /// Default: 48
    #[serde(default = "StitchConfig::default_strip_height")]
    pub strip_height: u32,

    /// Sample every Nth row of the strip.
    /// Default: 2
    #[serde(default = "StitchConfig::default_row_step")]
    pub row_step: u32,

    /// Sample every Nth column.
    /// Default: 4
    #[serde(default = "StitchConfig::default_col_step")]
    pub col_step: u32,

    /// Best candidate scores above this (mean absolute difference per RGB
    /// channel, 0-255) are rejected in favour of the scroll estimate.
    /// Default: 12.0
    #[serde(default = "StitchConfig::default_max_mean_difference")]
    pub max_mean_difference: f64,

    /// Upper bound on composite width × height.
    /// Default: 16384 × 16384
    #[serde(default = "StitchConfig::default_max_composite_pixels")]
    pub max_composite_pixels: u64,
}

impl StitchConfig {
    fn default_search_radius() -> u32 {
        32
    }

    fn default_strip_height() -> u32 {
        48
    }

    fn default_row_step() -> u32 {
        2
    }

    fn default_col_step() -> u32 {
        4
    }

    fn default_max_mean_difference() -> f64 {
        12.0
    }

    fn default_max_composite_pixels() -> u64 {
        16_384 * 16_384
    }
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            search_radius: Self::default_search_radius(),
            strip_height: Self::default_strip_height(),
            row_step: Self::default_row_step(),
            col_step: Self::default_col_step(),
            max_mean_difference: Self::default_max_mean_difference(),
            max_composite_pixels: Self::default_max_composite_pixels(),
        }
    }
}

/// Encoding used for every tile of a pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    #[default]
    Png,
    Jpeg,
}

impl TileFormat {
    /// File extension used in tile URLs.
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
        }
    }

    /// True if `ext` names this format (`jpg` and `jpeg` both match JPEG).
    pub fn matches_extension(&self, ext: &str) -> bool {
        match self {
            TileFormat::Png => ext.eq_ignore_ascii_case("png"),
            TileFormat::Jpeg => ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"),
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileFormat::Png => write!(f, "png"),
            TileFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

impl FromStr for TileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(TileFormat::Png),
            "jpeg" | "jpg" => Ok(TileFormat::Jpeg),
            other => Err(format!("unknown tile format: {other}")),
        }
    }
}

/// Pyramid geometry and encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidConfig {
    /// Nominal tile edge in pixels.
    /// Default: 256
    #[serde(default = "PyramidConfig::default_tile_size")]
    pub tile_size: u32,

    /// Extra pixels each tile shares with its neighbours on every side.
    /// Default: 1
    #[serde(default = "PyramidConfig::default_overlap")]
    pub overlap: u32,

    /// Default: png
    #[serde(default)]
    pub format: TileFormat,

    /// Only used for JPEG tiles.
    /// Default: 85
    #[serde(default = "PyramidConfig::default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl PyramidConfig {
    fn default_tile_size() -> u32 {
        256
    }

    fn default_overlap() -> u32 {
        1
    }

    fn default_jpeg_quality() -> u8 {
        85
    }

    /// Reject geometry the builder cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size < 16 {
            return Err(format!("tile_size must be at least 16, got {}", self.tile_size));
        }
        if self.overlap >= self.tile_size / 2 {
            return Err(format!(
                "overlap must be less than half of tile_size ({}), got {}",
                self.tile_size / 2,
                self.overlap
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        Ok(())
    }
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            tile_size: Self::default_tile_size(),
            overlap: Self::default_overlap(),
            format: TileFormat::default(),
            jpeg_quality: Self::default_jpeg_quality(),
        }
    }
}

/// Background stitch/pyramid jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// A job running longer than this is cancelled and its session failed.
    /// Default: 120
    #[serde(default = "JobsConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl JobsConfig {
    fn default_timeout_secs() -> u64 {
        120
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}
