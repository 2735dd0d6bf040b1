//! Pyramid Builder
//!
//! Downsamples a composite into successively halved levels and slices each
//! level into independently encoded tiles. The [`Manifest`] describes the
//! resulting geometry; it is all a viewer needs to know which tile addresses
//! exist.
//!
//! Tile `(col, row)` of a level spans, in that level's pixels,
//! `[col*T - ov, (col+1)*T + ov)` horizontally and the same vertically,
//! clipped to the level bounds (the Deep Zoom overlap convention).

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use threadconf::{PyramidConfig, TileFormat};
use tilestore::TileAddress;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PyramidError {
    #[error("invalid pyramid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot build a pyramid from an empty image")]
    EmptyImage,

    #[error("failed to encode tile {address}: {reason}")]
    Encode { address: TileAddress, reason: String },

    #[error("failed to store tile {address}: {reason}")]
    Sink { address: TileAddress, reason: String },

    #[error("pyramid build cancelled")]
    Cancelled,
}

/// Geometry of one pyramid level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelGeometry {
    pub level: u32,
    /// Size relative to level 0 (`0.5^level`).
    pub scale: f64,
    pub width: u32,
    pub height: u32,
    pub cols: u32,
    pub rows: u32,
}

/// Client-facing description of a built pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: TileFormat,
    pub level_count: u32,
    pub levels: Vec<LevelGeometry>,
}

/// Pixel rectangle of one tile within its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Manifest {
    /// Compute the geometry of every level for an image of the given size.
    pub fn plan(width: u32, height: u32, config: &PyramidConfig) -> Self {
        let tile = config.tile_size;
        let mut levels = Vec::new();
        let (mut w, mut h) = (width, height);
        loop {
            let level = levels.len() as u32;
            levels.push(LevelGeometry {
                level,
                scale: 0.5f64.powi(level as i32),
                width: w,
                height: h,
                cols: w.div_ceil(tile),
                rows: h.div_ceil(tile),
            });
            if w <= tile && h <= tile {
                break;
            }
            w = w.div_ceil(2);
            h = h.div_ceil(2);
        }

        Self {
            width,
            height,
            tile_size: tile,
            overlap: config.overlap,
            format: config.format,
            level_count: levels.len() as u32,
            levels,
        }
    }

    pub fn level(&self, level: u32) -> Option<&LevelGeometry> {
        self.levels.get(level as usize)
    }

    pub fn contains(&self, addr: TileAddress) -> bool {
        self.level(addr.level)
            .map(|l| addr.col < l.cols && addr.row < l.rows)
            .unwrap_or(false)
    }

    /// Pixel bounds of a tile, or `None` if the address is off the grid.
    pub fn tile_bounds(&self, addr: TileAddress) -> Option<TileBounds> {
        if !self.contains(addr) {
            return None;
        }
        let level = self.level(addr.level)?;
        let (x0, x1) = span(addr.col, self.tile_size, self.overlap, level.width);
        let (y0, y1) = span(addr.row, self.tile_size, self.overlap, level.height);
        Some(TileBounds {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }

    /// Total number of tiles across all levels.
    pub fn tile_count(&self) -> u64 {
        self.levels
            .iter()
            .map(|l| u64::from(l.cols) * u64::from(l.rows))
            .sum()
    }

    /// Highest Deep Zoom level number. Deep Zoom counts up from a 1x1 image
    /// to full resolution, so this is `ceil(log2(max(width, height)))`.
    pub fn dzi_max_level(&self) -> u32 {
        let longest = self.width.max(self.height).max(1);
        u32::BITS - (longest - 1).leading_zeros()
    }

    /// Map a Deep Zoom level onto this pyramid.
    ///
    /// The top `level_count` Deep Zoom levels are stored levels. The ones
    /// below are single tiles reduced further from the last stored level.
    pub fn resolve_dzi_level(&self, dzi_level: u32) -> Option<DziLevel> {
        let max = self.dzi_max_level();
        if dzi_level > max {
            return None;
        }
        let level = max - dzi_level;
        let last = self.level_count.saturating_sub(1);
        if level <= last {
            Some(DziLevel::Stored(level))
        } else {
            Some(DziLevel::Reduced {
                halvings: level - last,
            })
        }
    }

    /// The `.dzi` descriptor for this pyramid.
    pub fn dzi_xml(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<Image xmlns="http://schemas.microsoft.com/deepzoom/2008" Format="{}" Overlap="{}" TileSize="{}">"#,
                r#"<Size Width="{}" Height="{}"/>"#,
                "</Image>"
            ),
            self.format.extension(),
            self.overlap,
            self.tile_size,
            self.width,
            self.height
        )
    }
}

/// Where a Deep Zoom level comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DziLevel {
    /// A level stored in the pyramid, numbered from full resolution.
    Stored(u32),
    /// The last stored level halved this many more times.
    Reduced { halvings: u32 },
}

fn span(index: u32, tile: u32, overlap: u32, extent: u32) -> (u32, u32) {
    let start = (index * tile).saturating_sub(overlap);
    let end = ((index + 1) * tile + overlap).min(extent);
    (start, end)
}

/// One encoded tile, ready to store.
#[derive(Debug, Clone)]
pub struct EncodedTile {
    pub address: TileAddress,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

pub struct PyramidBuilder {
    config: PyramidConfig,
}

impl PyramidBuilder {
    pub fn new(config: PyramidConfig) -> Result<Self, PyramidError> {
        config.validate().map_err(PyramidError::InvalidConfig)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Build level by level, handing each tile to `sink` as soon as it is
    /// encoded. Only one level image is held at a time.
    pub fn build_with<F>(
        &self,
        composite: RgbaImage,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> Result<Manifest, PyramidError>
    where
        F: FnMut(EncodedTile) -> anyhow::Result<()>,
    {
        if composite.width() == 0 || composite.height() == 0 {
            return Err(PyramidError::EmptyImage);
        }

        let manifest = Manifest::plan(composite.width(), composite.height(), &self.config);
        let mut current = composite;

        for geometry in &manifest.levels {
            if geometry.level > 0 {
                current = downsample(&current);
            }
            debug_assert_eq!(current.dimensions(), (geometry.width, geometry.height));

            for row in 0..geometry.rows {
                for col in 0..geometry.cols {
                    if cancel.is_cancelled() {
                        return Err(PyramidError::Cancelled);
                    }
                    let address = TileAddress::new(geometry.level, row, col);
                    let bounds = manifest
                        .tile_bounds(address)
                        .ok_or_else(|| PyramidError::Encode {
                            address,
                            reason: "address outside planned grid".to_string(),
                        })?;
                    let tile = self.encode_tile(&current, address, bounds)?;
                    sink(tile).map_err(|e| PyramidError::Sink {
                        address,
                        reason: format!("{e:#}"),
                    })?;
                }
            }

            tracing::debug!(
                pyramid.level = geometry.level,
                width = geometry.width,
                height = geometry.height,
                tiles = geometry.cols * geometry.rows,
                "Level tiled"
            );
        }

        Ok(manifest)
    }

    fn encode_tile(
        &self,
        level: &RgbaImage,
        address: TileAddress,
        bounds: TileBounds,
    ) -> Result<EncodedTile, PyramidError> {
        let view =
            image::imageops::crop_imm(level, bounds.x, bounds.y, bounds.width, bounds.height)
                .to_image();
        let bytes = encode(view, self.config.format, self.config.jpeg_quality).map_err(|e| {
            PyramidError::Encode {
                address,
                reason: e.to_string(),
            }
        })?;
        Ok(EncodedTile {
            address,
            width: bounds.width,
            height: bounds.height,
            bytes,
        })
    }
}

/// Encode one tile image in the pyramid's format.
pub(crate) fn encode(
    tile: RgbaImage,
    format: TileFormat,
    quality: u8,
) -> image::ImageResult<Vec<u8>> {
    let (w, h) = tile.dimensions();
    let mut out = Vec::new();
    match format {
        TileFormat::Png => {
            PngEncoder::new(&mut out).write_image(tile.as_raw(), w, h, ExtendedColorType::Rgba8)?;
        }
        TileFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgba8(tile).to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                rgb.as_raw(),
                w,
                h,
                ExtendedColorType::Rgb8,
            )?;
        }
    }
    Ok(out)
}

/// Halve both dimensions (rounding up) by averaging each 2x2 block. Blocks
/// on the right and bottom edges may be narrower; they average only the
/// pixels that exist.
pub fn downsample(src: &RgbaImage) -> RgbaImage {
    let (w, h) = src.dimensions();
    RgbaImage::from_fn(w.div_ceil(2), h.div_ceil(2), |x, y| {
        let (sx, sy) = (x * 2, y * 2);
        let mut sum = [0u32; 4];
        let mut n = 0u32;
        for yy in sy..(sy + 2).min(h) {
            for xx in sx..(sx + 2).min(w) {
                let p = src.get_pixel(xx, yy);
                for c in 0..4 {
                    sum[c] += u32::from(p[c]);
                }
                n += 1;
            }
        }
        image::Rgba(sum.map(|s| ((s + n / 2) / n) as u8))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stitch::tests::page;
    use image::Rgba;

    fn config(tile_size: u32, overlap: u32) -> PyramidConfig {
        PyramidConfig {
            tile_size,
            overlap,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_halves_until_one_tile() {
        let manifest = Manifest::plan(800, 1600, &config(256, 1));
        let dims: Vec<(u32, u32)> = manifest.levels.iter().map(|l| (l.width, l.height)).collect();
        assert_eq!(dims, vec![(800, 1600), (400, 800), (200, 400), (100, 200)]);
        assert_eq!(manifest.level_count, 4);

        let l0 = &manifest.levels[0];
        assert_eq!((l0.cols, l0.rows), (4, 7));
        let last = manifest.levels.last().unwrap();
        assert_eq!((last.cols, last.rows), (1, 1));
        assert_eq!(manifest.levels[2].scale, 0.25);
    }

    #[test]
    fn test_plan_rounds_up() {
        let manifest = Manifest::plan(1001, 3, &config(256, 0));
        let dims: Vec<(u32, u32)> = manifest.levels.iter().map(|l| (l.width, l.height)).collect();
        assert_eq!(dims, vec![(1001, 3), (501, 2), (251, 1)]);
    }

    #[test]
    fn test_small_image_has_one_level() {
        let manifest = Manifest::plan(256, 100, &config(256, 1));
        assert_eq!(manifest.level_count, 1);
        assert_eq!(manifest.tile_count(), 1);
    }

    #[test]
    fn test_tile_bounds_with_overlap() {
        let manifest = Manifest::plan(600, 300, &config(256, 1));

        // Top-left: no overlap on the outer edges
        let b = manifest.tile_bounds(TileAddress::new(0, 0, 0)).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (0, 0, 257, 257));

        // Interior column overlaps both neighbours
        let b = manifest.tile_bounds(TileAddress::new(0, 0, 1)).unwrap();
        assert_eq!((b.x, b.width), (255, 258));

        // Edge tile is truncated, not padded
        let b = manifest.tile_bounds(TileAddress::new(0, 1, 2)).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (511, 255, 89, 45));

        assert!(manifest.tile_bounds(TileAddress::new(0, 2, 0)).is_none());
        assert!(manifest.tile_bounds(TileAddress::new(0, 0, 3)).is_none());
        assert!(manifest.tile_bounds(TileAddress::new(9, 0, 0)).is_none());
    }

    #[test]
    fn test_downsample_averages_blocks() {
        let mut src = RgbaImage::from_pixel(3, 3, Rgba([0, 0, 0, 255]));
        src.put_pixel(0, 0, Rgba([100, 0, 0, 255]));
        src.put_pixel(1, 0, Rgba([200, 0, 0, 255]));
        src.put_pixel(0, 1, Rgba([100, 0, 0, 255]));
        src.put_pixel(1, 1, Rgba([0, 0, 0, 255]));
        src.put_pixel(2, 2, Rgba([9, 9, 9, 255]));

        let out = downsample(&src);
        assert_eq!(out.dimensions(), (2, 2));
        // (100 + 200 + 100 + 0) / 4
        assert_eq!(out.get_pixel(0, 0), &Rgba([100, 0, 0, 255]));
        // Corner block has a single source pixel
        assert_eq!(out.get_pixel(1, 1), &Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn test_downsample_is_not_subsampling() {
        // Alternating black and white columns average to grey
        let src = RgbaImage::from_fn(4, 2, |x, _| {
            if x % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let out = downsample(&src);
        assert!(out.pixels().all(|p| p[0] == 128));
    }

    fn build(
        builder: &PyramidBuilder,
        image: RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<(Manifest, Vec<EncodedTile>), PyramidError> {
        let mut tiles = Vec::new();
        let manifest = builder.build_with(image, cancel, |tile| {
            tiles.push(tile);
            Ok(())
        })?;
        Ok((manifest, tiles))
    }

    #[test]
    fn test_every_tile_decodes_to_predicted_size() {
        let builder = PyramidBuilder::new(config(64, 2)).unwrap();
        let (manifest, tiles) =
            build(&builder, page(150, 330), &CancellationToken::new()).unwrap();

        assert_eq!(tiles.len() as u64, manifest.tile_count());
        for geometry in &manifest.levels {
            let on_level = tiles.iter().filter(|t| t.address.level == geometry.level).count();
            assert_eq!(on_level as u32, geometry.cols * geometry.rows);
        }
        for tile in &tiles {
            let bounds = manifest.tile_bounds(tile.address).unwrap();
            assert_eq!((tile.width, tile.height), (bounds.width, bounds.height));
            let decoded = image::load_from_memory(&tile.bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (bounds.width, bounds.height));
        }
    }

    #[test]
    fn test_level_zero_tiles_are_lossless_crops() {
        let source = page(100, 100);
        let builder = PyramidBuilder::new(config(64, 1)).unwrap();
        let (_, tiles) = build(&builder, source.clone(), &CancellationToken::new()).unwrap();

        let tile = tiles
            .iter()
            .find(|t| t.address == TileAddress::new(0, 1, 1))
            .unwrap();
        let decoded = image::load_from_memory(&tile.bytes).unwrap().into_rgba8();
        let expected = image::imageops::crop_imm(&source, 63, 63, 37, 37).to_image();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_jpeg_tiles() {
        let builder = PyramidBuilder::new(PyramidConfig {
            tile_size: 32,
            overlap: 0,
            format: TileFormat::Jpeg,
            jpeg_quality: 80,
        })
        .unwrap();
        let (manifest, tiles) = build(&builder, page(40, 40), &CancellationToken::new()).unwrap();
        assert_eq!(&tiles[0].bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(manifest.format, TileFormat::Jpeg);
    }

    #[test]
    fn test_sink_errors_abort_the_build() {
        let builder = PyramidBuilder::new(config(16, 0)).unwrap();
        let mut calls = 0;
        let err = builder
            .build_with(page(64, 64), &CancellationToken::new(), |_| {
                calls += 1;
                if calls == 3 {
                    anyhow::bail!("disk full");
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, PyramidError::Sink { .. }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            PyramidBuilder::new(config(8, 0)),
            Err(PyramidError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cancelled_build() {
        let builder = PyramidBuilder::new(config(16, 0)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            build(&builder, page(32, 32), &token),
            Err(PyramidError::Cancelled)
        ));
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = Manifest::plan(500, 500, &config(256, 1));
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["tile_size"], 256);
        assert_eq!(json["format"], "png");
        assert_eq!(json["level_count"], 2);
        assert_eq!(json["levels"][1]["cols"], 1);
    }

    #[test]
    fn test_dzi_levels_map_onto_stored_levels() {
        // 800x1600: four stored levels, Deep Zoom counts 0..=11
        let manifest = Manifest::plan(800, 1600, &config(256, 1));
        assert_eq!(manifest.dzi_max_level(), 11);
        assert_eq!(manifest.resolve_dzi_level(11), Some(DziLevel::Stored(0)));
        assert_eq!(manifest.resolve_dzi_level(8), Some(DziLevel::Stored(3)));
        assert_eq!(
            manifest.resolve_dzi_level(7),
            Some(DziLevel::Reduced { halvings: 1 })
        );
        assert_eq!(
            manifest.resolve_dzi_level(0),
            Some(DziLevel::Reduced { halvings: 8 })
        );
        assert_eq!(manifest.resolve_dzi_level(12), None);
    }

    #[test]
    fn test_dzi_max_level_for_exact_powers() {
        assert_eq!(Manifest::plan(1024, 16, &config(256, 0)).dzi_max_level(), 10);
        assert_eq!(Manifest::plan(1025, 16, &config(256, 0)).dzi_max_level(), 11);
        assert_eq!(Manifest::plan(1, 1, &config(256, 0)).dzi_max_level(), 0);
    }

    #[test]
    fn test_dzi_xml() {
        let mut cfg = config(254, 1);
        cfg.format = TileFormat::Jpeg;
        let xml = Manifest::plan(800, 1600, &cfg).dzi_xml();
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(xml.contains(r#"xmlns="http://schemas.microsoft.com/deepzoom/2008""#));
        assert!(xml.contains(r#"Format="jpg" Overlap="1" TileSize="254""#));
        assert!(xml.contains(r#"<Size Width="800" Height="1600"/>"#));
    }
}
