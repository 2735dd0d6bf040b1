//! Stitcher
//!
//! Turns an ordered run of overlapping viewport captures into one tall
//! composite. Each frame's position starts from the scroll offset the client
//! reported, then is refined by matching pixels across the seam with its
//! predecessor. Refinement that finds no convincing match falls back to the
//! reported offset rather than failing the session.

use image::{ImageReader, RgbaImage};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;
use threadconf::StitchConfig;
use tokio_util::sync::CancellationToken;

use crate::frames::FrameRecord;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StitchError {
    #[error("no frames to stitch")]
    Empty,

    #[error("frame {index} could not be decoded: {reason}")]
    Decode { index: u32, reason: String },

    #[error("frame {index} is {width}px wide, expected {expected}px")]
    InconsistentWidth {
        index: u32,
        width: u32,
        expected: u32,
    },

    #[error("composite of {width}x{height} exceeds the limit of {max} pixels")]
    CompositeTooLarge { width: u32, height: u64, max: u64 },

    #[error("stitch cancelled")]
    Cancelled,
}

/// How a frame's overlap with its predecessor was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// First frame, placed at the top.
    First,
    /// Pixel matching moved (or confirmed) the scroll-derived overlap.
    Refined,
    /// No candidate matched well enough; the scroll-derived overlap was used.
    Coarse,
    /// The frames do not overlap according to their scroll positions.
    Disjoint,
}

/// Where one frame landed in the composite.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub index: u32,
    /// Top row in the composite.
    pub offset: u64,
    pub height: u32,
    /// Rows shared with the previous frame, in image pixels.
    pub overlap: u32,
    /// Overlap predicted from scroll positions alone.
    pub coarse_overlap: u32,
    pub alignment: Alignment,
    /// Mean absolute RGB difference of the best candidate, if scored.
    pub score: Option<f64>,
}

#[derive(Debug)]
pub struct StitchOutput {
    pub composite: RgbaImage,
    pub placements: Vec<Placement>,
}

/// Stitch frames, already ordered by index, into a composite.
///
/// Checks `cancel` between frames; returns [`StitchError::Cancelled`] once it
/// fires.
pub fn stitch(
    frames: &[FrameRecord],
    config: &StitchConfig,
    cancel: &CancellationToken,
) -> Result<StitchOutput, StitchError> {
    if frames.is_empty() {
        return Err(StitchError::Empty);
    }

    // Headers only: reject oversized or mismatched input before any frame
    // is decoded.
    let mut width = 0;
    for (i, frame) in frames.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(StitchError::Cancelled);
        }
        let (w, h) = frame_reader(frame)?
            .into_dimensions()
            .map_err(|e| decode_error(frame, e))?;
        if i == 0 {
            width = w;
        } else if w != width {
            return Err(StitchError::InconsistentWidth {
                index: frame.index,
                width: w,
                expected: width,
            });
        }
        check_area(width, u64::from(h), config)?;
    }

    let mut images: Vec<RgbaImage> = Vec::with_capacity(frames.len());
    let mut placements: Vec<Placement> = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(StitchError::Cancelled);
        }
        let cur = decode_frame(frame)?;

        let Some(prev) = images.last() else {
            placements.push(Placement {
                index: frame.index,
                offset: 0,
                height: cur.height(),
                overlap: 0,
                coarse_overlap: 0,
                alignment: Alignment::First,
                score: None,
            });
            images.push(cur);
            continue;
        };

        let coarse = coarse_overlap(&frames[i - 1], frame, prev.height(), cur.height());
        let (overlap, alignment, score) = if coarse == 0 {
            (0, Alignment::Disjoint, None)
        } else {
            match refine_overlap(prev, &cur, coarse, config) {
                Some((best, score)) if score <= config.max_mean_difference => {
                    (best, Alignment::Refined, Some(score))
                }
                Some((_, score)) => {
                    tracing::debug!(
                        frame.index = frame.index,
                        score,
                        coarse,
                        "No convincing seam match, using scroll offset"
                    );
                    (coarse, Alignment::Coarse, Some(score))
                }
                None => (coarse, Alignment::Coarse, None),
            }
        };

        let above = &placements[i - 1];
        let offset = above.offset + u64::from(above.height) - u64::from(overlap);
        check_area(width, offset + u64::from(cur.height()), config)?;
        placements.push(Placement {
            index: frame.index,
            offset,
            height: cur.height(),
            overlap,
            coarse_overlap: coarse,
            alignment,
            score,
        });
        images.push(cur);
    }

    let height = placements
        .last()
        .map(|p| p.offset + u64::from(p.height))
        .unwrap_or(0);

    if images.len() == 1 {
        let composite = images.pop().ok_or(StitchError::Empty)?;
        return Ok(StitchOutput {
            composite,
            placements,
        });
    }

    let mut composite = RgbaImage::new(width, height as u32);
    let row_bytes = width as usize * 4;
    let canvas: &mut [u8] = &mut composite;
    // Index order; in the seam the later frame overwrites the earlier one
    for (placement, image) in placements.iter().zip(&images) {
        let start = placement.offset as usize * row_bytes;
        let src = image.as_raw();
        canvas[start..start + src.len()].copy_from_slice(src);
    }

    tracing::debug!(
        frames = frames.len(),
        width,
        height,
        refined = placements.iter().filter(|p| p.alignment == Alignment::Refined).count(),
        coarse = placements.iter().filter(|p| p.alignment == Alignment::Coarse).count(),
        "Composite assembled"
    );

    Ok(StitchOutput {
        composite,
        placements,
    })
}

fn decode_error(frame: &FrameRecord, e: impl std::fmt::Display) -> StitchError {
    StitchError::Decode {
        index: frame.index,
        reason: e.to_string(),
    }
}

fn frame_reader(frame: &FrameRecord) -> Result<ImageReader<Cursor<&[u8]>>, StitchError> {
    ImageReader::new(Cursor::new(&frame.bytes[..]))
        .with_guessed_format()
        .map_err(|e| decode_error(frame, e))
}

fn decode_frame(frame: &FrameRecord) -> Result<RgbaImage, StitchError> {
    Ok(frame_reader(frame)?
        .decode()
        .map_err(|e| decode_error(frame, e))?
        .into_rgba8())
}

/// Fail once a composite of `width` by `height` would pass the pixel limit.
fn check_area(width: u32, height: u64, config: &StitchConfig) -> Result<(), StitchError> {
    let area = u64::from(width).saturating_mul(height);
    if area > config.max_composite_pixels || height > u64::from(u32::MAX) {
        return Err(StitchError::CompositeTooLarge {
            width,
            height,
            max: config.max_composite_pixels,
        });
    }
    Ok(())
}

/// Image pixels per CSS pixel, from the declared viewport height.
fn pixel_scale(frame: &FrameRecord, image_height: u32) -> f64 {
    if frame.viewport_height == 0 {
        1.0
    } else {
        f64::from(image_height) / f64::from(frame.viewport_height)
    }
}

/// Overlap implied by the declared scroll positions, in image pixels.
fn coarse_overlap(prev: &FrameRecord, cur: &FrameRecord, prev_height: u32, cur_height: u32) -> u32 {
    let scale = pixel_scale(cur, cur_height);
    let viewport = if cur.viewport_height == 0 {
        i64::from(cur_height)
    } else {
        i64::from(cur.viewport_height)
    };
    let delta = i64::from(cur.scroll_position) - i64::from(prev.scroll_position);
    let css = (viewport - delta).clamp(0, viewport);
    let px = (css as f64 * scale).round() as i64;
    px.clamp(0, i64::from(prev_height.min(cur_height))) as u32
}

/// Search overlaps within `search_radius` of `coarse` for the best seam
/// match. Returns the winning overlap and its score, or `None` if there was
/// nothing to compare.
fn refine_overlap(
    prev: &RgbaImage,
    cur: &RgbaImage,
    coarse: u32,
    config: &StitchConfig,
) -> Option<(u32, f64)> {
    let max_overlap = prev.height().min(cur.height());
    let lo = coarse.saturating_sub(config.search_radius).max(1);
    let hi = coarse.saturating_add(config.search_radius).min(max_overlap);

    let mut best: Option<(u32, f64)> = None;
    for candidate in lo..=hi {
        let cutoff = best.map_or(f64::INFINITY, |(_, score)| score);
        let Some(score) = seam_difference(prev, cur, candidate, config, cutoff) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_overlap, best_score)) => {
                score < best_score
                    || (score == best_score
                        && candidate.abs_diff(coarse) < best_overlap.abs_diff(coarse))
            }
        };
        if better {
            best = Some((candidate, score));
        }
    }
    best
}

/// Mean absolute per-channel RGB difference between the top strip of `cur`
/// and the rows of `prev` it would cover at the given overlap.
///
/// Gives up with `None` as soon as the mean is certain to exceed `cutoff`,
/// or when there is nothing to compare.
fn seam_difference(
    prev: &RgbaImage,
    cur: &RgbaImage,
    overlap: u32,
    config: &StitchConfig,
    cutoff: f64,
) -> Option<f64> {
    let strip = config.strip_height.min(overlap);
    let row_step = config.row_step.max(1);
    let col_step = config.col_step.max(1);
    let base = prev.height() - overlap;

    let samples =
        u64::from(strip.div_ceil(row_step)) * u64::from(cur.width().div_ceil(col_step)) * 3;
    if samples == 0 {
        return None;
    }
    // The running total only grows
    let budget = cutoff * samples as f64;

    let mut total: u64 = 0;
    for row in (0..strip).step_by(row_step as usize) {
        for x in (0..cur.width()).step_by(col_step as usize) {
            let a = prev.get_pixel(x, base + row);
            let b = cur.get_pixel(x, row);
            for c in 0..3 {
                total += u64::from(a[c].abs_diff(b[c]));
            }
        }
        if total as f64 > budget {
            return None;
        }
    }

    Some(total as f64 / samples as f64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    /// A tall page whose rows are all distinguishable from each other.
    pub(crate) fn page(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([
                ((y * 7 + x) % 251) as u8,
                ((y * 13) % 256) as u8,
                ((y / 3 + x * 5) % 256) as u8,
                255,
            ])
        })
    }

    pub(crate) fn encode_png(image: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// Cut a viewport capture out of `page`, reporting `reported_scroll`.
    pub(crate) fn capture(
        page: &RgbaImage,
        index: u32,
        true_scroll: u32,
        reported_scroll: u32,
        viewport: u32,
    ) -> FrameRecord {
        let view = image::imageops::crop_imm(page, 0, true_scroll, page.width(), viewport).to_image();
        FrameRecord {
            index,
            bytes: encode_png(&view),
            viewport_height: viewport,
            scroll_position: reported_scroll,
            captured_at: None,
            received_at: Utc::now(),
        }
    }

    fn run(frames: &[FrameRecord]) -> Result<StitchOutput, StitchError> {
        stitch(frames, &StitchConfig::default(), &CancellationToken::new())
    }

    #[test]
    fn test_three_frames_at_500px_scroll_steps() {
        let source = page(800, 1600);
        let frames: Vec<_> = [0, 500, 1000]
            .iter()
            .enumerate()
            .map(|(i, &s)| capture(&source, i as u32 + 1, s, s, 600))
            .collect();

        let out = run(&frames).unwrap();

        // 600 + (600 - 100) + (600 - 100)
        assert_eq!(out.composite.dimensions(), (800, 1600));
        assert_eq!(out.placements[1].overlap, 100);
        assert_eq!(out.placements[2].offset, 1000);
        assert_eq!(out.composite, source);
    }

    #[test]
    fn test_height_is_sum_of_non_overlapping_contributions() {
        let source = page(120, 900);
        let scrolls = [0, 150, 400, 500];
        let frames: Vec<_> = scrolls
            .iter()
            .enumerate()
            .map(|(i, &s)| capture(&source, i as u32 + 1, s, s, 300))
            .collect();

        let out = run(&frames).unwrap();
        let expected: u64 = out
            .placements
            .iter()
            .map(|p| u64::from(p.height) - u64::from(p.overlap))
            .sum();
        assert_eq!(u64::from(out.composite.height()), expected);
        assert_eq!(out.composite.height(), 800);
    }

    #[test]
    fn test_single_frame_is_unchanged() {
        let source = page(64, 200);
        let frame = capture(&source, 1, 0, 0, 200);

        let out = run(&[frame]).unwrap();
        assert_eq!(out.composite, source);
        assert_eq!(out.placements[0].alignment, Alignment::First);
    }

    #[test]
    fn test_drift_is_corrected() {
        let source = page(200, 1000);
        // Frame 2 was really captured at 400 but claims 392
        let frames = vec![
            capture(&source, 1, 0, 0, 500),
            capture(&source, 2, 400, 392, 500),
        ];

        let out = run(&frames).unwrap();
        assert_eq!(out.placements[1].coarse_overlap, 108);
        assert_eq!(out.placements[1].overlap, 100);
        assert_eq!(out.placements[1].alignment, Alignment::Refined);
        assert_eq!(out.composite.height(), 900);
        assert_eq!(out.composite, image::imageops::crop_imm(&source, 0, 0, 200, 900).to_image());
    }

    #[test]
    fn test_unrelated_content_falls_back_to_scroll_offset() {
        let a = RgbaImage::from_pixel(100, 300, Rgba([0, 0, 0, 255]));
        let b = RgbaImage::from_pixel(100, 300, Rgba([255, 255, 255, 255]));
        let frames = vec![
            FrameRecord {
                index: 1,
                bytes: encode_png(&a),
                viewport_height: 300,
                scroll_position: 0,
                captured_at: None,
                received_at: Utc::now(),
            },
            FrameRecord {
                index: 2,
                bytes: encode_png(&b),
                viewport_height: 300,
                scroll_position: 250,
                captured_at: None,
                received_at: Utc::now(),
            },
        ];

        let out = run(&frames).unwrap();
        assert_eq!(out.placements[1].alignment, Alignment::Coarse);
        assert_eq!(out.placements[1].overlap, 50);
        assert_eq!(out.composite.height(), 550);
        // Later frame wins the seam
        assert_eq!(out.composite.get_pixel(0, 260), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_disjoint_frames_are_stacked() {
        let source = page(50, 400);
        let frames = vec![
            capture(&source, 1, 0, 0, 100),
            capture(&source, 2, 100, 250, 100),
        ];

        let out = run(&frames).unwrap();
        assert_eq!(out.placements[1].alignment, Alignment::Disjoint);
        assert_eq!(out.composite.height(), 200);
    }

    #[test]
    fn test_device_pixel_ratio_scales_scroll_offsets() {
        // 2x screenshots: 600 image rows for a 300px viewport
        let source = page(80, 1000);
        let mut frames = vec![
            capture(&source, 1, 0, 0, 600),
            capture(&source, 2, 400, 0, 600),
        ];
        for f in &mut frames {
            f.viewport_height = 300;
        }
        frames[1].scroll_position = 200;

        let out = run(&frames).unwrap();
        assert_eq!(out.placements[1].coarse_overlap, 200);
        assert_eq!(out.composite.height(), 1000);
    }

    #[test]
    fn test_inconsistent_width() {
        let frames = vec![
            capture(&page(100, 300), 1, 0, 0, 300),
            capture(&page(90, 300), 2, 0, 200, 300),
        ];
        assert_eq!(
            run(&frames).unwrap_err(),
            StitchError::InconsistentWidth {
                index: 2,
                width: 90,
                expected: 100
            }
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(run(&[]).unwrap_err(), StitchError::Empty);
    }

    #[test]
    fn test_undecodable_frame() {
        let mut frame = capture(&page(10, 10), 1, 0, 0, 10);
        frame.bytes = b"definitely not an image".to_vec();
        assert!(matches!(run(&[frame]), Err(StitchError::Decode { index: 1, .. })));
    }

    #[test]
    fn test_composite_too_large() {
        let source = page(100, 400);
        let frames = vec![
            capture(&source, 1, 0, 0, 200),
            capture(&source, 2, 200, 200, 200),
        ];
        let config = StitchConfig {
            max_composite_pixels: 100 * 399,
            ..Default::default()
        };
        let err = stitch(&frames, &config, &CancellationToken::new()).unwrap_err();
        assert_eq!(
            err,
            StitchError::CompositeTooLarge {
                width: 100,
                height: 400,
                max: 39_900
            }
        );
    }

    #[test]
    fn test_oversized_frame_rejected_before_decoding() {
        // The second frame is garbage; the first one's header already rules
        // the thread out
        let mut frames = vec![
            capture(&page(100, 500), 1, 0, 0, 500),
            capture(&page(100, 500), 2, 400, 400, 500),
        ];
        frames[1].bytes = b"not an image either".to_vec();
        let config = StitchConfig {
            max_composite_pixels: 100 * 499,
            ..Default::default()
        };
        assert_eq!(
            stitch(&frames, &config, &CancellationToken::new()).unwrap_err(),
            StitchError::CompositeTooLarge {
                width: 100,
                height: 500,
                max: 49_900
            }
        );
    }

    #[test]
    fn test_growth_past_limit_stops_at_that_frame() {
        let source = page(50, 1000);
        // Five disjoint frames; the third one crosses the limit
        let frames: Vec<_> = (0..5)
            .map(|i| capture(&source, i + 1, i * 200, i * 200, 200))
            .collect();
        let config = StitchConfig {
            max_composite_pixels: 50 * 500,
            ..Default::default()
        };
        assert_eq!(
            stitch(&frames, &config, &CancellationToken::new()).unwrap_err(),
            StitchError::CompositeTooLarge {
                width: 50,
                height: 600,
                max: 25_000
            }
        );
    }

    #[test]
    fn test_seam_difference_gives_up_past_cutoff() {
        let black = RgbaImage::from_pixel(20, 40, Rgba([0, 0, 0, 255]));
        let white = RgbaImage::from_pixel(20, 40, Rgba([255, 255, 255, 255]));
        let config = StitchConfig::default();

        let full = seam_difference(&black, &white, 16, &config, f64::INFINITY);
        assert_eq!(full, Some(255.0));
        // A tie still completes
        assert_eq!(seam_difference(&black, &white, 16, &config, 255.0), Some(255.0));
        assert_eq!(seam_difference(&black, &white, 16, &config, 254.0), None);
        assert_eq!(seam_difference(&black, &black, 16, &config, 0.0), Some(0.0));
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let frame = capture(&page(10, 10), 1, 0, 0, 10);
        assert_eq!(
            stitch(&[frame], &StitchConfig::default(), &token).unwrap_err(),
            StitchError::Cancelled
        );
    }
}
