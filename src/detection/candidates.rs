//! Corner candidates from the `chess-corners` ChESS detector.
//!
//! The detector runs on the contrast-normalized frame re-quantized to 8 bits,
//! so its relative threshold sees the same dynamic range under uneven
//! lighting. Its descriptors are reduced to position and response strength;
//! orientation is not needed by the lattice growth.

use chess_corners::{find_chess_corners_image, ChessConfig, CornerDescriptor};
use image::{GrayImage, Luma};
use nalgebra::Point2;

use super::image_ops::FloatImage;

/// Radius of the ChESS sampling ring.
pub const RING_RADIUS: u32 = 5;

/// Frames narrower or shorter than one full ring cannot hold a corner.
pub const MIN_FRAME_SIZE: u32 = 2 * RING_RADIUS + 1;

/// A local maximum of the corner response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerCandidate {
    pub position: Point2<f64>,
    pub strength: f32,
}

/// Single-scale ChESS settings with the given relative threshold and
/// suppression radius.
pub fn chess_config(threshold_rel: f32, nms_radius: u32) -> ChessConfig {
    let mut cfg = ChessConfig::single_scale();
    cfg.params.threshold_rel = threshold_rel;
    cfg.params.nms_radius = nms_radius;
    cfg
}

/// Maps a zero-mean, unit-deviation image back to 8 bits around mid grey.
/// Three deviations either side span the full range.
pub fn quantize_normalized(img: &FloatImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = 127.5 + img.get_pixel(x, y)[0] * (127.5 / 3.0);
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

fn adapt_descriptor(c: &CornerDescriptor) -> CornerCandidate {
    CornerCandidate {
        position: Point2::new(f64::from(c.x), f64::from(c.y)),
        strength: c.response,
    }
}

/// Runs the ChESS detector and returns positive-response candidates,
/// strongest first.
pub fn detect_candidates(img: &GrayImage, cfg: &ChessConfig) -> Vec<CornerCandidate> {
    if img.width() < MIN_FRAME_SIZE || img.height() < MIN_FRAME_SIZE {
        return Vec::new();
    }
    let mut candidates: Vec<CornerCandidate> = find_chess_corners_image(img, cfg)
        .iter()
        .map(adapt_descriptor)
        .filter(|c| c.strength > 0.0 && c.strength.is_finite())
        .collect();
    candidates.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    candidates
}
