//! Checkerboard inner-corner detection.
//!
//! [`ChessboardDetector`] finds the `width x height` inner corners of a
//! checkerboard in an 8-bit grey frame and returns them in the board's
//! row-major order: the first row is the one closest to the image top, the
//! first corner of each row the one closest to the left, and rows run so that
//! the board axes are right-handed in the image. A frame without a complete
//! board is a normal outcome and is reported as `found == false`.

pub mod candidates;
pub mod grid;
pub mod image_ops;
pub mod subpix;

use crate::board::PatternSize;
use image::GrayImage;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use candidates::{chess_config, detect_candidates, quantize_normalized, MIN_FRAME_SIZE};
use grid::{assemble_grid, canonical_order, mean_spacing, GridParams};
use image_ops::{gaussian_blur, normalize_local_contrast, to_float, FloatImage, IntegralImage};
use subpix::{refine_corner, SubPixParams};

/// Outcome of a detection attempt on one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub found: bool,
    /// Exactly `width * height` points in row-major board order when `found`,
    /// empty otherwise.
    pub corners: Vec<Point2<f64>>,
}

impl Detection {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(corners: Vec<Point2<f64>>) -> Self {
        Self {
            found: true,
            corners,
        }
    }
}

/// Anything that can locate a checkerboard in a frame.
pub trait PatternDetector {
    fn detect(&self, frame: &GrayImage, pattern: PatternSize) -> Detection;
}

/// Tuning parameters of [`ChessboardDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Gaussian pre-blur sigma in pixels.
    pub blur_sigma: f32,
    /// Half-size of the local contrast normalization window.
    pub contrast_radius: u32,
    /// Lower bound on the local standard deviation used for normalization.
    pub contrast_floor: f32,
    /// Candidate threshold relative to the strongest corner response.
    pub response_threshold: f32,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: u32,
    /// Fraction of board cells that must follow the alternating colour layout.
    pub min_parity_consistency: f64,
    /// Refine corners to sub-pixel accuracy.
    pub refine: bool,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            contrast_radius: 15,
            contrast_floor: 0.05,
            response_threshold: 0.1,
            nms_radius: 3,
            min_parity_consistency: 0.85,
            refine: true,
        }
    }
}

/// Checkerboard detector: `chess-corners` candidates, lattice growth and
/// gradient-based sub-pixel refinement on the blurred frame.
#[derive(Debug, Clone, Default)]
pub struct ChessboardDetector {
    pub params: DetectorParams,
}

impl ChessboardDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self { params }
    }
}

impl PatternDetector for ChessboardDetector {
    fn detect(&self, frame: &GrayImage, pattern: PatternSize) -> Detection {
        let p = &self.params;
        if pattern.width < 2 || pattern.height < 2 {
            return Detection::not_found();
        }
        if frame.width() < MIN_FRAME_SIZE || frame.height() < MIN_FRAME_SIZE {
            debug!("{}x{} frame too small", frame.width(), frame.height());
            return Detection::not_found();
        }

        let blurred = gaussian_blur(&to_float(frame), p.blur_sigma);
        let normalized = normalize_local_contrast(&blurred, p.contrast_radius, p.contrast_floor);
        let cfg = chess_config(p.response_threshold, p.nms_radius);
        let candidates = detect_candidates(&quantize_normalized(&normalized), &cfg);
        debug!("{} corner candidates", candidates.len());

        let Some(grid) = assemble_grid(&candidates, pattern, &GridParams::default()) else {
            debug!("no complete {pattern} lattice");
            return Detection::not_found();
        };
        let Some(corners) = canonical_order(grid, pattern) else {
            return Detection::not_found();
        };

        let spacing = mean_spacing(&corners, pattern);
        let consistency = parity_consistency(&blurred, &corners, pattern, spacing);
        if consistency < p.min_parity_consistency {
            debug!("cell colours do not alternate ({consistency:.2})");
            return Detection::not_found();
        }

        if !p.refine {
            return Detection::found(corners);
        }
        let subpix = SubPixParams::for_spacing(spacing);
        let refined: Option<Vec<Point2<f64>>> = corners
            .iter()
            .map(|c| refine_corner(&blurred, *c, &subpix))
            .collect();
        match refined {
            Some(corners) => Detection::found(corners),
            None => {
                debug!("sub-pixel refinement diverged");
                Detection::not_found()
            }
        }
    }
}

/// Fraction of the board's cells whose brightness relative to the
/// surrounding mean follows a single checkerboard colouring.
///
/// Each cell centre (mean of its four corners) is classified as darker or
/// lighter than the mean over a window two squares wide. On a true board
/// neighbouring cells alternate.
fn parity_consistency(
    img: &FloatImage,
    corners: &[Point2<f64>],
    pattern: PatternSize,
    spacing: f64,
) -> f64 {
    let integral = IntegralImage::new(img);
    let radius = spacing.round().max(2.0) as i64;
    let w = pattern.width;

    let mut agree = 0usize;
    let mut total = 0usize;
    for r in 0..pattern.height - 1 {
        for c in 0..w - 1 {
            let centre = (corners[r * w + c].coords
                + corners[r * w + c + 1].coords
                + corners[(r + 1) * w + c].coords
                + corners[(r + 1) * w + c + 1].coords)
                / 4.0;
            let (x, y) = (centre.x.round() as i64, centre.y.round() as i64);
            let local = integral.window_mean(x, y, 1);
            let surround = integral.window_mean(x, y, radius);
            let darker = local < surround;
            let even = (r + c) % 2 == 0;
            if darker == even {
                agree += 1;
            }
            total += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    let agree = agree.max(total - agree);
    agree as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::generate_world_points;
    use crate::camera::{Intrinsics, RadTanModel, Resolution};
    use crate::synthetic::{board_poses, project_board, render_board};
    use image::Luma;

    fn pinhole() -> RadTanModel {
        RadTanModel::from_parts(
            Intrinsics {
                fx: 400.0,
                fy: 400.0,
                cx: 160.0,
                cy: 120.0,
            },
            [0.0; 8],
            Resolution {
                width: 320,
                height: 240,
            },
        )
        .unwrap()
    }

    fn assert_matches_truth(detected: &[Point2<f64>], truth: &[Point2<f64>], tol: f64) {
        assert_eq!(detected.len(), truth.len());
        for (i, (d, t)) in detected.iter().zip(truth).enumerate() {
            let err = (d - t).norm();
            assert!(err < tol, "corner {i}: detected {d:?}, truth {t:?}, error {err}");
        }
    }

    #[test]
    fn test_detects_rendered_board() {
        let camera = pinhole();
        let pattern = PatternSize::new(9, 6);
        let world = generate_world_points(pattern, 0.028);
        let detector = ChessboardDetector::default();

        for pose in board_poses(pattern, 0.028, 4, 0.6) {
            let frame = render_board(&camera, &pose, pattern, 0.028);
            let detection = detector.detect(&frame, pattern);
            assert!(detection.found);
            assert_matches_truth(&detection.corners, &project_board(&camera, &pose, &world), 0.25);
        }
    }

    #[test]
    fn test_detects_distorted_board() {
        let camera = crate::synthetic::demo_camera();
        let pattern = PatternSize::new(9, 6);
        let world = generate_world_points(pattern, 0.028);
        let pose = board_poses(pattern, 0.028, 3, 0.45)[2];

        let frame = render_board(&camera, &pose, pattern, 0.028);
        let detection = ChessboardDetector::default().detect(&frame, pattern);
        assert!(detection.found);
        assert_matches_truth(&detection.corners, &project_board(&camera, &pose, &world), 0.25);
    }

    #[test]
    fn test_ordering_is_row_major_top_left() {
        let camera = pinhole();
        let pattern = PatternSize::new(9, 6);
        let pose = board_poses(pattern, 0.028, 1, 0.6)[0];
        let frame = render_board(&camera, &pose, pattern, 0.028);
        let corners = ChessboardDetector::default().detect(&frame, pattern).corners;

        assert_eq!(corners.len(), 54);
        for row in corners.chunks(9) {
            for pair in row.windows(2) {
                assert!(pair[1].x > pair[0].x);
            }
        }
        for c in 0..9 {
            for r in 0..5 {
                assert!(corners[(r + 1) * 9 + c].y > corners[r * 9 + c].y);
            }
        }
    }

    #[test]
    fn test_wrong_pattern_size_not_found() {
        let camera = pinhole();
        let pattern = PatternSize::new(9, 6);
        let pose = board_poses(pattern, 0.028, 1, 0.6)[0];
        let frame = render_board(&camera, &pose, pattern, 0.028);

        let detection = ChessboardDetector::default().detect(&frame, PatternSize::new(7, 6));
        assert!(!detection.found);
        assert!(detection.corners.is_empty());
    }

    #[test]
    fn test_blank_frame_not_found() {
        let frame = GrayImage::from_pixel(320, 240, Luma([128]));
        let detection = ChessboardDetector::default().detect(&frame, PatternSize::new(9, 6));
        assert_eq!(detection, Detection::not_found());
    }

    #[test]
    fn test_degenerate_frames_not_found() {
        let detector = ChessboardDetector::default();
        let pattern = PatternSize::new(9, 6);
        for (w, h) in [(0, 0), (1, 1), (2, 2), (5, 5), (640, 1), (0, 480)] {
            let detection = detector.detect(&GrayImage::new(w, h), pattern);
            assert_eq!(detection, Detection::not_found(), "{w}x{h}");
        }
    }

    #[test]
    fn test_params_from_partial_yaml() {
        let params: DetectorParams =
            serde_yaml::from_str("blur_sigma: 1.5\nrefine: false\n").unwrap();
        assert_eq!(params.blur_sigma, 1.5);
        assert!(!params.refine);
        assert_eq!(params.nms_radius, DetectorParams::default().nms_radius);
    }
}
