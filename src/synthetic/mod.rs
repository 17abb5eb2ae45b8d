//! Deterministic synthetic calibration data.
//!
//! Board poses, ideal corner projections and anti-aliased renderings of a
//! checkerboard as seen by a [`RadTanModel`]. Used by the tests, the session
//! integration test and the `demo` command.

use crate::board::PatternSize;
use crate::camera::{Intrinsics, RadTanModel, Resolution, ViewPose};
use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector2, Vector3};

const DARK: f64 = 30.0;
const LIGHT: f64 = 220.0;
const BACKGROUND: f64 = 100.0;

/// Sub-sample offsets used for anti-aliasing, in pixels.
const SUBSAMPLES: [f64; 3] = [-1.0 / 3.0, 0.0, 1.0 / 3.0];

/// A small camera used by the demo and the session tests.
pub fn demo_camera() -> RadTanModel {
    RadTanModel {
        intrinsics: Intrinsics {
            fx: 300.0,
            fy: 298.0,
            cx: 161.5,
            cy: 118.0,
        },
        resolution: Resolution {
            width: 320,
            height: 240,
        },
        distortions: [-0.12, 0.03, 0.0005, -0.0004, 0.0, 0.0, 0.0, 0.0],
    }
}

/// Board poses with varied tilts, centred `distance` in front of the camera.
///
/// Pose `i` rotates the board by a few tenths of a radian around each axis
/// and shifts it slightly off-axis, so any set of three or more poses
/// constrains the intrinsics.
pub fn board_poses(
    pattern: PatternSize,
    square_size: f64,
    views: usize,
    distance: f64,
) -> Vec<ViewPose> {
    let center = Vector3::new(
        (pattern.width - 1) as f64 * square_size / 2.0,
        (pattern.height - 1) as f64 * square_size / 2.0,
        0.0,
    );
    (0..views)
        .map(|i| {
            let k = i as f64;
            let rotation = Rotation3::from_euler_angles(
                0.35 * (k * 1.3).sin(),
                0.35 * (k * 0.9).cos(),
                0.2 * (k * 0.7).sin(),
            );
            let offset = Vector3::new(
                0.06 * (k * 1.7).sin(),
                0.04 * (k * 1.1).cos(),
                0.1 * (k * 0.5).sin(),
            ) * distance;
            let translation = Vector3::new(0.0, 0.0, distance) + offset - rotation * center;
            ViewPose::new(rotation.scaled_axis(), translation)
        })
        .collect()
}

/// Ideal pixel positions of `world` seen from `pose`.
pub fn project_board(
    model: &RadTanModel,
    pose: &ViewPose,
    world: &[Point3<f64>],
) -> Vec<Point2<f64>> {
    world
        .iter()
        .map(|p| Point2::from(model.project_unchecked(&pose.transform_point(p))))
        .collect()
}

fn board_shade(x: f64, y: f64, pattern: PatternSize, square_size: f64) -> f64 {
    let e = square_size;
    let (w, h) = (pattern.width as f64, pattern.height as f64);
    let in_squares = x >= -e && x < w * e && y >= -e && y < h * e;
    if in_squares {
        let parity = (x / e).floor() as i64 + (y / e).floor() as i64;
        return if parity.rem_euclid(2) == 0 { DARK } else { LIGHT };
    }
    let in_margin = x >= -2.0 * e && x < (w + 1.0) * e && y >= -2.0 * e && y < (h + 1.0) * e;
    if in_margin {
        LIGHT
    } else {
        BACKGROUND
    }
}

/// Renders the board as seen by `model` from `pose`.
///
/// The board has `pattern` inner corners, a one-square white border and sits
/// on a uniform grey background. Each pixel averages a 3x3 grid of
/// sub-samples; pixel centres are at integer coordinates, matching
/// [`project_board`].
pub fn render_board(
    model: &RadTanModel,
    pose: &ViewPose,
    pattern: PatternSize,
    square_size: f64,
) -> GrayImage {
    let Resolution { width, height } = model.resolution;
    let background = GrayImage::from_pixel(width, height, Luma([BACKGROUND as u8]));

    let rotation = Rotation3::from_scaled_axis(Vector3::from(pose.rotation));
    let r = rotation.matrix();
    let t = Vector3::from(pose.translation);
    let plane_to_ray =
        Matrix3::from_columns(&[r.column(0).into_owned(), r.column(1).into_owned(), t]);
    let Some(ray_to_plane) = plane_to_ray.try_inverse() else {
        return background;
    };

    let Intrinsics { fx, fy, cx, cy } = model.intrinsics;
    let undistorted_rays: Vec<Option<Vector2<f64>>> = (0..height)
        .flat_map(|v| (0..width).map(move |u| (u, v)))
        .map(|(u, v)| {
            let distorted = Vector2::new((u as f64 - cx) / fx, (v as f64 - cy) / fy);
            model.undistort_normalized(&distorted).ok()
        })
        .collect();

    GrayImage::from_fn(width, height, |u, v| {
        let Some(ray) = undistorted_rays[(v * width + u) as usize] else {
            return Luma([BACKGROUND as u8]);
        };
        let mut acc = 0.0;
        for sy in SUBSAMPLES {
            for sx in SUBSAMPLES {
                // Distortion barely changes over a third of a pixel.
                let dir = Vector3::new(ray.x + sx / fx, ray.y + sy / fy, 1.0);
                let plane = ray_to_plane * dir;
                acc += if plane.z > 1e-12 {
                    board_shade(plane.x / plane.z, plane.y / plane.z, pattern, square_size)
                } else {
                    BACKGROUND
                };
            }
        }
        Luma([(acc / 9.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// Renders `views` frames of the demo board together with the ideal corner
/// positions of each.
pub fn render_sequence(
    model: &RadTanModel,
    pattern: PatternSize,
    square_size: f64,
    views: usize,
    distance: f64,
) -> Vec<(GrayImage, Vec<Point2<f64>>)> {
    let world = crate::board::generate_world_points(pattern, square_size);
    board_poses(pattern, square_size, views, distance)
        .iter()
        .map(|pose| {
            (
                render_board(model, pose, pattern, square_size),
                project_board(model, pose, &world),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::generate_world_points;
    use crate::camera::CameraModel;

    #[test]
    fn test_poses_face_the_camera() {
        let pattern = PatternSize::new(9, 6);
        let world = generate_world_points(pattern, 0.028);
        for pose in board_poses(pattern, 0.028, 20, 0.45) {
            for p in &world {
                assert!(pose.transform_point(p).z > 0.3);
            }
        }
    }

    #[test]
    fn test_projected_corners_inside_image() {
        let camera = demo_camera();
        camera.validate_params().unwrap();
        let pattern = PatternSize::new(9, 6);
        let world = generate_world_points(pattern, 0.028);
        for pose in board_poses(pattern, 0.028, 20, 0.45) {
            for p in project_board(&camera, &pose, &world) {
                assert!(camera.resolution.contains(p.x, p.y), "{p:?}");
            }
        }
    }

    #[test]
    fn test_render_colours() {
        let camera = demo_camera();
        let pattern = PatternSize::new(9, 6);
        let pose = board_poses(pattern, 0.028, 1, 0.45)[0];
        let frame = render_board(&camera, &pose, pattern, 0.028);
        assert_eq!(frame.dimensions(), (320, 240));

        // The image corner sees the background.
        assert_eq!(frame.get_pixel(0, 0)[0], BACKGROUND as u8);

        // Centre of the first (dark) square right of and below corner 0.
        let world = [Point3::new(0.014, 0.014, 0.0), Point3::new(0.042, 0.014, 0.0)];
        let centres = project_board(&camera, &pose, &world);
        let dark = frame.get_pixel(centres[0].x.round() as u32, centres[0].y.round() as u32)[0];
        let light = frame.get_pixel(centres[1].x.round() as u32, centres[1].y.round() as u32)[0];
        assert_eq!(dark, DARK as u8);
        assert_eq!(light, LIGHT as u8);
    }
}
