//! Closed-form initialization for planar calibration.
//!
//! Board-to-image homographies come from a Hartley-normalized DLT. Intrinsics
//! come from Zhang's closed form over all homographies, with a
//! principal-point-at-center fallback when that system is degenerate. The
//! per-view poses come from decomposing each homography with those intrinsics.

use crate::camera::{Intrinsics, Resolution, ViewPose};
use log::{debug, warn};
use nalgebra::{
    DMatrix, DVector, Matrix3, Point2, Point3, Rotation3, SVector, UnitQuaternion, Vector3,
};

use super::CalibrationError;

/// Index of the smallest singular value.
fn argmin_singular(singular_values: &DVector<f64>) -> Option<usize> {
    singular_values
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

/// Solves `A x = 0` for unit `x` through the normal matrix `AᵀA`.
///
/// Going through `AᵀA` keeps the full right singular basis even when `A` has
/// fewer rows than columns.
fn solve_nullspace(a: &DMatrix<f64>) -> Option<DVector<f64>> {
    let normal = a.transpose() * a;
    let svd = normal.svd(false, true);
    let v_t = svd.v_t.as_ref()?;
    let idx = argmin_singular(&svd.singular_values)?;
    Some(v_t.row(idx).transpose())
}

/// Hartley conditioning: centroid to origin, mean distance `√2`.
fn normalize_points(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (mut cx, mut cy) = (0.0, 0.0);
    for p in points {
        cx += p.x;
        cy += p.y;
    }
    cx /= n;
    cy /= n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let transform = Matrix3::new(
        s, 0.0, -s * cx, //
        0.0, s, -s * cy, //
        0.0, 0.0, 1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Some((normalized, transform))
}

/// Estimates the homography `H` with `image ~ H * [X, Y, 1]` for a planar
/// board (the z coordinate of `world` is ignored).
///
/// # Errors
///
/// * [`CalibrationError::Degenerate`] for fewer than 4 points, collinear or
///   coincident inputs, or a numerically singular system.
pub fn estimate_homography(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Err(CalibrationError::Degenerate(format!(
            "homography needs at least 4 matched points, got {n}"
        )));
    }

    let world_2d: Vec<Point2<f64>> = world.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let degenerate = || CalibrationError::Degenerate("coincident homography points".to_string());
    let (wn, tw) = normalize_points(&world_2d).ok_or_else(degenerate)?;
    let (im, ti) = normalize_points(image).ok_or_else(degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in wn.iter().zip(im.iter()).enumerate() {
        let (x, y, u, v) = (pw.x, pw.y, pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = solve_nullspace(&a)
        .ok_or_else(|| CalibrationError::Degenerate("homography SVD failed".to_string()))?;
    let hn = Matrix3::from_row_slice(h.as_slice());

    let ti_inv = ti
        .try_inverse()
        .ok_or_else(|| CalibrationError::Degenerate("singular image conditioning".to_string()))?;
    let mut hmtx = ti_inv * hn * tw;

    let scale = hmtx[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hmtx /= scale;
    }
    if hmtx.iter().any(|v| !v.is_finite()) {
        return Err(CalibrationError::Degenerate(
            "non-finite homography".to_string(),
        ));
    }
    Ok(hmtx)
}

/// Similarity that maps pixels to a centered frame of unit scale.
///
/// Zhang's system in raw pixel units spans many orders of magnitude; solving it
/// in this frame and mapping back keeps it well conditioned.
fn pixel_conditioning(resolution: &Resolution) -> Matrix3<f64> {
    let w = resolution.width.max(1) as f64;
    let h = resolution.height.max(1) as f64;
    let s = 2.0 / (w + h);
    Matrix3::new(
        s, 0.0, -s * 0.5 * w, //
        0.0, s, -s * 0.5 * h, //
        0.0, 0.0, 1.0,
    )
}

fn v_ij(hmtx: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = hmtx.column(i);
    let hj = hmtx.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang's closed form in the conditioned frame. Skew is dropped.
fn zhang_conditioned(homographies: &[Matrix3<f64>]) -> Option<Intrinsics> {
    if homographies.len() < 3 {
        return None;
    }
    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (k, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let diff = v_ij(h, 0, 0) - v_ij(h, 1, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&diff.transpose());
    }

    let mut b = solve_nullspace(&v)?;
    if b[0] < 0.0 {
        b.neg_mut();
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    if denom_norm <= 0.0 || denom.abs() / denom_norm < 1e-9 || b11 <= 0.0 {
        return None;
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    Some(Intrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
    })
}

/// Focal lengths with the principal point pinned at the image center.
///
/// In the conditioned frame the center is the origin, so the two orthogonality
/// constraints of every homography become linear in `1/fx²` and `1/fy²`.
fn center_fallback_conditioned(homographies: &[Matrix3<f64>]) -> Option<Intrinsics> {
    let mut a = DMatrix::<f64>::zeros(2 * homographies.len(), 2);
    let mut rhs = DVector::<f64>::zeros(2 * homographies.len());
    for (k, h) in homographies.iter().enumerate() {
        let (h1, h2) = (h.column(0), h.column(1));
        a[(2 * k, 0)] = h1[0] * h2[0];
        a[(2 * k, 1)] = h1[1] * h2[1];
        rhs[2 * k] = -h1[2] * h2[2];
        a[(2 * k + 1, 0)] = h1[0] * h1[0] - h2[0] * h2[0];
        a[(2 * k + 1, 1)] = h1[1] * h1[1] - h2[1] * h2[1];
        rhs[2 * k + 1] = -(h1[2] * h1[2] - h2[2] * h2[2]);
    }

    let solution = a.svd(true, true).solve(&rhs, 1e-12).ok()?;
    let (inv_fx2, inv_fy2) = (solution[0], solution[1]);
    if !(inv_fx2 > 0.0 && inv_fy2 > 0.0) {
        return None;
    }
    Some(Intrinsics {
        fx: inv_fx2.sqrt().recip(),
        fy: inv_fy2.sqrt().recip(),
        cx: 0.0,
        cy: 0.0,
    })
}

fn plausible(intrinsics: &Intrinsics, resolution: &Resolution) -> bool {
    let finite = [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy]
        .iter()
        .all(|v| v.is_finite());
    finite
        && intrinsics.fx > 0.0
        && intrinsics.fy > 0.0
        && (0.2..5.0).contains(&(intrinsics.fx / intrinsics.fy))
        && resolution.contains(intrinsics.cx, intrinsics.cy)
}

/// Estimates zero-skew intrinsics from plane homographies.
///
/// Zhang's closed form is tried first. If it is degenerate or its answer is
/// implausible (non-positive focal length, principal point outside the image),
/// the principal point is fixed at the image center and only the focal lengths
/// are solved for. When both fail, a focal length equal to the larger image
/// dimension is assumed.
pub fn estimate_intrinsics(homographies: &[Matrix3<f64>], resolution: &Resolution) -> Intrinsics {
    let n = pixel_conditioning(resolution);
    let n_inv = n.try_inverse().unwrap_or_else(Matrix3::identity);

    let conditioned: Vec<Matrix3<f64>> = homographies
        .iter()
        .map(|h| {
            let hc = n * h;
            let norm = hc.norm();
            if norm > 0.0 {
                hc / norm
            } else {
                hc
            }
        })
        .collect();

    let to_pixels = |k: Intrinsics| -> Intrinsics {
        Intrinsics::from_camera_matrix(&(n_inv * k.camera_matrix()))
    };

    if let Some(k) = zhang_conditioned(&conditioned).map(to_pixels) {
        if plausible(&k, resolution) {
            debug!("Zhang initialization: {k:?}");
            return k;
        }
        warn!("Zhang initialization implausible ({k:?}), pinning principal point at center");
    } else {
        warn!("Zhang initialization degenerate, pinning principal point at center");
    }

    if let Some(k) = center_fallback_conditioned(&conditioned).map(to_pixels) {
        if plausible(&k, resolution) {
            debug!("Center-pinned initialization: {k:?}");
            return k;
        }
    }

    let focal = resolution.width.max(resolution.height) as f64;
    warn!("Focal estimation failed, assuming fx = fy = {focal}");
    Intrinsics {
        fx: focal,
        fy: focal,
        cx: resolution.width as f64 * 0.5,
        cy: resolution.height as f64 * 0.5,
    }
}

/// Decomposes a board homography into the board-to-camera pose.
///
/// The scale is set from the first two rotation columns, the sign so the board
/// lies in front of the camera, and the rotation is projected onto SO(3).
pub fn pose_from_homography(
    intrinsics: &Intrinsics,
    hmtx: &Matrix3<f64>,
) -> Result<ViewPose, CalibrationError> {
    let k_inv = intrinsics
        .camera_matrix()
        .try_inverse()
        .ok_or_else(|| CalibrationError::Degenerate("singular camera matrix".to_string()))?;

    let k_inv_h1 = k_inv * hmtx.column(0);
    let k_inv_h2 = k_inv * hmtx.column(1);
    let k_inv_h3 = k_inv * hmtx.column(2);

    let norm = 0.5 * (k_inv_h1.norm() + k_inv_h2.norm());
    if norm <= f64::EPSILON || !norm.is_finite() {
        return Err(CalibrationError::Degenerate(
            "homography has vanishing rotation columns".to_string(),
        ));
    }
    let mut lambda = 1.0 / norm;
    if (lambda * k_inv_h3).z < 0.0 {
        lambda = -lambda;
    }

    let r1: Vector3<f64> = lambda * k_inv_h1;
    let r2: Vector3<f64> = lambda * k_inv_h2;
    let r3 = r1.cross(&r2);
    let t: Vector3<f64> = lambda * k_inv_h3;

    let r_mat = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r_mat.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(CalibrationError::Degenerate(
            "rotation SVD failed".to_string(),
        ));
    };
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
        r_orth = u * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Ok(ViewPose::new(rotation.scaled_axis(), t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{generate_world_points, PatternSize};
    use approx::assert_relative_eq;
    use nalgebra::Isometry3;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 800.0,
            fy: 790.0,
            cx: 330.0,
            cy: 235.0,
        }
    }

    fn resolution() -> Resolution {
        Resolution {
            width: 640,
            height: 480,
        }
    }

    fn project(k: &Intrinsics, iso: &Isometry3<f64>, world: &[Point3<f64>]) -> Vec<Point2<f64>> {
        world
            .iter()
            .map(|p| {
                let pc = iso * p;
                Point2::new(k.fx * pc.x / pc.z + k.cx, k.fy * pc.y / pc.z + k.cy)
            })
            .collect()
    }

    fn board_pose(roll: f64, pitch: f64, yaw: f64, offset: Vector3<f64>) -> Isometry3<f64> {
        let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
        let center = Vector3::new(4.0 * 0.028, 2.5 * 0.028, 0.0);
        let t = Vector3::new(0.0, 0.0, 0.5) + offset - rotation * center;
        Isometry3::from_parts(t.into(), UnitQuaternion::from_rotation_matrix(&rotation))
    }

    fn poses() -> Vec<Isometry3<f64>> {
        vec![
            board_pose(0.3, 0.0, 0.05, Vector3::new(0.0, 0.0, 0.0)),
            board_pose(-0.25, 0.2, -0.1, Vector3::new(0.02, -0.01, 0.05)),
            board_pose(0.1, -0.3, 0.2, Vector3::new(-0.03, 0.02, -0.03)),
            board_pose(0.0, 0.35, 0.0, Vector3::new(0.01, 0.01, 0.02)),
        ]
    }

    #[test]
    fn test_homography_exact() {
        let world = generate_world_points(PatternSize::new(9, 6), 0.028);
        let k = intrinsics();
        let iso = poses()[1];
        let image = project(&k, &iso, &world);

        let h = estimate_homography(&world, &image).unwrap();
        for (pw, pi) in world.iter().zip(&image) {
            let q = h * Vector3::new(pw.x, pw.y, 1.0);
            assert_relative_eq!(q.x / q.z, pi.x, epsilon = 1e-6);
            assert_relative_eq!(q.y / q.z, pi.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_homography_rejects_few_points() {
        let world = vec![Point3::new(0.0, 0.0, 0.0); 3];
        let image = vec![Point2::new(0.0, 0.0); 3];
        assert!(matches!(
            estimate_homography(&world, &image),
            Err(CalibrationError::Degenerate(_))
        ));
    }

    #[test]
    fn test_zhang_recovers_intrinsics() {
        let world = generate_world_points(PatternSize::new(9, 6), 0.028);
        let k = intrinsics();
        let homographies: Vec<_> = poses()
            .iter()
            .map(|iso| estimate_homography(&world, &project(&k, iso, &world)).unwrap())
            .collect();

        let est = estimate_intrinsics(&homographies, &resolution());
        assert_relative_eq!(est.fx, k.fx, epsilon = 1e-3);
        assert_relative_eq!(est.fy, k.fy, epsilon = 1e-3);
        assert_relative_eq!(est.cx, k.cx, epsilon = 1e-3);
        assert_relative_eq!(est.cy, k.cy, epsilon = 1e-3);
    }

    #[test]
    fn test_center_fallback_when_too_few_views() {
        // Two views cannot determine Zhang's system; the principal point is
        // pinned at the center and focal lengths are still recovered roughly.
        let world = generate_world_points(PatternSize::new(9, 6), 0.028);
        let k = Intrinsics {
            cx: 320.0,
            cy: 240.0,
            ..intrinsics()
        };
        let homographies: Vec<_> = poses()
            .iter()
            .take(2)
            .map(|iso| estimate_homography(&world, &project(&k, iso, &world)).unwrap())
            .collect();

        let est = estimate_intrinsics(&homographies, &resolution());
        assert_relative_eq!(est.cx, 320.0, epsilon = 1e-9);
        assert_relative_eq!(est.cy, 240.0, epsilon = 1e-9);
        assert_relative_eq!(est.fx, k.fx, max_relative = 0.01);
        assert_relative_eq!(est.fy, k.fy, max_relative = 0.01);
    }

    #[test]
    fn test_pose_from_homography() {
        let world = generate_world_points(PatternSize::new(9, 6), 0.028);
        let k = intrinsics();
        for iso in poses() {
            let h = estimate_homography(&world, &project(&k, &iso, &world)).unwrap();
            let pose = pose_from_homography(&k, &h).unwrap();
            let recovered = pose.to_isometry();
            assert!(pose.translation[2] > 0.0);
            assert_relative_eq!(
                recovered.translation.vector,
                iso.translation.vector,
                epsilon = 1e-6
            );
            assert_relative_eq!(
                recovered.rotation.angle_to(&iso.rotation),
                0.0,
                epsilon = 1e-6
            );
        }
    }
}
