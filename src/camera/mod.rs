//! Pinhole camera geometry with lens distortion.
//!
//! Besides the [`CameraModel`] trait and the [`RadTanModel`] implementation,
//! this module holds the scalar-generic projection helpers shared by the f64
//! model and the auto-differentiated residuals of the optimizer.

use nalgebra::{Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod pose;
pub mod rad_tan;

pub use pose::ViewPose;
pub use rad_tan::RadTanModel;

/// Number of coefficients in a full distortion vector
/// `[k1, k2, p1, p2, k3, k4, k5, k6]`.
pub const DISTORTION_COEFFS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Zero-skew camera matrix `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Reads fx, fy, cx, cy back out of a camera matrix. Skew is ignored.
    pub fn from_camera_matrix(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width as f64 && v >= 0.0 && v < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Distortion coefficients must be finite")]
    DistortionMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(distortion: &[f64]) -> Result<(), CameraModelError> {
        if distortion.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::DistortionMustBeFinite);
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn scalar<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Applies the rational radial and tangential distortion to a normalized
/// image point.
///
/// `dist` is read as `[k1, k2, p1, p2, k3, k4, k5, k6]`. Shorter slices are
/// allowed; any missing coefficient counts as zero, so a 5-element slice is the
/// classic Brown-Conrady model.
pub fn distort_normalized<T: RealField>(x: T, y: T, dist: &[T]) -> (T, T) {
    let coeff = |i: usize| -> T {
        if i < dist.len() {
            dist[i].clone()
        } else {
            T::zero()
        }
    };
    let (k1, k2, p1, p2, k3) = (coeff(0), coeff(1), coeff(2), coeff(3), coeff(4));
    let (k4, k5, k6) = (coeff(5), coeff(6), coeff(7));

    let two = scalar::<T>(2.0);
    let xy = x.clone() * y.clone();
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();
    let r2 = x2.clone() + y2.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = T::one() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone();
    let denominator = T::one() + k4 * r2.clone() + k5 * r4 + k6 * r6;
    let radial = numerator / denominator;

    let xd = x * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x2);
    let yd = y * radial + p1 * (r2 + two.clone() * y2) + two * p2 * xy;
    (xd, yd)
}

/// Projects a camera-frame point through the pinhole and distortion model.
///
/// `intrinsics` is `[fx, fy, cx, cy]`. The depth is clamped away from zero so
/// the function stays finite for every input.
pub fn distort_and_project<T: RealField>(
    point: &[T; 3],
    intrinsics: &[T],
    dist: &[T],
) -> (T, T) {
    let eps = scalar::<T>(1e-12);
    let z = if point[2].clone() > eps.clone() {
        point[2].clone()
    } else {
        eps
    };
    let x = point[0].clone() / z.clone();
    let y = point[1].clone() / z;
    let (xd, yd) = distort_normalized(x, y, dist);
    (
        intrinsics[0].clone() * xd + intrinsics[2].clone(),
        intrinsics[1].clone() * yd + intrinsics[3].clone(),
    )
}

/// Rotates `p` by the axis-angle vector `r` (Rodrigues formula).
pub fn rotate_point<T: RealField>(r: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let theta2 =
        r[0].clone() * r[0].clone() + r[1].clone() * r[1].clone() + r[2].clone() * r[2].clone();

    let cross = |a: &[T; 3], b: &[T; 3]| -> [T; 3] {
        [
            a[1].clone() * b[2].clone() - a[2].clone() * b[1].clone(),
            a[2].clone() * b[0].clone() - a[0].clone() * b[2].clone(),
            a[0].clone() * b[1].clone() - a[1].clone() * b[0].clone(),
        ]
    };

    if theta2.clone() > scalar::<T>(1e-12) {
        let theta = theta2.sqrt();
        let k = [
            r[0].clone() / theta.clone(),
            r[1].clone() / theta.clone(),
            r[2].clone() / theta.clone(),
        ];
        let (sin, cos) = (theta.clone().sin(), theta.cos());
        let k_cross_p = cross(&k, p);
        let k_dot_p =
            k[0].clone() * p[0].clone() + k[1].clone() * p[1].clone() + k[2].clone() * p[2].clone();
        let one_minus_cos = T::one() - cos.clone();
        [
            p[0].clone() * cos.clone()
                + k_cross_p[0].clone() * sin.clone()
                + k[0].clone() * k_dot_p.clone() * one_minus_cos.clone(),
            p[1].clone() * cos.clone()
                + k_cross_p[1].clone() * sin.clone()
                + k[1].clone() * k_dot_p.clone() * one_minus_cos.clone(),
            p[2].clone() * cos
                + k_cross_p[2].clone() * sin
                + k[2].clone() * k_dot_p * one_minus_cos,
        ]
    } else {
        // First-order expansion near the identity.
        let r_cross_p = cross(r, p);
        [
            p[0].clone() + r_cross_p[0].clone(),
            p[1].clone() + r_cross_p[1].clone(),
            p[2].clone() + r_cross_p[2].clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn test_distortion_prefix_matches_full_vector() {
        let short = [-0.2, 0.05, 0.001, -0.002, 0.01];
        let full = [-0.2, 0.05, 0.001, -0.002, 0.01, 0.0, 0.0, 0.0];
        let a = distort_normalized(0.3, -0.2, &short);
        let b = distort_normalized(0.3, -0.2, &full);
        assert_relative_eq!(a.0, b.0);
        assert_relative_eq!(a.1, b.1);
    }

    #[test]
    fn test_rational_denominator() {
        // Only k4 set: radial factor is 1 / (1 + k4 r^2)
        let dist = [0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0];
        let (xd, yd) = distort_normalized(0.2, 0.1, &dist);
        let r2 = 0.05;
        assert_relative_eq!(xd, 0.2 / (1.0 + 0.5 * r2), epsilon = 1e-15);
        assert_relative_eq!(yd, 0.1 / (1.0 + 0.5 * r2), epsilon = 1e-15);
    }

    #[test]
    fn test_rotate_point_matches_nalgebra() {
        let r = [0.1, -0.3, 0.25];
        let p = [0.4, 1.2, -0.7];
        let rotated = rotate_point(&r, &p);
        let expected = Rotation3::from_scaled_axis(Vector3::new(r[0], r[1], r[2]))
            * Vector3::new(p[0], p[1], p[2]);
        assert_relative_eq!(rotated[0], expected.x, epsilon = 1e-12);
        assert_relative_eq!(rotated[1], expected.y, epsilon = 1e-12);
        assert_relative_eq!(rotated[2], expected.z, epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_point_small_angle() {
        let rotated = rotate_point(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(rotated, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_camera_matrix_round_trip() {
        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 790.0,
            cx: 330.0,
            cy: 235.0,
        };
        let k = intrinsics.camera_matrix();
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(k[(0, 1)], 0.0);
        assert_eq!(Intrinsics::from_camera_matrix(&k), intrinsics);
    }

    #[test]
    fn test_validate_intrinsics() {
        let mut intrinsics = Intrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert!(validation::validate_intrinsics(&intrinsics).is_ok());
        intrinsics.fx = -1.0;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
        intrinsics.fx = f64::NAN;
        assert!(validation::validate_intrinsics(&intrinsics).is_err());
        intrinsics.fx = 500.0;
        intrinsics.cy = f64::INFINITY;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));
    }
}
