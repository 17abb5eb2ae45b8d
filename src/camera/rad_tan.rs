//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct: a pinhole camera with the
//! rational radial and tangential lens distortion produced by checkerboard
//! calibration. It adheres to the [`CameraModel`] trait defined in the parent
//! `camera` module ([`crate::camera`]).

use crate::camera::{
    distort_and_project, distort_normalized, validation, CameraModel, CameraModelError,
    Intrinsics, Resolution, DISTORTION_COEFFS,
};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// This struct holds the intrinsic parameters (focal length, principal point),
/// image resolution, and the 8 distortion coefficients of the rational model.
///
/// The distortion coefficients are stored as `[k1, k2, p1, p2, k3, k4, k5, k6]`:
/// *   `k1`, `k2`, `k3`: Radial numerator coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
/// *   `k4`, `k5`, `k6`: Radial denominator coefficients. Zero for the classic
///     five-term model.
///
/// # Examples
///
/// ```rust
/// use checkerboard_calib::camera::rad_tan::RadTanModel;
/// use checkerboard_calib::camera::{Intrinsics, Resolution};
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// // k1, k2, p1, p2, k3 with the rational denominator terms left at zero
/// let distortions = [0.1, -0.05, 0.001, 0.001, 0.02, 0.0, 0.0, 0.0];
/// let resolution = Resolution { width: 640, height: 480 };
/// let model = RadTanModel::from_parts(intrinsics, distortions, resolution).unwrap();
///
/// assert_eq!(model.camera_matrix()[(0, 0)], 500.0);
/// assert_eq!(model.distortions[0], 0.1); // k1
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The distortion coefficients `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub distortions: [f64; DISTORTION_COEFFS],
}

impl RadTanModel {
    /// Builds a model directly from its parts.
    pub fn from_parts(
        intrinsics: Intrinsics,
        distortions: [f64; DISTORTION_COEFFS],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = Self {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Zero-skew 3x3 camera matrix.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    /// Projects a camera-frame point without the image bounds check.
    ///
    /// Used for reprojection statistics, where a point projecting slightly
    /// outside the image still has a meaningful residual.
    pub fn project_unchecked(&self, point_3d: &Vector3<f64>) -> Vector2<f64> {
        let intrinsics = [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
        ];
        let (u, v) = distort_and_project(
            &[point_3d.x, point_3d.y, point_3d.z],
            &intrinsics,
            &self.distortions,
        );
        Vector2::new(u, v)
    }

    /// Removes lens distortion from a normalized image point.
    ///
    /// Newton iterations on `distort(p) - target` with a central-difference
    /// Jacobian, starting from the distorted point itself.
    pub fn undistort_normalized(
        &self,
        target: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        const EPS: f64 = 1e-10;
        const STEP: f64 = 1e-7;
        const MAX_ITERATIONS: u32 = 100;

        let distort = |p: &Vector2<f64>| -> Vector2<f64> {
            let (x, y) = distort_normalized(p.x, p.y, &self.distortions);
            Vector2::new(x, y)
        };

        let mut point = *target;
        for _ in 0..MAX_ITERATIONS {
            let error = distort(&point) - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            let dx = Vector2::new(STEP, 0.0);
            let dy = Vector2::new(0.0, STEP);
            let col_x = (distort(&(point + dx)) - distort(&(point - dx))) / (2.0 * STEP);
            let col_y = (distort(&(point + dy)) - distort(&(point - dy))) / (2.0 * STEP);
            let jacobian = Matrix2::from_columns(&[col_x, col_y]);

            let Some(inv_jacobian) = jacobian.try_inverse() else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            };
            let delta = inv_jacobian * error;
            point -= delta;
            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Unprojection did not converge after {MAX_ITERATIONS} iterations."
        )))
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates, applying distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: If the projected 2D point falls outside the camera's resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let projected = self.project_unchecked(point_3d);
        if !self.resolution.contains(projected.x, projected.y) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(projected)
    }

    /// Unprojects a distorted pixel to a unit-length ray in camera coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: If the input 2D point is outside the camera's resolution.
    /// * [`CameraModelError::NumericalError`]: If the iterative undistortion fails to converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d.x, point_2d.y) {
            return Err(CameraModelError::PointIsOutSideImage);
        }

        let target = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let point = self.undistort_normalized(&target)?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    /// Checks the intrinsics and requires finite distortion coefficients.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)?;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    /// Returns `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}
