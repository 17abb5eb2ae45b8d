//! Board-to-camera pose of a single calibration view.

use nalgebra::{Isometry3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transform taking board-frame points into the camera frame.
///
/// The rotation is stored as an axis-angle (Rodrigues) vector, which is the
/// parameterization the optimizer works on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewPose {
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
}

impl ViewPose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: rotation.into(),
            translation: translation.into(),
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self::new(iso.rotation.scaled_axis(), iso.translation.vector)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        let rotation = Rotation3::from_scaled_axis(Vector3::from(self.rotation));
        Isometry3::from_parts(
            Translation3::from(Vector3::from(self.translation)),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }

    /// Maps a board-frame point into the camera frame.
    pub fn transform_point(&self, point: &Point3<f64>) -> Vector3<f64> {
        let rotated = super::rotate_point(&self.rotation, &[point.x, point.y, point.z]);
        Vector3::new(
            rotated[0] + self.translation[0],
            rotated[1] + self.translation[1],
            rotated[2] + self.translation[2],
        )
    }

    /// Parameter block layout used by the optimizer: rotation then translation.
    pub(crate) fn to_params(self) -> [f64; 6] {
        let [rx, ry, rz] = self.rotation;
        let [tx, ty, tz] = self.translation;
        [rx, ry, rz, tx, ty, tz]
    }

    pub(crate) fn from_params(params: &[f64]) -> Self {
        Self {
            rotation: [params[0], params[1], params[2]],
            translation: [params[3], params[4], params[5]],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_isometry_round_trip() {
        let iso = Isometry3::new(Vector3::new(0.1, -0.2, 0.5), Vector3::new(0.2, 0.3, -0.1));
        let pose = ViewPose::from_isometry(&iso);
        let back = pose.to_isometry();

        let p = Point3::new(0.3, 0.1, 0.0);
        let a = iso * p;
        let b = back * p;
        assert_relative_eq!(a.coords, b.coords, epsilon = 1e-12);

        let c = pose.transform_point(&p);
        assert_relative_eq!(a.coords, c, epsilon = 1e-12);
    }

    #[test]
    fn test_param_layout() {
        let pose = ViewPose {
            rotation: [1.0, 2.0, 3.0],
            translation: [4.0, 5.0, 6.0],
        };
        let params = pose.to_params();
        assert_eq!(params, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ViewPose::from_params(&params), pose);
    }
}
