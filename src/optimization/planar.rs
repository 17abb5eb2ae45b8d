//! Cost function and optimization routines for planar-target calibration.
//!
//! It uses the `tiny_solver` crate for non-linear optimization. The problem has
//! one `intrinsics` block `[fx, fy, cx, cy]`, one `distortion` block (5 or 8
//! coefficients depending on
//! [`DistortionModel`](crate::optimization::DistortionModel)) and one
//! `pose_<i>` block `[rx, ry, rz, tx, ty, tz]` per view, tied together by a
//! two-dimensional residual for every observed corner.

use crate::camera::{
    distort_and_project, rotate_point, scalar, CameraModel, Intrinsics, RadTanModel, Resolution,
    ViewPose, DISTORTION_COEFFS,
};
use crate::optimization::{
    compute_reprojection_error, linear, CalibrationError, CalibrationResult, Optimizer,
    SolverOptions,
};

use log::{debug, info, warn};
use nalgebra::{DVector, Point2, Point3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::Optimizer as TinySolverOptimizer;
use tiny_solver::LevenbergMarquardtOptimizer;

const INTRINSICS_KEY: &str = "intrinsics";
const DISTORTION_KEY: &str = "distortion";

fn pose_key(view: usize) -> String {
    format!("pose_{view}")
}

/// Reprojection residual of one board corner in one view.
#[derive(Debug, Clone)]
struct PlanarReprojectionFactor {
    world: [f64; 3],
    observed: [f64; 2],
}

impl<T: nalgebra::RealField> Factor<T> for PlanarReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let intrinsics = &params[0];
        let distortion = &params[1];
        let pose = &params[2];

        let rotation = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let world = [
            scalar::<T>(self.world[0]),
            scalar::<T>(self.world[1]),
            scalar::<T>(self.world[2]),
        ];
        let rotated = rotate_point(&rotation, &world);
        let camera = [
            rotated[0].clone() + pose[3].clone(),
            rotated[1].clone() + pose[4].clone(),
            rotated[2].clone() + pose[5].clone(),
        ];

        let (u, v) = distort_and_project(&camera, intrinsics.as_slice(), distortion.as_slice());
        DVector::from_vec(vec![
            u - scalar::<T>(self.observed[0]),
            v - scalar::<T>(self.observed[1]),
        ])
    }
}

/// Planar calibration problem and its current estimate.
///
/// Holds the board points and detections of every view together with the
/// camera model and per-view poses being refined. It implements the
/// [`Optimizer`] trait.
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    model: RadTanModel,
    poses: Vec<ViewPose>,
    world_sets: Vec<Vec<Point3<f64>>>,
    image_sets: Vec<Vec<Point2<f64>>>,
    options: SolverOptions,
}

impl PlanarCalibrationCost {
    /// Creates the problem with a placeholder estimate centred in the image.
    ///
    /// Call [`Optimizer::linear_estimation`] before [`Optimizer::optimize`].
    pub fn new(
        world_sets: Vec<Vec<Point3<f64>>>,
        image_sets: Vec<Vec<Point2<f64>>>,
        resolution: Resolution,
        options: SolverOptions,
    ) -> Self {
        let focal = resolution.width.max(resolution.height).max(1) as f64;
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: focal,
                fy: focal,
                cx: resolution.width as f64 * 0.5,
                cy: resolution.height as f64 * 0.5,
            },
            resolution,
            distortions: [0.0; DISTORTION_COEFFS],
        };
        Self {
            model,
            poses: Vec::new(),
            world_sets,
            image_sets,
            options,
        }
    }

    pub fn get_model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn poses(&self) -> &[ViewPose] {
        &self.poses
    }

    /// RMS over all corners and the RMS of every view for a given estimate.
    fn evaluate(
        &self,
        model: &RadTanModel,
        poses: &[ViewPose],
    ) -> Result<(f64, Vec<f64>), CalibrationError> {
        let mut per_view = Vec::with_capacity(poses.len());
        let mut sum_squared = 0.0;
        let mut count = 0usize;
        for (view, pose) in poses.iter().enumerate() {
            let stats = compute_reprojection_error(
                model,
                pose,
                &self.world_sets[view],
                &self.image_sets[view],
            )?;
            let n = self.image_sets[view].len();
            sum_squared += stats.rmse * stats.rmse * n as f64;
            count += n;
            per_view.push(stats.rmse);
        }
        if count == 0 {
            return Err(CalibrationError::Degenerate(
                "no observations to evaluate".to_string(),
            ));
        }
        Ok(((sum_squared / count as f64).sqrt(), per_view))
    }

    /// Packages the current estimate with its reprojection statistics.
    pub fn result(&self) -> Result<CalibrationResult, CalibrationError> {
        if self.poses.len() != self.image_sets.len() {
            return Err(CalibrationError::Degenerate(
                "no estimate available, run linear_estimation first".to_string(),
            ));
        }
        let (rms_error, per_view_rms) = self.evaluate(&self.model, &self.poses)?;
        Ok(CalibrationResult {
            intrinsics: self.model.intrinsics,
            distortion: self.model.distortions,
            resolution: self.model.resolution,
            distortion_model: self.options.distortion_model,
            poses: self.poses.clone(),
            rms_error,
            per_view_rms,
        })
    }

    fn initial_values(&self) -> HashMap<String, DVector<f64>> {
        let num_coeffs = self.options.distortion_model.num_coefficients();
        let intrinsics = &self.model.intrinsics;

        let mut values = HashMap::new();
        values.insert(
            INTRINSICS_KEY.to_string(),
            DVector::from_vec(vec![
                intrinsics.fx,
                intrinsics.fy,
                intrinsics.cx,
                intrinsics.cy,
            ]),
        );
        values.insert(
            DISTORTION_KEY.to_string(),
            DVector::from_column_slice(&self.model.distortions[..num_coeffs]),
        );
        for (view, pose) in self.poses.iter().enumerate() {
            values.insert(pose_key(view), DVector::from_row_slice(&pose.to_params()));
        }
        values
    }

    fn build_problem(&self) -> tiny_solver::problem::Problem {
        let mut problem = tiny_solver::problem::Problem::new();
        for (view, (world, image)) in self.world_sets.iter().zip(&self.image_sets).enumerate() {
            let key = pose_key(view);
            for (pw, pi) in world.iter().zip(image) {
                let factor = PlanarReprojectionFactor {
                    world: [pw.x, pw.y, pw.z],
                    observed: [pi.x, pi.y],
                };
                problem.add_residual_block(
                    2,
                    &[INTRINSICS_KEY, DISTORTION_KEY, key.as_str()],
                    Box::new(factor),
                    None,
                );
            }
        }
        problem
    }

    /// Reads an optimizer solution back into a model and pose list.
    fn decode(
        &self,
        solution: &HashMap<String, DVector<f64>>,
    ) -> Option<(RadTanModel, Vec<ViewPose>)> {
        let intrinsics = solution.get(INTRINSICS_KEY)?;
        let distortion = solution.get(DISTORTION_KEY)?;

        let mut distortions = [0.0; DISTORTION_COEFFS];
        for (slot, value) in distortions.iter_mut().zip(distortion.iter()) {
            *slot = *value;
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: intrinsics[0],
                fy: intrinsics[1],
                cx: intrinsics[2],
                cy: intrinsics[3],
            },
            resolution: self.model.resolution,
            distortions,
        };

        let poses = (0..self.poses.len())
            .map(|view| {
                solution
                    .get(&pose_key(view))
                    .map(|p| ViewPose::from_params(p.as_slice()))
            })
            .collect::<Option<Vec<_>>>()?;
        Some((model, poses))
    }
}

impl fmt::Debug for PlanarCalibrationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PlanarCalibrationCost Summary:\n model: {:?}\n views: {}, points: {}, distortion: {:?}",
            self.model,
            self.image_sets.len(),
            self.image_sets.iter().map(Vec::len).sum::<usize>(),
            self.options.distortion_model,
        )
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Jointly refines intrinsics, distortion and poses with Levenberg-Marquardt.
    ///
    /// The refined estimate replaces the current one only if it is valid and
    /// does not increase the RMS reprojection error; otherwise the current
    /// estimate is kept and a warning is logged.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.poses.len() != self.image_sets.len() {
            return Err(CalibrationError::Degenerate(
                "no initial estimate, run linear_estimation first".to_string(),
            ));
        }

        let (initial_rms, _) = self.evaluate(&self.model, &self.poses)?;
        if verbose {
            info!("Starting planar calibration refinement...");
            info!("Initial model: {:?}", self.model);
            info!("Initial RMS reprojection error: {initial_rms:.4} px");
        }

        let problem = self.build_problem();
        let initial_values = self.initial_values();
        let optimizer = LevenbergMarquardtOptimizer::default();
        let Some(solution) = optimizer.optimize(
            &problem,
            &initial_values,
            Some(self.options.to_optimizer_options()),
        ) else {
            warn!("Levenberg-Marquardt returned no solution, keeping the linear estimate");
            return Ok(());
        };

        let Some((model, poses)) = self.decode(&solution) else {
            warn!("Optimizer solution is missing parameter blocks, keeping the linear estimate");
            return Ok(());
        };
        if let Err(e) = model.validate_params() {
            warn!("Refined model is invalid ({e}), keeping the linear estimate");
            return Ok(());
        }

        let (refined_rms, _) = self.evaluate(&model, &poses)?;
        if !refined_rms.is_finite() || refined_rms > initial_rms {
            warn!(
                "Refinement did not improve the estimate ({initial_rms:.4} -> {refined_rms:.4} px), keeping the linear estimate"
            );
            return Ok(());
        }

        self.model = model;
        self.poses = poses;

        if verbose {
            info!("Planar calibration refinement finished");
            info!("Optimized model: {:?}", self.model);
            info!("Final RMS reprojection error: {refined_rms:.4} px");
        }
        Ok(())
    }

    /// Zhang initialization of intrinsics and per-view poses, zero distortion.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        if self.world_sets.len() != self.image_sets.len() || self.image_sets.is_empty() {
            return Err(CalibrationError::Degenerate(
                "linear estimation needs matching, non-empty view lists".to_string(),
            ));
        }

        let homographies = self
            .world_sets
            .iter()
            .zip(&self.image_sets)
            .map(|(world, image)| linear::estimate_homography(world, image))
            .collect::<Result<Vec<_>, _>>()?;

        let intrinsics = linear::estimate_intrinsics(&homographies, &self.model.resolution);
        let poses = homographies
            .iter()
            .map(|h| linear::pose_from_homography(&intrinsics, h))
            .collect::<Result<Vec<_>, _>>()?;

        self.model.intrinsics = intrinsics;
        self.model.distortions = [0.0; DISTORTION_COEFFS];
        self.poses = poses;
        self.model.validate_params()?;

        debug!(
            "Linear estimation over {} views: {:?}",
            self.poses.len(),
            self.model
        );
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.model.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.get_distortion()
    }
}
