//! The `optimization` module recovers camera geometry from board observations.
//!
//! This module defines the [`Optimizer`] trait, which outlines the common
//! interface of a calibration task, and the planar calibration built on it.
//!
//! Calibration proceeds in two steps:
//! 1. A linear estimation: one homography per view, Zhang's closed form for the
//!    intrinsics and a homography decomposition for each board pose. Distortion
//!    starts at zero.
//! 2. A non-linear Levenberg-Marquardt refinement (tiny-solver) of intrinsics,
//!    distortion and all poses jointly, minimizing the squared reprojection
//!    error of every observed corner.
//!
//! [`calibrate`] runs both steps after checking its preconditions.

use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_solver::optimizer::OptimizerOptions;

pub mod linear;
pub mod planar;

pub use planar::PlanarCalibrationCost;

use crate::camera::{
    CameraModelError, Intrinsics, RadTanModel, Resolution, ViewPose, DISTORTION_COEFFS,
};

/// Minimum number of views accepted by default.
pub const DEFAULT_MIN_VIEWS: usize = 15;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Not enough views: found {found}, need at least {required}")]
    NotEnoughViews { found: usize, required: usize },
    #[error("View {view} has {found} points, expected {expected}")]
    CorrespondenceMismatch {
        view: usize,
        expected: usize,
        found: usize,
    },
    #[error("Degenerate configuration: {0}")]
    Degenerate(String),
    #[error(transparent)]
    CameraModel(#[from] CameraModelError),
}

/// Which distortion coefficients the refinement is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionModel {
    /// `k1, k2, p1, p2, k3`; the rational denominator `k4..k6` stays zero.
    #[default]
    RadTan5,
    /// All of `k1, k2, p1, p2, k3, k4, k5, k6`.
    Rational8,
}

impl DistortionModel {
    pub fn num_coefficients(&self) -> usize {
        match self {
            DistortionModel::RadTan5 => 5,
            DistortionModel::Rational8 => DISTORTION_COEFFS,
        }
    }
}

/// Settings of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub min_views: usize,
    pub distortion_model: DistortionModel,
    pub max_iterations: usize,
    pub min_abs_error_decrease: f64,
    pub min_rel_error_decrease: f64,
    pub min_error: f64,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        let defaults = OptimizerOptions::default();
        Self {
            min_views: DEFAULT_MIN_VIEWS,
            distortion_model: DistortionModel::default(),
            max_iterations: defaults.max_iteration,
            min_abs_error_decrease: defaults.min_abs_error_decrease_threshold,
            min_rel_error_decrease: defaults.min_rel_error_decrease_threshold,
            min_error: defaults.min_error_threshold,
            verbose: false,
        }
    }
}

impl SolverOptions {
    pub(crate) fn to_optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            min_abs_error_decrease_threshold: self.min_abs_error_decrease,
            min_rel_error_decrease_threshold: self.min_rel_error_decrease,
            min_error_threshold: self.min_error,
            ..OptimizerOptions::default()
        }
    }
}

/// Reprojection error statistics, in pixels.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Output of a successful calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub intrinsics: Intrinsics,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub distortion: [f64; DISTORTION_COEFFS],
    pub resolution: Resolution,
    pub distortion_model: DistortionModel,
    /// Board-to-camera pose of every view, in input order.
    pub poses: Vec<ViewPose>,
    /// Root mean square reprojection error over all corners of all views.
    pub rms_error: f64,
    pub per_view_rms: Vec<f64>,
}

impl CalibrationResult {
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    pub fn view_count(&self) -> usize {
        self.poses.len()
    }

    pub fn model(&self) -> Result<RadTanModel, CameraModelError> {
        RadTanModel::from_parts(self.intrinsics, self.distortion, self.resolution)
    }
}

/// A trait for camera calibration tasks.
///
/// Types implementing `Optimizer` hold a dataset of board observations and a
/// current parameter estimate, and refine that estimate in place.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the camera parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at info level.
    ///
    /// # Errors
    ///
    /// Implementations fail only on invalid input; a refinement that does not
    /// improve the estimate keeps the previous one.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes a closed-form initial estimate of all parameters.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Reprojection error statistics of one view.
///
/// # Errors
///
/// * [`CalibrationError::CorrespondenceMismatch`] if the point lists differ in
///   length.
/// * [`CalibrationError::Degenerate`] if there are no points.
pub fn compute_reprojection_error(
    model: &RadTanModel,
    pose: &ViewPose,
    world: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Result<ProjectionError, CalibrationError> {
    if world.len() != image.len() {
        return Err(CalibrationError::CorrespondenceMismatch {
            view: 0,
            expected: world.len(),
            found: image.len(),
        });
    }
    if world.is_empty() {
        return Err(CalibrationError::Degenerate(
            "no points to evaluate".to_string(),
        ));
    }

    let errors: Vec<f64> = world
        .iter()
        .zip(image)
        .map(|(pw, pi)| {
            let projected = model.project_unchecked(&pose.transform_point(pw));
            (projected - pi.coords).norm()
        })
        .collect();

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted = errors;
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

/// Checks view count and per-view point counts before any numeric work.
pub fn validate_observations(
    world_sets: &[Vec<Point3<f64>>],
    image_sets: &[Vec<Point2<f64>>],
    min_views: usize,
) -> Result<(), CalibrationError> {
    if image_sets.len() < min_views {
        return Err(CalibrationError::NotEnoughViews {
            found: image_sets.len(),
            required: min_views,
        });
    }
    if world_sets.len() != image_sets.len() {
        return Err(CalibrationError::CorrespondenceMismatch {
            view: world_sets.len().min(image_sets.len()),
            expected: image_sets.len(),
            found: world_sets.len(),
        });
    }

    let expected = world_sets.first().map_or(0, Vec::len);
    if expected < 4 {
        return Err(CalibrationError::Degenerate(format!(
            "each view needs at least 4 points, got {expected}"
        )));
    }
    for (view, (world, image)) in world_sets.iter().zip(image_sets).enumerate() {
        for found in [world.len(), image.len()] {
            if found != expected {
                return Err(CalibrationError::CorrespondenceMismatch {
                    view,
                    expected,
                    found,
                });
            }
        }
    }
    Ok(())
}

/// Calibrates a camera from planar board observations.
///
/// `world_sets[i]` and `image_sets[i]` are the board points and their detected
/// pixels for view `i`, index-aligned.
///
/// # Errors
///
/// * [`CalibrationError::NotEnoughViews`] with fewer than `options.min_views`
///   views.
/// * [`CalibrationError::CorrespondenceMismatch`] if any view's counts differ.
/// * [`CalibrationError::Degenerate`] if a view's homography cannot be
///   estimated.
pub fn calibrate(
    world_sets: &[Vec<Point3<f64>>],
    image_sets: &[Vec<Point2<f64>>],
    resolution: Resolution,
    options: &SolverOptions,
) -> Result<CalibrationResult, CalibrationError> {
    validate_observations(world_sets, image_sets, options.min_views)?;

    let mut cost = PlanarCalibrationCost::new(
        world_sets.to_vec(),
        image_sets.to_vec(),
        resolution,
        options.clone(),
    );
    cost.linear_estimation()?;
    cost.optimize(options.verbose)?;
    cost.result()
}
