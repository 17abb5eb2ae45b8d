//! Checkerboard Camera Calibration Library
//!
//! Estimates a pinhole camera's intrinsics and lens distortion from images of
//! a planar checkerboard. The library provides:
//! - Board geometry and 3D-2D correspondences
//! - A checkerboard inner-corner detector
//! - Zhang's closed-form initialization refined by Levenberg-Marquardt over
//!   intrinsics, 8 distortion coefficients and all board poses, using the
//!   tiny-solver optimization framework
//! - A plain-text calibration file format plus YAML/JSON reports
//! - An interactive capture session driven by frame sources and user signals

pub mod board;
pub mod camera;
pub mod config;
pub mod correspondence;
pub mod detection;
pub mod optimization;
pub mod session;
pub mod store;
pub mod synthetic;

// Re-export commonly used types
pub use board::{generate_world_points, BoardError, BoardGeometry, PatternSize};
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution, ViewPose};
pub use config::{ConfigError, SessionConfig};
pub use correspondence::{build_correspondences, CorrespondenceSet, ViewSource};
pub use detection::{ChessboardDetector, Detection, DetectorParams, PatternDetector};
pub use optimization::{
    calibrate, CalibrationError, CalibrationResult, DistortionModel, Optimizer,
    PlanarCalibrationCost, SolverOptions,
};
pub use session::{CaptureSession, SessionEnd, SessionError, UserSignal, View};
pub use store::StoreError;
