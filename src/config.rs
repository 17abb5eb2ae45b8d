//! Session configuration.
//!
//! All fields have defaults, so a YAML file only needs the values it changes:
//!
//! ```yaml
//! pattern_width: 7
//! square_size: 0.025
//! solver:
//!   min_views: 10
//!   distortion_model: rational8
//! ```
//!
//! Unknown keys are rejected so a misplaced setting is not silently ignored.

use crate::board::{BoardError, BoardGeometry, PatternSize};
use crate::detection::DetectorParams;
use crate::optimization::SolverOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Inner corners per board row.
    pub pattern_width: usize,
    /// Inner corners per board column.
    pub pattern_height: usize,
    /// Square edge length in meters.
    pub square_size: f64,
    pub frames_per_second: u32,
    pub output_path: PathBuf,
    pub solver: SolverOptions,
    pub detector: DetectorParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pattern_width: 9,
            pattern_height: 6,
            square_size: 0.028,
            frames_per_second: 20,
            output_path: PathBuf::from("CameraCalibration.txt"),
            solver: SolverOptions::default(),
            detector: DetectorParams::default(),
        }
    }
}

impl SessionConfig {
    /// Loads a configuration from a YAML file. Missing keys keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Io`] if the file cannot be read.
    /// * [`ConfigError::Yaml`] if the contents are not valid YAML for this type.
    /// * [`ConfigError::Invalid`] if a value is out of range.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_per_second == 0 {
            return Err(ConfigError::Invalid(
                "frames_per_second must be positive".to_string(),
            ));
        }
        if self.solver.min_views == 0 {
            return Err(ConfigError::Invalid("min_views must be positive".to_string()));
        }
        self.board()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn pattern_size(&self) -> PatternSize {
        PatternSize::new(self.pattern_width, self.pattern_height)
    }

    pub fn board(&self) -> Result<BoardGeometry, BoardError> {
        BoardGeometry::new(self.pattern_size(), self.square_size)
    }

    /// Views required before a calibration is attempted.
    pub fn min_views(&self) -> usize {
        self.solver.min_views
    }

    /// Time to wait for user input after each frame.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frames_per_second.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::DistortionModel;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.pattern_size(), PatternSize::new(9, 6));
        assert_eq!(config.square_size, 0.028);
        assert_eq!(config.min_views(), 15);
        assert_eq!(config.frame_interval(), Duration::from_millis(50));
        assert_eq!(config.output_path, PathBuf::from("CameraCalibration.txt"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        fs::write(
            &path,
            "pattern_width: 7\nsolver:\n  min_views: 10\n  distortion_model: rational8\n",
        )
        .unwrap();

        let config = SessionConfig::load_from_yaml(&path).unwrap();
        assert_eq!(config.pattern_size(), PatternSize::new(7, 6));
        assert_eq!(config.solver.distortion_model, DistortionModel::Rational8);
        assert_eq!(config.min_views(), 10);
        assert_eq!(config.frames_per_second, 20);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        let mut config = SessionConfig::default();
        config.square_size = 0.03;
        config.save_to_yaml(&path).unwrap();
        assert_eq!(SessionConfig::load_from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "square_size: -1.0\n").unwrap();
        assert!(matches!(
            SessionConfig::load_from_yaml(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "solver:\n  min_views: 0\n").unwrap();
        assert!(matches!(
            SessionConfig::load_from_yaml(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "pattern_width: [1, 2]\n").unwrap();
        assert!(matches!(
            SessionConfig::load_from_yaml(&path),
            Err(ConfigError::Yaml(_))
        ));

        assert!(matches!(
            SessionConfig::load_from_yaml(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_view_gate_lives_in_solver_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        fs::write(&path, "min_views: 10\n").unwrap();
        assert!(matches!(
            SessionConfig::load_from_yaml(&path),
            Err(ConfigError::Yaml(_))
        ));
    }
}
