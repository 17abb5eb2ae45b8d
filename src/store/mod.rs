//! Persistence of calibration results.
//!
//! The primary format is a small text file holding the camera matrix and the
//! distortion coefficients:
//!
//! ```text
//! ######## Camera Matrix ##########
//! m00     m01     m02
//! m10     m11     m12
//! m20     m21     m22
//! ######## Distortion Coefficients ##########
//! d0     d1     d2     d3     d4     d5     d6     d7
//! ```
//!
//! Every value is followed by five spaces. Values are written with Rust's
//! shortest round-trip float formatting, so a load after a save reproduces the
//! exact matrices. Full reports with poses and per-view errors are written as
//! YAML or JSON.

use crate::camera::DISTORTION_COEFFS;
use crate::optimization::CalibrationResult;
use log::info;
use nalgebra::Matrix3;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const CAMERA_MATRIX_HEADER: &str = "######## Camera Matrix ##########";
pub const DISTORTION_HEADER: &str = "######## Distortion Coefficients ##########";
const VALUE_SEPARATOR: &str = "     ";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed calibration file: {0}")]
    Parse(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Renders the text layout without touching the filesystem.
pub fn format_calibration(
    camera_matrix: &Matrix3<f64>,
    distortion: &[f64; DISTORTION_COEFFS],
) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out, "{CAMERA_MATRIX_HEADER}");
    for row in 0..3 {
        for col in 0..3 {
            let _ = write!(out, "{}{VALUE_SEPARATOR}", camera_matrix[(row, col)]);
        }
        out.push('\n');
    }
    let _ = writeln!(out, "{DISTORTION_HEADER}");
    for value in distortion {
        let _ = write!(out, "{value}{VALUE_SEPARATOR}");
    }
    out.push('\n');
    out
}

fn parse_values(tokens: &[&str], what: &str) -> Result<Vec<f64>, StoreError> {
    tokens
        .iter()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|e| StoreError::Parse(format!("invalid {what} value '{t}': {e}")))
        })
        .collect()
}

/// Parses the text layout.
///
/// Whitespace between values is not significant, so coefficients written one
/// per line are accepted as well.
pub fn parse_calibration(
    contents: &str,
) -> Result<(Matrix3<f64>, [f64; DISTORTION_COEFFS]), StoreError> {
    let mut matrix_tokens = Vec::new();
    let mut distortion_tokens = Vec::new();
    let mut section = None;

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed == CAMERA_MATRIX_HEADER {
            section = Some(0);
        } else if trimmed == DISTORTION_HEADER {
            section = Some(1);
        } else {
            match section {
                Some(0) => matrix_tokens.extend(trimmed.split_whitespace()),
                Some(_) => distortion_tokens.extend(trimmed.split_whitespace()),
                None if trimmed.is_empty() => {}
                None => {
                    return Err(StoreError::Parse(format!(
                        "unexpected content before the camera matrix header: '{trimmed}'"
                    )))
                }
            }
        }
    }

    if section.is_none() {
        return Err(StoreError::Parse("camera matrix header not found".to_string()));
    }
    let matrix = parse_values(&matrix_tokens, "camera matrix")?;
    if matrix.len() != 9 {
        return Err(StoreError::Parse(format!(
            "expected 9 camera matrix values, found {}",
            matrix.len()
        )));
    }
    let distortion = parse_values(&distortion_tokens, "distortion")?;
    if distortion.len() != DISTORTION_COEFFS {
        return Err(StoreError::Parse(format!(
            "expected {DISTORTION_COEFFS} distortion coefficients, found {}",
            distortion.len()
        )));
    }

    let mut coeffs = [0.0; DISTORTION_COEFFS];
    coeffs.copy_from_slice(&distortion);
    Ok((Matrix3::from_row_slice(&matrix), coeffs))
}

/// Writes a calibration file, replacing any existing one.
///
/// # Errors
///
/// * [`StoreError::Io`] if the destination cannot be created or written.
pub fn save(
    path: impl AsRef<Path>,
    camera_matrix: &Matrix3<f64>,
    distortion: &[f64; DISTORTION_COEFFS],
) -> Result<(), StoreError> {
    let path = path.as_ref();
    let contents = format_calibration(camera_matrix, distortion);
    fs::write(path, contents).map_err(io_error(path))?;
    info!("Saved calibration to {}", path.display());
    Ok(())
}

/// Reads a calibration file written by [`save`].
///
/// # Errors
///
/// * [`StoreError::Io`] if the file cannot be read.
/// * [`StoreError::Parse`] if headers are missing or the value counts are wrong.
pub fn load(
    path: impl AsRef<Path>,
) -> Result<(Matrix3<f64>, [f64; DISTORTION_COEFFS]), StoreError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(io_error(path))?;
    parse_calibration(&contents)
}

/// Saves the camera matrix and distortion of a result.
pub fn save_result(path: impl AsRef<Path>, result: &CalibrationResult) -> Result<(), StoreError> {
    save(path, &result.camera_matrix(), &result.distortion)
}

/// Writes the full result, poses and per-view errors included, as YAML.
pub fn save_report_yaml(
    path: impl AsRef<Path>,
    result: &CalibrationResult,
) -> Result<(), StoreError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(result)?;
    fs::write(path, yaml).map_err(io_error(path))
}

pub fn load_report_yaml(path: impl AsRef<Path>) -> Result<CalibrationResult, StoreError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Writes the full result as pretty-printed JSON.
pub fn save_report_json(
    path: impl AsRef<Path>,
    result: &CalibrationResult,
) -> Result<(), StoreError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(result)?;
    fs::write(path, json).map_err(io_error(path))
}
