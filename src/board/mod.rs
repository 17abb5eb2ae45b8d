//! Planar checkerboard geometry.
//!
//! The board is described by the number of inner corners along each axis and
//! the physical edge length of one square. Its inner corners live on the
//! `z = 0` plane of the board frame, with the first corner at the origin, the
//! x axis running along a row and the y axis running down the columns.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum BoardError {
    #[error("Pattern must have at least 2x2 inner corners, got {width}x{height}")]
    PatternTooSmall { width: usize, height: usize },
    #[error("Square size must be positive and finite, got {0}")]
    InvalidSquareSize(f64),
}

/// Number of inner corners of a checkerboard along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    /// Inner corners per row.
    pub width: usize,
    /// Inner corners per column.
    pub height: usize,
}

impl PatternSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Total number of inner corners, `width * height`.
    pub fn corner_count(&self) -> usize {
        self.width * self.height
    }
}

impl fmt::Display for PatternSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Immutable description of the calibration target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    pattern_size: PatternSize,
    square_size: f64,
}

impl BoardGeometry {
    /// Creates a new board description.
    ///
    /// # Arguments
    ///
    /// * `pattern_size` - Inner corner counts; both must be at least 2.
    /// * `square_size` - Physical edge length of one square, in the unit the
    ///   extrinsics should be expressed in.
    ///
    /// # Errors
    ///
    /// * [`BoardError::PatternTooSmall`] if either dimension is below 2.
    /// * [`BoardError::InvalidSquareSize`] if the edge length is not a
    ///   positive finite number.
    pub fn new(pattern_size: PatternSize, square_size: f64) -> Result<Self, BoardError> {
        if pattern_size.width < 2 || pattern_size.height < 2 {
            return Err(BoardError::PatternTooSmall {
                width: pattern_size.width,
                height: pattern_size.height,
            });
        }
        if !square_size.is_finite() || square_size <= 0.0 {
            return Err(BoardError::InvalidSquareSize(square_size));
        }
        Ok(Self {
            pattern_size,
            square_size,
        })
    }

    pub fn pattern_size(&self) -> PatternSize {
        self.pattern_size
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }

    pub fn corner_count(&self) -> usize {
        self.pattern_size.corner_count()
    }

    /// The board-frame positions of every inner corner in row-major order.
    pub fn world_points(&self) -> Vec<Point3<f64>> {
        generate_world_points(self.pattern_size, self.square_size)
    }
}

/// Generates the board-frame coordinates of all inner corners.
///
/// Rows are the outer loop and columns the inner loop, so index
/// `row * width + col` holds `(col * square_size, row * square_size, 0)`.
/// This is the order the detector reports corners in.
pub fn generate_world_points(pattern_size: PatternSize, square_size: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(pattern_size.corner_count());
    for row in 0..pattern_size.height {
        for col in 0..pattern_size.width {
            points.push(Point3::new(
                col as f64 * square_size,
                row as f64 * square_size,
                0.0,
            ));
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_world_points_row_major() {
        let points = generate_world_points(PatternSize::new(9, 6), 0.028);
        assert_eq!(points.len(), 54);

        for row in 0..6 {
            for col in 0..9 {
                let p = points[row * 9 + col];
                assert_relative_eq!(p.x, col as f64 * 0.028);
                assert_relative_eq!(p.y, row as f64 * 0.028);
                assert_eq!(p.z, 0.0);
            }
        }
        assert_relative_eq!(points[53].x, 8.0 * 0.028);
        assert_relative_eq!(points[53].y, 5.0 * 0.028);
    }

    #[test]
    fn test_world_points_first_row_then_second() {
        let points = generate_world_points(PatternSize::new(3, 2), 1.0);
        let expected = [
            (0.0, 0.0),
            (1.0, 0.0),
            (2.0, 0.0),
            (0.0, 1.0),
            (1.0, 1.0),
            (2.0, 1.0),
        ];
        for (p, (x, y)) in points.iter().zip(expected) {
            assert_eq!((p.x, p.y, p.z), (x, y, 0.0));
        }
    }

    #[test]
    fn test_board_validation() {
        assert!(BoardGeometry::new(PatternSize::new(9, 6), 0.028).is_ok());
        assert!(matches!(
            BoardGeometry::new(PatternSize::new(1, 6), 0.028),
            Err(BoardError::PatternTooSmall { .. })
        ));
        assert!(matches!(
            BoardGeometry::new(PatternSize::new(9, 6), 0.0),
            Err(BoardError::InvalidSquareSize(_))
        ));
        assert!(BoardGeometry::new(PatternSize::new(9, 6), f64::NAN).is_err());
    }

    #[test]
    fn test_board_world_points_match_free_function() {
        let board = BoardGeometry::new(PatternSize::new(4, 3), 0.5).unwrap();
        assert_eq!(board.corner_count(), 12);
        assert_eq!(
            board.world_points(),
            generate_world_points(PatternSize::new(4, 3), 0.5)
        );
    }
}
