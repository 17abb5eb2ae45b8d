//! Pairs detected corners with the known board geometry.

use crate::board::BoardGeometry;
use crate::optimization::CalibrationError;
use nalgebra::{Point2, Point3};

/// Anything that carries the detected corners of one accepted view.
pub trait ViewSource {
    fn image_points(&self) -> &[Point2<f64>];
}

impl ViewSource for Vec<Point2<f64>> {
    fn image_points(&self) -> &[Point2<f64>] {
        self
    }
}

impl ViewSource for [Point2<f64>] {
    fn image_points(&self) -> &[Point2<f64>] {
        self
    }
}

impl<V: ViewSource + ?Sized> ViewSource for &V {
    fn image_points(&self) -> &[Point2<f64>] {
        (**self).image_points()
    }
}

/// Index-aligned world and image point lists, one entry per view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrespondenceSet {
    pub world_point_sets: Vec<Vec<Point3<f64>>>,
    pub image_point_sets: Vec<Vec<Point2<f64>>>,
}

impl CorrespondenceSet {
    pub fn len(&self) -> usize {
        self.image_point_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_point_sets.is_empty()
    }
}

/// Builds the world/image point lists for a solve.
///
/// Every view gets its own copy of the board grid. A view whose point count
/// differs from the board's corner count is rejected before anything is built.
///
/// # Errors
///
/// * [`CalibrationError::CorrespondenceMismatch`] naming the first bad view.
pub fn build_correspondences<V>(
    views: &[V],
    board: &BoardGeometry,
) -> Result<CorrespondenceSet, CalibrationError>
where
    V: ViewSource,
{
    let expected = board.corner_count();
    if let Some((view, found)) = views
        .iter()
        .map(|v| v.image_points().len())
        .enumerate()
        .find(|(_, n)| *n != expected)
    {
        return Err(CalibrationError::CorrespondenceMismatch {
            view,
            expected,
            found,
        });
    }

    let grid = board.world_points();
    Ok(CorrespondenceSet {
        world_point_sets: vec![grid; views.len()],
        image_point_sets: views.iter().map(|v| v.image_points().to_vec()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PatternSize;

    fn board() -> BoardGeometry {
        BoardGeometry::new(PatternSize::new(3, 2), 0.5).unwrap()
    }

    fn view(n: usize, offset: f64) -> Vec<Point2<f64>> {
        (0..n).map(|i| Point2::new(i as f64 + offset, offset)).collect()
    }

    #[test]
    fn test_sets_are_index_aligned() {
        let views = vec![view(6, 0.0), view(6, 10.0)];
        let set = build_correspondences(&views, &board()).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.world_point_sets[0], board().world_points());
        assert_eq!(set.world_point_sets[1], board().world_points());
        assert_eq!(set.image_point_sets[1], views[1]);
        for (world, image) in set.world_point_sets.iter().zip(&set.image_point_sets) {
            assert_eq!(world.len(), image.len());
        }
    }

    #[test]
    fn test_mismatched_view_rejected() {
        let views = vec![view(6, 0.0), view(6, 1.0), view(5, 2.0)];
        let err = build_correspondences(&views, &board()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::CorrespondenceMismatch {
                view: 2,
                expected: 6,
                found: 5
            }
        ));
    }

    #[test]
    fn test_borrowed_point_slices() {
        let owned = [view(6, 0.0), view(6, 3.0)];
        let slices: Vec<&[Point2<f64>]> = owned.iter().map(|v| v.as_slice()).collect();
        let set = build_correspondences(&slices, &board()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.image_point_sets[1], owned[1]);

        let short: Vec<&[Point2<f64>]> = vec![&owned[0][..4]];
        assert!(matches!(
            build_correspondences(&short, &board()),
            Err(CalibrationError::CorrespondenceMismatch { view: 0, found: 4, .. })
        ));
    }

    #[test]
    fn test_empty_views() {
        let views: Vec<Vec<Point2<f64>>> = Vec::new();
        let set = build_correspondences(&views, &board()).unwrap();
        assert!(set.is_empty());
    }
}
