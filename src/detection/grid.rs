//! Assembles corner candidates into the checkerboard lattice.
//!
//! Starting from a strong seed candidate, two lattice axes are taken from its
//! nearest neighbours. The lattice then grows outward: each missing grid
//! position is predicted by extrapolating from already assigned neighbours,
//! and the nearest unused candidate close enough to the prediction is
//! assigned. Only complete lattices of the expected size are returned.

use crate::board::PatternSize;
use kiddo::{KdTree, SquaredEuclidean};
use log::trace;
use nalgebra::{Point2, Vector2};
use std::collections::{HashMap, VecDeque};

use super::candidates::CornerCandidate;

/// Tuning of the lattice growth.
#[derive(Debug, Clone, Copy)]
pub struct GridParams {
    /// Number of strongest candidates tried as seeds.
    pub max_seeds: usize,
    /// Neighbours inspected when picking the seed axes.
    pub k_neighbors: usize,
    /// Maximum distance between prediction and candidate, as a fraction of the
    /// local grid step.
    pub match_tolerance: f64,
    /// Smallest plausible corner spacing in pixels.
    pub min_spacing: f64,
    /// Candidates weaker than this fraction of the seed's response are ignored
    /// while growing. Keeps the L-shaped corners on the board's outline out.
    pub min_strength_ratio: f32,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            max_seeds: 16,
            k_neighbors: 9,
            match_tolerance: 0.35,
            min_spacing: 4.0,
            min_strength_ratio: 0.2,
        }
    }
}

type GridIndex = (i32, i32);

const DIRECTIONS: [GridIndex; 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

struct Lattice<'a> {
    candidates: &'a [CornerCandidate],
    tree: &'a KdTree<f64, 2>,
    params: &'a GridParams,
    cells: HashMap<GridIndex, usize>,
    used: Vec<bool>,
    min_strength: f32,
}

impl<'a> Lattice<'a> {
    fn position(&self, index: GridIndex) -> Option<Point2<f64>> {
        self.cells
            .get(&index)
            .map(|&c| self.candidates[c].position)
    }

    fn assign(&mut self, index: GridIndex, candidate: usize) {
        self.cells.insert(index, candidate);
        self.used[candidate] = true;
    }

    /// Step vector along `dir` measured at the assigned pair closest to `at`.
    fn local_step(&self, at: GridIndex, dir: GridIndex) -> Option<Vector2<f64>> {
        let axis = (dir.0.abs(), dir.1.abs());
        let sign = (dir.0 + dir.1) as f64;
        self.cells
            .keys()
            .filter(|q| self.cells.contains_key(&(q.0 + axis.0, q.1 + axis.1)))
            .min_by_key(|q| (q.0 - at.0).abs() + (q.1 - at.1).abs())
            .and_then(|q| {
                let a = self.position(*q)?;
                let b = self.position((q.0 + axis.0, q.1 + axis.1))?;
                Some((b - a) * sign)
            })
    }

    /// Predicted pixel position of `target`, reached from `from` along `dir`.
    fn predict(&self, from: GridIndex, dir: GridIndex) -> Option<(Point2<f64>, f64)> {
        let here = self.position(from)?;
        let behind = (from.0 - dir.0, from.1 - dir.1);
        let step = match self.position(behind) {
            Some(back) => here - back,
            None => self.local_step(from, dir)?,
        };
        Some((here + step, step.norm()))
    }

    fn nearest_unused(&self, point: &Point2<f64>, radius: f64) -> Option<usize> {
        let hits = self
            .tree
            .nearest_n::<SquaredEuclidean>(&[point.x, point.y], 3);
        hits.into_iter()
            .filter(|nn| nn.distance <= radius * radius)
            .map(|nn| nn.item as usize)
            .find(|&i| !self.used[i] && self.candidates[i].strength >= self.min_strength)
    }

    fn extent(&self) -> (GridIndex, GridIndex) {
        let mut min = (i32::MAX, i32::MAX);
        let mut max = (i32::MIN, i32::MIN);
        for k in self.cells.keys() {
            min = (min.0.min(k.0), min.1.min(k.1));
            max = (max.0.max(k.0), max.1.max(k.1));
        }
        (min, max)
    }

    /// Grows until no prediction finds a candidate. Returns `false` as soon as
    /// the lattice exceeds `limit` positions along either axis.
    fn grow(&mut self, limit: i32) -> bool {
        let mut queue: VecDeque<GridIndex> = self.cells.keys().copied().collect();
        while let Some(from) = queue.pop_front() {
            for dir in DIRECTIONS {
                let target = (from.0 + dir.0, from.1 + dir.1);
                if self.cells.contains_key(&target) {
                    continue;
                }
                let Some((predicted, step)) = self.predict(from, dir) else {
                    continue;
                };
                if step < self.params.min_spacing {
                    continue;
                }
                let Some(found) =
                    self.nearest_unused(&predicted, self.params.match_tolerance * step)
                else {
                    continue;
                };

                self.assign(target, found);
                let (min, max) = self.extent();
                if max.0 - min.0 + 1 > limit || max.1 - min.1 + 1 > limit {
                    return false;
                }
                queue.push_back(target);
            }
        }
        true
    }
}

/// Picks the two lattice axes at `seed` from its nearest neighbours.
fn seed_axes(
    candidates: &[CornerCandidate],
    tree: &KdTree<f64, 2>,
    seed: usize,
    params: &GridParams,
) -> Option<(usize, usize)> {
    let p = candidates[seed].position;
    let neighbours: Vec<(usize, Vector2<f64>)> = tree
        .nearest_n::<SquaredEuclidean>(&[p.x, p.y], params.k_neighbors)
        .into_iter()
        .map(|nn| nn.item as usize)
        .filter(|&i| i != seed)
        .map(|i| (i, candidates[i].position - p))
        .filter(|(_, v)| v.norm() >= params.min_spacing)
        .collect();

    let (first, axis_a) = *neighbours.first()?;
    let len_a = axis_a.norm();
    let (second, _) = neighbours.iter().skip(1).find(|(_, v)| {
        let len_b = v.norm();
        let cos = axis_a.dot(v) / (len_a * len_b);
        cos.abs() < 0.5 && (0.5..=2.0).contains(&(len_b / len_a))
    })?;
    Some((first, *second))
}

/// Assembles a complete `pattern` lattice and returns its points as rows of
/// grid positions. The returned grid has either `pattern.height` rows of
/// `pattern.width` points or the transpose; ordering is left to the caller.
pub fn assemble_grid(
    candidates: &[CornerCandidate],
    pattern: PatternSize,
    params: &GridParams,
) -> Option<Vec<Vec<Point2<f64>>>> {
    let needed = pattern.corner_count();
    if candidates.len() < needed || needed < 4 {
        return None;
    }

    let coords: Vec<[f64; 2]> = candidates
        .iter()
        .map(|c| [c.position.x, c.position.y])
        .collect();
    let tree: KdTree<f64, 2> = (&coords).into();
    let limit = pattern.width.max(pattern.height) as i32;

    for seed in 0..params.max_seeds.min(candidates.len()) {
        let Some((a, b)) = seed_axes(candidates, &tree, seed, params) else {
            continue;
        };

        let mut lattice = Lattice {
            candidates,
            tree: &tree,
            params,
            cells: HashMap::new(),
            used: vec![false; candidates.len()],
            min_strength: candidates[seed].strength * params.min_strength_ratio,
        };
        lattice.assign((0, 0), seed);
        lattice.assign((1, 0), a);
        lattice.assign((0, 1), b);

        if !lattice.grow(limit) || lattice.cells.len() != needed {
            trace!(
                "seed {seed}: lattice of {} corners rejected",
                lattice.cells.len()
            );
            continue;
        }

        let (min, max) = lattice.extent();
        let cols = (max.0 - min.0 + 1) as usize;
        let rows = (max.1 - min.1 + 1) as usize;
        let fits = (cols, rows) == (pattern.width, pattern.height)
            || (cols, rows) == (pattern.height, pattern.width);
        if !fits {
            continue;
        }

        let mut grid = Vec::with_capacity(rows);
        for j in min.1..=max.1 {
            let mut row = Vec::with_capacity(cols);
            for i in min.0..=max.0 {
                row.push(lattice.position((i, j))?);
            }
            grid.push(row);
        }
        return Some(grid);
    }
    None
}

fn transpose(grid: &[Vec<Point2<f64>>]) -> Vec<Vec<Point2<f64>>> {
    let cols = grid.first().map_or(0, Vec::len);
    (0..cols)
        .map(|c| grid.iter().map(|row| row[c]).collect())
        .collect()
}

fn flip_columns(grid: &[Vec<Point2<f64>>]) -> Vec<Vec<Point2<f64>>> {
    grid.iter()
        .map(|row| row.iter().rev().copied().collect())
        .collect()
}

fn flip_rows(grid: &[Vec<Point2<f64>>]) -> Vec<Vec<Point2<f64>>> {
    grid.iter().rev().cloned().collect()
}

/// Signed area spanned by the first row and first column directions. Positive
/// when the row runs clockwise to the column in y-down image coordinates.
fn handedness(grid: &[Vec<Point2<f64>>]) -> f64 {
    let origin = grid[0][0];
    let along_row = grid[0][grid[0].len() - 1] - origin;
    let along_col = grid[grid.len() - 1][0] - origin;
    along_row.x * along_col.y - along_row.y * along_col.x
}

/// Puts an assembled grid into the canonical row-major order.
///
/// The grid is transposed to `pattern.height` rows of `pattern.width` points.
/// Of the orderings that keep that shape, only those where the first row turns
/// clockwise into the first column are kept; this matches the right-handed
/// board frame, so the board lies in front of the camera. Among the survivors
/// the one whose first point is closest to the image's top-left wins.
pub fn canonical_order(
    grid: Vec<Vec<Point2<f64>>>,
    pattern: PatternSize,
) -> Option<Vec<Point2<f64>>> {
    let rows = grid.len();
    let cols = grid.first().map_or(0, Vec::len);
    let base = if (cols, rows) == (pattern.width, pattern.height) {
        grid
    } else if (rows, cols) == (pattern.width, pattern.height) {
        transpose(&grid)
    } else {
        return None;
    };

    let mut variants = vec![
        base.clone(),
        flip_columns(&base),
        flip_rows(&base),
        flip_rows(&flip_columns(&base)),
    ];
    if pattern.width == pattern.height {
        let t = transpose(&base);
        variants.push(flip_columns(&t));
        variants.push(flip_rows(&t));
        variants.push(flip_rows(&flip_columns(&t)));
        variants.push(t);
    }

    variants
        .into_iter()
        .filter(|g| handedness(g) > 0.0)
        .min_by(|a, b| {
            let ka = a[0][0].x + a[0][0].y;
            let kb = b[0][0].x + b[0][0].y;
            ka.total_cmp(&kb)
        })
        .map(|g| g.into_iter().flatten().collect())
}

/// Mean distance between horizontally and vertically adjacent grid points.
pub fn mean_spacing(points: &[Point2<f64>], pattern: PatternSize) -> f64 {
    let (w, h) = (pattern.width, pattern.height);
    let mut total = 0.0;
    let mut count = 0usize;
    for r in 0..h {
        for c in 0..w {
            let p = points[r * w + c];
            if c + 1 < w {
                total += (points[r * w + c + 1] - p).norm();
                count += 1;
            }
            if r + 1 < h {
                total += (points[(r + 1) * w + c] - p).norm();
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_candidates(
        cols: usize,
        rows: usize,
        origin: Point2<f64>,
        u: Vector2<f64>,
        v: Vector2<f64>,
    ) -> Vec<CornerCandidate> {
        let mut out = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                out.push(CornerCandidate {
                    position: origin + u * c as f64 + v * r as f64,
                    strength: 1.0 + ((r * 7 + c * 3) % 5) as f32,
                });
            }
        }
        out
    }

    #[test]
    fn test_assembles_rotated_lattice() {
        let pattern = PatternSize::new(9, 6);
        let angle: f64 = 0.3;
        let u = Vector2::new(angle.cos(), angle.sin()) * 20.0;
        let v = Vector2::new(-angle.sin(), angle.cos()) * 18.0;
        let mut candidates = lattice_candidates(9, 6, Point2::new(100.0, 50.0), u, v);
        // Clutter far from the board
        candidates.push(CornerCandidate {
            position: Point2::new(5.0, 5.0),
            strength: 10.0,
        });

        let grid = assemble_grid(&candidates, pattern, &GridParams::default()).unwrap();
        let points = canonical_order(grid, pattern).unwrap();
        assert_eq!(points.len(), 54);

        // The first row runs along u, the first column along v.
        let origin = Point2::new(100.0, 50.0);
        assert!((points[0] - origin).norm() < 1e-9);
        assert!((points[1] - (origin + u)).norm() < 1e-9);
        assert!((points[9] - (origin + v)).norm() < 1e-9);
        assert!((mean_spacing(&points, pattern) - 19.0).abs() < 1.0);
    }

    #[test]
    fn test_transposed_lattice_is_reordered() {
        // Board seen rotated by 90 degrees: 6 columns of 9 rows in the image.
        let pattern = PatternSize::new(9, 6);
        let u = Vector2::new(20.0, 0.0);
        let v = Vector2::new(0.0, 20.0);
        let candidates = lattice_candidates(6, 9, Point2::new(50.0, 40.0), u, v);

        let grid = assemble_grid(&candidates, pattern, &GridParams::default()).unwrap();
        let points = canonical_order(grid, pattern).unwrap();
        assert_eq!(points.len(), 54);
        let rows: Vec<&[Point2<f64>]> = points.chunks(9).collect();
        assert_eq!(rows.len(), 6);
        assert!(handedness(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()) > 0.0);
    }

    #[test]
    fn test_incomplete_lattice_rejected() {
        let pattern = PatternSize::new(9, 6);
        let mut candidates = lattice_candidates(
            9,
            6,
            Point2::new(50.0, 50.0),
            Vector2::new(20.0, 0.0),
            Vector2::new(0.0, 20.0),
        );
        candidates.remove(20);
        assert!(assemble_grid(&candidates, pattern, &GridParams::default()).is_none());
    }

    #[test]
    fn test_oversized_lattice_rejected() {
        let pattern = PatternSize::new(4, 3);
        let candidates = lattice_candidates(
            6,
            5,
            Point2::new(50.0, 50.0),
            Vector2::new(20.0, 0.0),
            Vector2::new(0.0, 20.0),
        );
        assert!(assemble_grid(&candidates, pattern, &GridParams::default()).is_none());
    }

    #[test]
    fn test_canonical_prefers_top_left_and_right_handed() {
        let pattern = PatternSize::new(3, 2);
        // Board upside down: first row at the bottom, running right to left.
        let grid = vec![
            vec![
                Point2::new(40.0, 20.0),
                Point2::new(20.0, 20.0),
                Point2::new(0.0, 20.0),
            ],
            vec![
                Point2::new(40.0, 0.0),
                Point2::new(20.0, 0.0),
                Point2::new(0.0, 0.0),
            ],
        ];
        let points = canonical_order(grid, pattern).unwrap();
        assert_eq!(points[0], Point2::new(0.0, 0.0));
        assert_eq!(points[2], Point2::new(40.0, 0.0));
        assert_eq!(points[3], Point2::new(0.0, 20.0));
    }
}
