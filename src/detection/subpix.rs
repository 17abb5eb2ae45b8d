//! Iterative sub-pixel corner refinement.
//!
//! At a saddle point every image gradient in the neighbourhood is orthogonal
//! to the vector from the corner to the gradient's location. Stacking that
//! constraint over a Gaussian-weighted window gives a 2x2 linear system whose
//! solution is the refined corner, re-centred and solved again until it
//! settles.
//!
//! This runs on the blurred intensity image after the lattice is assembled.
//! The ChESS candidates only locate the response peak, which is biased under
//! perspective and blur.

use super::image_ops::{sample_clamped, FloatImage};
use nalgebra::{Matrix2, Point2, Vector2};

/// Refinement stops once the corner moves less than this many pixels.
const CONVERGENCE_EPS: f64 = 0.01;

/// Sub-pixel refinement settings.
#[derive(Debug, Clone, Copy)]
pub struct SubPixParams {
    pub half_window: i64,
    pub max_iterations: usize,
}

impl SubPixParams {
    /// Window sized to a quarter of the corner spacing, kept within `[2, 6]`.
    pub fn for_spacing(spacing: f64) -> Self {
        let half_window = (0.25 * spacing).round().clamp(2.0, 6.0) as i64;
        Self {
            half_window,
            max_iterations: 20,
        }
    }
}

fn bilinear(img: &FloatImage, x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (xi, yi) = (x0 as i64, y0 as i64);
    let p00 = sample_clamped(img, xi, yi) as f64;
    let p10 = sample_clamped(img, xi + 1, yi) as f64;
    let p01 = sample_clamped(img, xi, yi + 1) as f64;
    let p11 = sample_clamped(img, xi + 1, yi + 1) as f64;
    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

fn gradient(img: &FloatImage, x: f64, y: f64) -> Vector2<f64> {
    Vector2::new(
        0.5 * (bilinear(img, x + 1.0, y) - bilinear(img, x - 1.0, y)),
        0.5 * (bilinear(img, x, y + 1.0) - bilinear(img, x, y - 1.0)),
    )
}

/// Refines `start` on `img`. Returns `None` if the system becomes singular or
/// the corner wanders further than the window size from where it started.
pub fn refine_corner(
    img: &FloatImage,
    start: Point2<f64>,
    params: &SubPixParams,
) -> Option<Point2<f64>> {
    let hw = params.half_window;
    let sigma = hw as f64 / 1.5;
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

    let mut current = start;
    for _ in 0..params.max_iterations {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -hw..=hw {
            for dx in -hw..=hw {
                let p = Point2::new(current.x + dx as f64, current.y + dy as f64);
                let g = gradient(img, p.x, p.y);
                let w = (-((dx * dx + dy * dy) as f64) * inv_two_sigma_sq).exp();
                let ggt = g * g.transpose() * w;
                a += ggt;
                b += ggt * p.coords;
            }
        }

        if a.determinant().abs() < 1e-12 {
            return None;
        }
        let next = Point2::from(a.try_inverse()? * b);
        let shift = (next - current).norm();
        current = next;

        if (current - start).norm() > hw as f64 {
            return None;
        }
        if shift < CONVERGENCE_EPS {
            break;
        }
    }
    Some(current)
}
