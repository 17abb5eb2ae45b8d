//! Float image helpers used by the corner detector.

use image::{imageops, GrayImage, ImageBuffer, Luma};

/// Single-channel float image, values nominally in `[0, 1]`.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Converts 8-bit luma to floats in `[0, 1]`.
pub fn to_float(gray: &GrayImage) -> FloatImage {
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as f32 / 255.0])
    })
}

/// Gaussian blur. A non-positive sigma or an empty image returns a copy.
pub fn gaussian_blur(img: &FloatImage, sigma: f32) -> FloatImage {
    if sigma > 0.0 && img.width() > 0 && img.height() > 0 {
        imageops::blur(img, sigma)
    } else {
        img.clone()
    }
}

/// Reads a pixel with coordinates clamped to the image border.
#[inline]
pub fn sample_clamped(img: &FloatImage, x: i64, y: i64) -> f32 {
    let xc = x.clamp(0, img.width() as i64 - 1) as u32;
    let yc = y.clamp(0, img.height() as i64 - 1) as u32;
    img.get_pixel(xc, yc)[0]
}

/// Summed-area tables of values and squared values.
pub struct IntegralImage {
    width: usize,
    height: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralImage {
    pub fn new(img: &FloatImage) -> Self {
        let width = img.width() as usize;
        let height = img.height() as usize;
        let stride = width + 1;
        let mut sum = vec![0.0; stride * (height + 1)];
        let mut sum_sq = vec![0.0; stride * (height + 1)];

        for y in 0..height {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..width {
                let v = img.get_pixel(x as u32, y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            width,
            height,
            sum,
            sum_sq,
        }
    }

    fn rect(table: &[f64], stride: usize, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    }

    /// Mean and variance over the square window of half-size `radius`
    /// centred on `(x, y)`, cropped to the image.
    pub fn window_stats(&self, x: i64, y: i64, radius: i64) -> (f64, f64) {
        let x0 = (x - radius).clamp(0, self.width as i64) as usize;
        let y0 = (y - radius).clamp(0, self.height as i64) as usize;
        let x1 = (x + radius + 1).clamp(0, self.width as i64) as usize;
        let y1 = (y + radius + 1).clamp(0, self.height as i64) as usize;
        let area = ((x1 - x0) * (y1 - y0)) as f64;
        if area == 0.0 {
            return (0.0, 0.0);
        }
        let stride = self.width + 1;
        let mean = Self::rect(&self.sum, stride, x0, y0, x1, y1) / area;
        let mean_sq = Self::rect(&self.sum_sq, stride, x0, y0, x1, y1) / area;
        (mean, (mean_sq - mean * mean).max(0.0))
    }

    pub fn window_mean(&self, x: i64, y: i64, radius: i64) -> f64 {
        self.window_stats(x, y, radius).0
    }
}

/// Local contrast normalization `(I - mean) / max(std, floor)` over a square
/// window of half-size `radius`.
pub fn normalize_local_contrast(img: &FloatImage, radius: u32, std_floor: f32) -> FloatImage {
    let integral = IntegralImage::new(img);
    let floor = std_floor.max(f32::EPSILON) as f64;
    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        let (mean, var) = integral.window_stats(x as i64, y as i64, radius as i64);
        let v = img.get_pixel(x, y)[0] as f64;
        Luma([((v - mean) / var.sqrt().max(floor)) as f32])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_to_float_range() {
        let gray = GrayImage::from_fn(4, 3, |x, _| Luma([if x == 0 { 0 } else { 255 }]));
        let f = to_float(&gray);
        assert_eq!(f.get_pixel(0, 0)[0], 0.0);
        assert_eq!(f.get_pixel(3, 2)[0], 1.0);
    }

    #[test]
    fn test_integral_window_stats() {
        let img = FloatImage::from_fn(5, 5, |x, y| Luma([(x + y) as f32]));
        let integral = IntegralImage::new(&img);

        let (mean, var) = integral.window_stats(2, 2, 1);
        assert_relative_eq!(mean, 4.0, epsilon = 1e-9);
        // values 2..6 with multiplicities 1,2,3,2,1
        assert_relative_eq!(var, 12.0 / 9.0, epsilon = 1e-9);

        // Cropped at the corner: pixels (0,0), (1,0), (0,1), (1,1)
        assert_relative_eq!(integral.window_mean(0, 0, 1), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_normalization_removes_gain_and_offset() {
        let base = FloatImage::from_fn(20, 20, |x, y| Luma([((x * 7 + y * 3) % 5) as f32 * 0.1]));
        let scaled = FloatImage::from_fn(20, 20, |x, y| {
            Luma([base.get_pixel(x, y)[0] * 0.5 + 0.2])
        });
        let a = normalize_local_contrast(&base, 3, 1e-4);
        let b = normalize_local_contrast(&scaled, 3, 1e-4);
        for (pa, pb) in a.pixels().zip(b.pixels()) {
            assert_relative_eq!(pa[0], pb[0], epsilon = 1e-3);
        }
    }

    #[test]
    fn test_blur_keeps_constant_image() {
        let img = FloatImage::from_pixel(16, 16, Luma([0.5]));
        let blurred = gaussian_blur(&img, 1.0);
        for p in blurred.pixels() {
            assert_relative_eq!(p[0], 0.5, epsilon = 1e-4);
        }
        assert_eq!(sample_clamped(&img, -5, 100), 0.5);
    }

    #[test]
    fn test_blur_empty_image() {
        let img = FloatImage::new(0, 0);
        assert_eq!(gaussian_blur(&img, 1.0).dimensions(), (0, 0));
    }
}
