//! Grayscale image primitives on `ndarray` buffers.
//!
//! All images are indexed `[[row, col]]`, i.e. `[[y, x]]`.

use ndarray::{Array2, ArrayView2};

use crate::tracker::rect::Rect;

/// Summed-area tables of pixel values and squared pixel values.
///
/// Both tables have one extra leading row and column of zeros, so the sum
/// over `[x, x + w) x [y, y + h)` needs four lookups.
pub struct IntegralImage {
    sum: Array2<f64>,
    sq: Array2<f64>,
}

impl IntegralImage {
    pub fn from_u8(image: &ArrayView2<'_, u8>) -> Self {
        Self::build(image.nrows(), image.ncols(), |y, x| image[[y, x]] as f64)
    }

    pub fn from_f32(image: &ArrayView2<'_, f32>) -> Self {
        Self::build(image.nrows(), image.ncols(), |y, x| image[[y, x]] as f64)
    }

    fn build(rows: usize, cols: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let mut sum = Array2::<f64>::zeros((rows + 1, cols + 1));
        let mut sq = Array2::<f64>::zeros((rows + 1, cols + 1));
        for y in 0..rows {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..cols {
                let v = value(y, x);
                row_sum += v;
                row_sq += v * v;
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row_sum;
                sq[[y + 1, x + 1]] = sq[[y, x + 1]] + row_sq;
            }
        }
        Self { sum, sq }
    }

    /// Sum of pixels in the `w x h` box whose top-left corner is `(x, y)`.
    #[inline]
    pub fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::lookup(&self.sum, x, y, w, h)
    }

    /// Sum of squared pixels in the `w x h` box whose top-left corner is `(x, y)`.
    #[inline]
    pub fn sum_sq(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        Self::lookup(&self.sq, x, y, w, h)
    }

    #[inline]
    fn lookup(table: &Array2<f64>, x: usize, y: usize, w: usize, h: usize) -> f64 {
        table[[y + h, x + w]] - table[[y, x + w]] - table[[y + h, x]] + table[[y, x]]
    }
}

/// Bilinear sample at sub-pixel `(x, y)`; coordinates are clamped to the border.
pub fn sample_bilinear(image: &ArrayView2<'_, u8>, x: f32, y: f32) -> f32 {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let x = x.clamp(0.0, (cols - 1) as f32);
    let y = y.clamp(0.0, (rows - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let top = image[[y0, x0]] as f32 * (1.0 - fx) + image[[y0, x1]] as f32 * fx;
    let bottom = image[[y1, x0]] as f32 * (1.0 - fx) + image[[y1, x1]] as f32 * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resample `region` of `image` onto an `out_w x out_h` grid of pixel centers.
pub fn resample(
    image: &ArrayView2<'_, u8>,
    region: &Rect,
    out_w: usize,
    out_h: usize,
) -> Array2<f32> {
    let step_x = region.width / out_w as f32;
    let step_y = region.height / out_h as f32;
    Array2::from_shape_fn((out_h, out_w), |(v, u)| {
        let x = region.x + (u as f32 + 0.5) * step_x - 0.5;
        let y = region.y + (v as f32 + 0.5) * step_y - 0.5;
        sample_bilinear(image, x, y)
    })
}

/// Bilinear resize to `width x height`.
pub fn resize(image: &ArrayView2<'_, u8>, width: usize, height: usize) -> Array2<u8> {
    let full = Rect::new(0.0, 0.0, image.ncols() as f32, image.nrows() as f32);
    resample(image, &full, width, height).mapv(|v| v.clamp(0.0, 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_integral_box_sums() {
        let img = array![[1u8, 2, 3], [4, 5, 6], [7, 8, 9]];
        let integral = IntegralImage::from_u8(&img.view());
        assert_eq!(integral.sum(0, 0, 3, 3), 45.0);
        assert_eq!(integral.sum(1, 1, 2, 2), 5.0 + 6.0 + 8.0 + 9.0);
        assert_eq!(integral.sum_sq(2, 0, 1, 2), 9.0 + 36.0);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = array![[0u8, 100], [100, 200]];
        let v = sample_bilinear(&img.view(), 0.5, 0.5);
        assert!((v - 100.0).abs() < 1e-4);
        // Clamped outside the image.
        assert_eq!(sample_bilinear(&img.view(), -3.0, -3.0), 0.0);
    }

    #[test]
    fn test_resize_identity() {
        let img = Array2::from_shape_fn((8, 6), |(y, x)| (y * 10 + x) as u8);
        let out = resize(&img.view(), 6, 8);
        assert_eq!(out, img);
    }
}
