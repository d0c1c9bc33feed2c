//! Multi-resolution intensity pyramid with precomputed gradients.

use nalgebra::Vector2;

use super::image::ImageAndExposure;

/// Coarsest level must be at least this wide and high.
const MIN_LEVEL_SIZE: usize = 16;

/// One pyramid level.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub width: usize,
    pub height: usize,
    pub intensity: Vec<f32>,
    pub grad_x: Vec<f32>,
    pub grad_y: Vec<f32>,
}

impl PyramidLevel {
    fn from_intensity(width: usize, height: usize, intensity: Vec<f32>) -> Self {
        let mut grad_x = vec![0.0f32; width * height];
        let mut grad_y = vec![0.0f32; width * height];
        for y in 1..height.saturating_sub(1) {
            for x in 1..width.saturating_sub(1) {
                let i = y * width + x;
                grad_x[i] = 0.5 * (intensity[i + 1] - intensity[i - 1]);
                grad_y[i] = 0.5 * (intensity[i + width] - intensity[i - width]);
            }
        }
        Self { width, height, intensity, grad_x, grad_y }
    }

    fn downsample(&self) -> Self {
        let w = self.width / 2;
        let h = self.height / 2;
        let mut out = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let i = 2 * y * self.width + 2 * x;
                out[y * w + x] = 0.25
                    * (self.intensity[i]
                        + self.intensity[i + 1]
                        + self.intensity[i + self.width]
                        + self.intensity[i + self.width + 1]);
            }
        }
        Self::from_intensity(w, h, out)
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.intensity[y * self.width + x]
    }

    #[inline]
    pub fn grad_sq(&self, x: usize, y: usize) -> f32 {
        let i = y * self.width + x;
        self.grad_x[i] * self.grad_x[i] + self.grad_y[i] * self.grad_y[i]
    }

    #[inline]
    pub fn in_bounds(&self, u: f64, v: f64, margin: f64) -> bool {
        u >= margin && v >= margin && u <= self.width as f64 - 1.0 - margin && v <= self.height as f64 - 1.0 - margin
    }

    /// Bilinear sample of `[I, ∂I/∂u, ∂I/∂v]`; `None` outside the 1-pixel
    /// border where gradients are undefined.
    #[inline]
    pub fn interpolate(&self, u: f64, v: f64) -> Option<[f64; 3]> {
        if !self.in_bounds(u, v, 1.0) {
            return None;
        }
        let x0 = u.floor() as usize;
        let y0 = v.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let dx = (u - x0 as f64) as f32;
        let dy = (v - y0 as f64) as f32;
        let w00 = (1.0 - dx) * (1.0 - dy);
        let w10 = dx * (1.0 - dy);
        let w01 = (1.0 - dx) * dy;
        let w11 = dx * dy;
        let (i00, i10, i01, i11) = (y0 * self.width + x0, y0 * self.width + x1, y1 * self.width + x0, y1 * self.width + x1);
        let sample = |buf: &[f32]| (w00 * buf[i00] + w10 * buf[i10] + w01 * buf[i01] + w11 * buf[i11]) as f64;
        Some([sample(&self.intensity), sample(&self.grad_x), sample(&self.grad_y)])
    }

    /// Bilinear intensity only.
    #[inline]
    pub fn intensity_at(&self, uv: &Vector2<f64>) -> Option<f64> {
        self.interpolate(uv.x, uv.y).map(|s| s[0])
    }
}

/// Image pyramid of one frame.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    pub levels: Vec<PyramidLevel>,
    pub timestamp_s: f64,
    pub exposure_time: f64,
}

impl ImagePyramid {
    /// Builds up to `max_levels` half-resolution levels; fewer when the
    /// image becomes too small.
    pub fn build(image: &ImageAndExposure, max_levels: usize) -> Self {
        let mut levels = vec![PyramidLevel::from_intensity(image.width, image.height, image.intensities.clone())];
        while levels.len() < max_levels.max(1) {
            let Some(last) = levels.last() else { break };
            if last.width / 2 < MIN_LEVEL_SIZE || last.height / 2 < MIN_LEVEL_SIZE {
                break;
            }
            let next = last.downsample();
            levels.push(next);
        }
        Self {
            levels,
            timestamp_s: image.timestamp_s,
            exposure_time: image.exposure_time as f64,
        }
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn level(&self, level: usize) -> &PyramidLevel {
        &self.levels[level.min(self.levels.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(width: usize, height: usize) -> ImageAndExposure {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (2 * x + 3 * y) as f32))
            .collect();
        ImageAndExposure::new(width, height, data, 0.0).unwrap()
    }

    #[test]
    fn builds_half_resolution_levels() {
        let pyr = ImagePyramid::build(&ramp(160, 120), 6);
        assert_eq!(pyr.num_levels(), 3);
        assert_eq!(pyr.levels[1].width, 80);
        assert_eq!(pyr.levels[2].height, 30);
    }

    #[test]
    fn gradients_of_a_ramp_are_constant() {
        let pyr = ImagePyramid::build(&ramp(64, 48), 2);
        let [i, gx, gy] = pyr.levels[0].interpolate(10.25, 20.5).unwrap();
        assert_relative_eq!(i, 2.0 * 10.25 + 3.0 * 20.5, epsilon = 1e-4);
        assert_relative_eq!(gx, 2.0, epsilon = 1e-5);
        assert_relative_eq!(gy, 3.0, epsilon = 1e-5);
        // Level 1 pixels span two level-0 pixels.
        let [_, gx1, gy1] = pyr.levels[1].interpolate(10.0, 10.0).unwrap();
        assert_relative_eq!(gx1, 4.0, epsilon = 1e-4);
        assert_relative_eq!(gy1, 6.0, epsilon = 1e-4);
    }

    #[test]
    fn interpolation_rejects_border() {
        let pyr = ImagePyramid::build(&ramp(32, 32), 1);
        assert!(pyr.levels[0].interpolate(0.5, 10.0).is_none());
        assert!(pyr.levels[0].interpolate(30.5, 10.0).is_none());
        assert!(pyr.levels[0].interpolate(30.0, 30.0).is_some());
    }
}
