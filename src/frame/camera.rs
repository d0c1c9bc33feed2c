//! Pinhole camera model, scaled per pyramid level.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

/// Pinhole intrinsics of the full-resolution image.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: usize,
    pub height: usize,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        Self { fx, fy, cx, cy, width, height }
    }

    /// Intrinsics of pyramid level `level` (pixel-centre convention).
    pub fn at_level(&self, level: usize) -> Self {
        let s = (1usize << level) as f64;
        Self {
            fx: self.fx / s,
            fy: self.fy / s,
            cx: (self.cx + 0.5) / s - 0.5,
            cy: (self.cy + 0.5) / s - 0.5,
            width: self.width >> level,
            height: self.height >> level,
        }
    }

    /// Projects a camera-frame point; `None` behind the camera.
    #[inline]
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 1e-9 {
            return None;
        }
        Some(Vector2::new(self.fx * p.x / p.z + self.cx, self.fy * p.y / p.z + self.cy))
    }

    /// Bearing with unit depth: `K⁻¹ [u, v, 1]`.
    #[inline]
    pub fn unproject(&self, u: f64, v: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) / self.fx, (v - self.cy) / self.fy, 1.0)
    }

    /// Derivative of the projection with respect to the camera-frame point.
    #[inline]
    pub fn projection_jacobian(&self, p: &Vector3<f64>) -> nalgebra::Matrix2x3<f64> {
        let iz = 1.0 / p.z;
        let iz2 = iz * iz;
        nalgebra::Matrix2x3::new(
            self.fx * iz, 0.0, -self.fx * p.x * iz2,
            0.0, self.fy * iz, -self.fy * p.y * iz2,
        )
    }

    #[inline]
    pub fn in_bounds(&self, uv: &Vector2<f64>, margin: f64) -> bool {
        uv.x >= margin
            && uv.y >= margin
            && uv.x <= self.width as f64 - 1.0 - margin
            && uv.y <= self.height as f64 - 1.0 - margin
    }

    /// Image diagonal in pixels, used to normalise flow measures.
    pub fn diagonal(&self) -> f64 {
        ((self.width * self.width + self.height * self.height) as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn project_unproject_roundtrip() {
        let cam = CameraModel::new(120.0, 121.0, 80.0, 60.0, 160, 120);
        let p = Vector3::new(0.3, -0.2, 2.5);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(cam.unproject(uv.x, uv.y) * p.z, p, epsilon = 1e-12);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn level_scaling_keeps_pixel_centres() {
        let cam = CameraModel::new(120.0, 120.0, 79.5, 59.5, 160, 120);
        let l1 = cam.at_level(1);
        assert_eq!(l1.width, 80);
        assert_relative_eq!(l1.fx, 60.0);
        assert_relative_eq!(l1.cx, 39.5);
        let p = Vector3::new(0.1, 0.2, 1.0);
        let uv0 = cam.project(&p).unwrap();
        let uv1 = l1.project(&p).unwrap();
        assert_relative_eq!(uv1.x, (uv0.x + 0.5) / 2.0 - 0.5, epsilon = 1e-12);
    }

    #[test]
    fn projection_jacobian_matches_finite_differences() {
        let cam = CameraModel::new(100.0, 90.0, 50.0, 40.0, 100, 80);
        let p = Vector3::new(0.4, -0.3, 1.7);
        let j = cam.projection_jacobian(&p);
        let eps = 1e-6;
        for k in 0..3 {
            let mut dp = Vector3::zeros();
            dp[k] = eps;
            let num = (cam.project(&(p + dp)).unwrap() - cam.project(&(p - dp)).unwrap()) / (2.0 * eps);
            assert_relative_eq!(j.column(k).into_owned(), num, epsilon = 1e-5);
        }
    }
}
