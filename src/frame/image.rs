//! Image payload accepted by the estimator.

use anyhow::{ensure, Result};
use image::GrayImage;

/// Grayscale intensities with capture time and exposure.
///
/// Intensities are linear irradiance in `[0, 255]` after the optional
/// photometric response has been applied.
#[derive(Debug, Clone)]
pub struct ImageAndExposure {
    pub width: usize,
    pub height: usize,
    pub intensities: Vec<f32>,
    pub timestamp_s: f64,
    /// Exposure duration; 1.0 when unknown.
    pub exposure_time: f32,
}

impl ImageAndExposure {
    pub fn new(width: usize, height: usize, intensities: Vec<f32>, timestamp_s: f64) -> Result<Self> {
        ensure!(
            intensities.len() == width * height,
            "image buffer has {} values, expected {}x{}",
            intensities.len(),
            width,
            height
        );
        Ok(Self {
            width,
            height,
            intensities,
            timestamp_s,
            exposure_time: 1.0,
        })
    }

    pub fn with_exposure(mut self, exposure_time: f32) -> Self {
        self.exposure_time = if exposure_time > 0.0 { exposure_time } else { 1.0 };
        self
    }

    /// Converts an 8-bit image, mapping raw values through `response`.
    pub fn from_gray_image(img: &GrayImage, timestamp_s: f64, response: Option<&PhotometricResponse>) -> Self {
        let intensities = img
            .pixels()
            .map(|p| match response {
                Some(r) => r.irradiance(p.0[0]),
                None => p.0[0] as f32,
            })
            .collect();
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            intensities,
            timestamp_s,
            exposure_time: 1.0,
        }
    }

    /// Quantised copy, for snapshots.
    pub fn to_gray_image(&self) -> GrayImage {
        let data = self
            .intensities
            .iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width as u32, self.height as u32, data)
            .unwrap_or_else(|| GrayImage::new(self.width as u32, self.height as u32))
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.intensities[y * self.width + x]
    }
}

/// Inverse camera response `G⁻¹`: raw 8-bit value to irradiance.
#[derive(Debug, Clone)]
pub struct PhotometricResponse {
    inverse: [f32; 256],
}

impl PhotometricResponse {
    /// Builds the response from a 256-entry lookup table, rescaled so that
    /// the output spans `[0, 255]`.
    pub fn from_table(table: &[f32]) -> Result<Self> {
        ensure!(table.len() == 256, "inverse response needs 256 entries, got {}", table.len());
        ensure!(
            table.windows(2).all(|w| w[1] >= w[0]),
            "inverse response must be non-decreasing"
        );
        let (lo, hi) = (table[0], table[255]);
        ensure!(hi > lo, "inverse response is constant");
        let mut inverse = [0.0f32; 256];
        for (dst, &v) in inverse.iter_mut().zip(table) {
            *dst = 255.0 * (v - lo) / (hi - lo);
        }
        Ok(Self { inverse })
    }

    /// Power-law response `I = 255 (raw / 255)^gamma`.
    pub fn gamma(gamma: f32) -> Self {
        let mut inverse = [0.0f32; 256];
        for (i, dst) in inverse.iter_mut().enumerate() {
            *dst = 255.0 * (i as f32 / 255.0).powf(gamma);
        }
        Self { inverse }
    }

    #[inline]
    pub fn irradiance(&self, raw: u8) -> f32 {
        self.inverse[raw as usize]
    }
}
