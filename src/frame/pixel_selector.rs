//! Gradient-based selection of point candidates.
//!
//! The image is divided into regions whose gradient threshold adapts to the
//! local texture (median gradient plus a constant, smoothed over the
//! neighbouring regions). Candidates are the strongest above-threshold
//! pixels of each `block × block` cell. The threshold factor and block size
//! are adjusted until the candidate count is within 25 % of the target.

use serde::Deserialize;
use tracing::debug;

use super::pyramid::ImagePyramid;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PixelSelectorSettings {
    /// Side of the regions used for the adaptive threshold (level-0 pixels).
    pub region_size: usize,
    /// Added to the median gradient magnitude of a region.
    pub grad_hist_add: f32,
    /// Initial candidate block size.
    pub initial_block: usize,
    /// Pixels this close to the border are never selected.
    pub border: usize,
    pub max_retries: usize,
}

impl Default for PixelSelectorSettings {
    fn default() -> Self {
        Self {
            region_size: 32,
            grad_hist_add: 7.0,
            initial_block: 4,
            border: 4,
            max_retries: 4,
        }
    }
}

/// A selected pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: usize,
    pub y: usize,
    pub level: usize,
    pub grad_sq: f32,
}

pub struct PixelSelector {
    settings: PixelSelectorSettings,
}

impl PixelSelector {
    pub fn new(settings: PixelSelectorSettings) -> Self {
        Self { settings }
    }

    /// Selects about `target` candidates at `level`, deterministically.
    pub fn select(&self, pyramid: &ImagePyramid, level: usize, target: usize) -> Vec<Candidate> {
        if target == 0 {
            return Vec::new();
        }
        let thresholds = self.region_thresholds(pyramid, level);
        let mut block = self.settings.initial_block.max(1);
        let mut factor = 1.0f32;
        // Smallest attempt with at least `target` candidates, else the largest.
        let mut best: Vec<Candidate> = Vec::new();

        for attempt in 0..=self.settings.max_retries {
            let found = self.select_pass(pyramid, level, &thresholds, block, factor);
            let n = found.len();
            debug!(
                "[PixelSelector] attempt {} block={} factor={:.2} -> {} / {}",
                attempt, block, factor, n, target
            );
            let better = match (best.len() >= target, n >= target) {
                (false, true) => true,
                (false, false) => n > best.len(),
                (true, true) => n < best.len(),
                (true, false) => false,
            };
            if better || attempt == 0 {
                best = found;
            }
            let too_few = (n as f32) < target as f32 / 1.25;
            let too_many = (n as f32) > target as f32 * 1.25;
            if !too_few && !too_many {
                break;
            }
            let ratio = (n.max(1) as f32 / target as f32).sqrt();
            if too_few {
                factor *= 0.8;
                block = ((block as f32 * ratio).floor() as usize).max(1);
            } else {
                factor *= 1.15;
                block = ((block as f32 * ratio).ceil() as usize).max(block + 1);
            }
        }

        if best.len() > target {
            // Deterministic thinning that keeps the spatial spread.
            let stride = best.len() as f64 / target as f64;
            best = (0..target)
                .map(|i| best[((i as f64) * stride) as usize])
                .collect();
        }
        best
    }

    fn select_pass(
        &self,
        pyramid: &ImagePyramid,
        level: usize,
        thresholds: &RegionThresholds,
        block: usize,
        factor: f32,
    ) -> Vec<Candidate> {
        let img = pyramid.level(level);
        let border = (self.settings.border >> level).max(2);
        let mut out = Vec::new();
        if img.width <= 2 * border || img.height <= 2 * border {
            return out;
        }
        let mut by = border;
        while by < img.height - border {
            let mut bx = border;
            while bx < img.width - border {
                let mut best: Option<Candidate> = None;
                for y in by..(by + block).min(img.height - border) {
                    for x in bx..(bx + block).min(img.width - border) {
                        let g = img.grad_sq(x, y);
                        let thr = thresholds.at(x, y) * factor;
                        if g > thr * thr && best.map_or(true, |b| g > b.grad_sq) {
                            best = Some(Candidate { x, y, level, grad_sq: g });
                        }
                    }
                }
                out.extend(best);
                bx += block;
            }
            by += block;
        }
        out
    }

    fn region_thresholds(&self, pyramid: &ImagePyramid, level: usize) -> RegionThresholds {
        let img = pyramid.level(level);
        let region = (self.settings.region_size >> level).max(4);
        let rw = img.width.div_ceil(region);
        let rh = img.height.div_ceil(region);
        let mut raw = vec![0.0f32; rw * rh];

        for ry in 0..rh {
            for rx in 0..rw {
                let mut hist = [0usize; 51];
                let mut count = 0usize;
                for y in ry * region..((ry + 1) * region).min(img.height) {
                    for x in rx * region..((rx + 1) * region).min(img.width) {
                        let g = img.grad_sq(x, y).sqrt().min(50.0) as usize;
                        hist[g] += 1;
                        count += 1;
                    }
                }
                let mut acc = 0usize;
                let mut median = 50usize;
                for (bin, &c) in hist.iter().enumerate() {
                    acc += c;
                    if 2 * acc >= count {
                        median = bin;
                        break;
                    }
                }
                raw[ry * rw + rx] = median as f32 + 1.0 + self.settings.grad_hist_add;
            }
        }

        // 3x3 smoothing over neighbouring regions.
        let mut smoothed = vec![0.0f32; rw * rh];
        for ry in 0..rh {
            for rx in 0..rw {
                let mut sum = 0.0;
                let mut n = 0.0;
                for ny in ry.saturating_sub(1)..(ry + 2).min(rh) {
                    for nx in rx.saturating_sub(1)..(rx + 2).min(rw) {
                        sum += raw[ny * rw + nx];
                        n += 1.0;
                    }
                }
                smoothed[ry * rw + rx] = sum / n;
            }
        }
        RegionThresholds { values: smoothed, region, width: rw }
    }
}

struct RegionThresholds {
    values: Vec<f32>,
    region: usize,
    width: usize,
}

impl RegionThresholds {
    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.values[(y / self.region) * self.width + x / self.region]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::image::ImageAndExposure;

    fn textured(width: usize, height: usize) -> ImagePyramid {
        let data = (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| {
                    let (xf, yf) = (x as f32, y as f32);
                    128.0 + 60.0 * (0.31 * xf).sin() * (0.23 * yf).cos() + 30.0 * (0.07 * (xf + 2.0 * yf)).sin()
                })
            })
            .collect();
        ImagePyramid::build(&ImageAndExposure::new(width, height, data, 0.0).unwrap(), 3)
    }

    #[test]
    fn selection_is_deterministic_and_near_target() {
        let pyr = textured(160, 120);
        let selector = PixelSelector::new(PixelSelectorSettings::default());
        let a = selector.select(&pyr, 0, 300);
        let b = selector.select(&pyr, 0, 300);
        assert_eq!(a, b);
        assert!(a.len() <= 300);
        assert!(a.len() >= 150, "only {} candidates", a.len());
    }

    #[test]
    fn candidates_respect_border_and_level() {
        let pyr = textured(160, 120);
        let selector = PixelSelector::new(PixelSelectorSettings::default());
        for c in selector.select(&pyr, 1, 100) {
            assert_eq!(c.level, 1);
            assert!(c.x >= 2 && c.x < 78 && c.y >= 2 && c.y < 58);
        }
    }

    #[test]
    fn flat_image_yields_nothing() {
        let flat = ImageAndExposure::new(64, 64, vec![100.0; 64 * 64], 0.0).unwrap();
        let pyr = ImagePyramid::build(&flat, 1);
        let selector = PixelSelector::new(PixelSelectorSettings::default());
        assert!(selector.select(&pyr, 0, 50).is_empty());
    }
}
