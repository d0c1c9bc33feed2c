//! Epipolar tracing of immature points.
//!
//! Each new frame narrows the inverse-depth interval of immature points by
//! a 1-D search along the epipolar segment spanned by the current interval,
//! followed by a few Gauss-Newton steps on the sub-pixel position.

use nalgebra::Vector2;
use serde::Deserialize;

use crate::frame::CameraModel;
use crate::optimizer::photometric::{huber_energy, huber_weight, FrameView};
use crate::window::keyframe::AffineLight;

use super::point::{Point, PATTERN, PATTERN_LEN};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Longest searched segment as a fraction of `width + height`.
    pub max_search_fraction: f64,
    /// Segments shorter than this (px) are not searched again.
    pub min_search_px: f64,
    /// Mean per-pixel energy above which a trace is an outlier.
    pub max_energy_per_pixel: f64,
    /// Uncertainty above this (px) makes the trace badly conditioned.
    pub max_error_px: f64,
    pub gn_iterations: usize,
    /// Failed traces after which a point is given up.
    pub max_failures: u32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            max_search_fraction: 0.027,
            min_search_px: 1.5,
            max_energy_per_pixel: 144.0,
            max_error_px: 10.0,
            gn_iterations: 3,
            max_failures: 3,
        }
    }
}

/// Result of tracing one point in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Interval updated.
    Good,
    /// Interval already tighter than the search resolution, or no parallax.
    Skipped,
    /// Segment start projects outside the image.
    OutOfBounds,
    /// Best match too poor.
    Outlier,
    /// Image gradient nearly perpendicular to the epipolar line.
    BadCondition,
}

struct Epipolar {
    /// `R_th · bearing`.
    rotated: nalgebra::Vector3<f64>,
    /// `t_th`.
    translation: nalgebra::Vector3<f64>,
}

impl Epipolar {
    fn project(&self, camera: &CameraModel, idepth: f64) -> Option<Vector2<f64>> {
        camera.project(&(self.rotated + self.translation * idepth))
    }

    /// Inverse depth whose projection lands on `uv`, solved along the image
    /// axis where the epipolar line moves fastest.
    fn idepth_at(&self, camera: &CameraModel, uv: &Vector2<f64>, dir: &Vector2<f64>) -> f64 {
        let (r, t) = (&self.rotated, &self.translation);
        if dir.x.abs() > dir.y.abs() {
            let xn = (uv.x - camera.cx) / camera.fx;
            (r.x - xn * r.z) / (xn * t.z - t.x)
        } else {
            let yn = (uv.y - camera.cy) / camera.fy;
            (r.y - yn * r.z) / (yn * t.z - t.y)
        }
    }
}

/// Traces `point` (hosted by `host`) in `target`, updating its interval,
/// quality and failure count.
pub fn trace_point(
    point: &mut Point,
    host: &FrameView,
    target: &FrameView,
    camera: &CameraModel,
    settings: &TraceSettings,
    huber_k: f64,
) -> TraceOutcome {
    let t_th = target.state.pose.inverse().compose(&host.state.pose);
    let epi = Epipolar {
        rotated: t_th.rotation * camera.unproject(point.u, point.v),
        translation: t_th.translation,
    };
    let level = target.pyramid.level(0);
    let margin = 4.0;

    let rho_min = point.idepth_min.max(0.0);
    let Some(uv_min) = epi.project(camera, rho_min).filter(|uv| camera.in_bounds(uv, margin)) else {
        return TraceOutcome::OutOfBounds;
    };

    let max_search = settings.max_search_fraction * (camera.width + camera.height) as f64;
    let far = if point.idepth_max.is_finite() {
        epi.project(camera, point.idepth_max)
    } else {
        epi.project(camera, rho_min + 0.01).map(|uv| {
            let d = uv - uv_min;
            let n = d.norm();
            if n > 1e-9 {
                uv_min + d / n * max_search
            } else {
                uv_min
            }
        })
    };
    let Some(uv_max) = far else {
        return TraceOutcome::Skipped;
    };
    let span = uv_max - uv_min;
    let mut dist = span.norm();
    if dist < settings.min_search_px {
        return TraceOutcome::Skipped;
    }
    let dir = span / dist;
    dist = dist.min(max_search);

    let (scale, offset) = AffineLight::relative(&host.state.affine, host.exposure(), &target.state.affine, target.exposure());
    let predicted: Vec<f64> = point.colors.iter().map(|c| scale * *c as f64 + offset).collect();
    let energy_at = |uv: &Vector2<f64>| -> f64 {
        let mut e = 0.0;
        for (k, (dx, dy)) in PATTERN.iter().enumerate() {
            match level.interpolate(uv.x + *dx as f64, uv.y + *dy as f64) {
                Some([i, _, _]) => e += huber_energy(i - predicted[k], huber_k),
                None => return f64::INFINITY,
            }
        }
        e
    };

    let steps = (dist.ceil() as usize).clamp(1, 100);
    let energies: Vec<f64> = (0..=steps)
        .map(|k| energy_at(&(uv_min + dir * (k as f64 * dist / steps as f64))))
        .collect();
    let Some((best_k, best_e)) = energies
        .iter()
        .copied()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))
    else {
        return TraceOutcome::OutOfBounds;
    };
    if !best_e.is_finite() {
        return TraceOutcome::OutOfBounds;
    }
    let second = energies
        .iter()
        .enumerate()
        .filter(|(k, _)| k.abs_diff(best_k) > 2)
        .map(|(_, e)| *e)
        .fold(f64::INFINITY, f64::min);
    point.quality = if best_e > 0.0 { (second / best_e).min(1e4) } else { 1e4 };

    // Sub-pixel refinement along the line.
    let mut s = best_k as f64 * dist / steps as f64;
    let mut energy = best_e;
    for _ in 0..settings.gn_iterations {
        let uv = uv_min + dir * s;
        let mut h = 0.0;
        let mut b = 0.0;
        for (k, (dx, dy)) in PATTERN.iter().enumerate() {
            let Some([i, gx, gy]) = level.interpolate(uv.x + *dx as f64, uv.y + *dy as f64) else { continue };
            let r = i - predicted[k];
            let dd = gx * dir.x + gy * dir.y;
            let w = huber_weight(r, huber_k);
            h += w * dd * dd;
            b += w * dd * r;
        }
        if h < 1e-9 {
            break;
        }
        let step = (-b / h).clamp(-0.5, 0.5);
        let trial = energy_at(&(uv_min + dir * (s + step)));
        if trial < energy {
            s += step;
            energy = trial;
        } else {
            break;
        }
    }

    if energy > settings.max_energy_per_pixel * PATTERN_LEN as f64 {
        point.trace_failures += 1;
        return TraceOutcome::Outlier;
    }

    // Pixel uncertainty from the gradient orientation along the pattern.
    let best_uv = uv_min + dir * s;
    let mut along = 0.0;
    let mut across = 0.0;
    for (dx, dy) in PATTERN.iter() {
        if let Some([_, gx, gy]) = level.interpolate(best_uv.x + *dx as f64, best_uv.y + *dy as f64) {
            along += (gx * dir.x + gy * dir.y).powi(2);
            across += (gy * dir.x - gx * dir.y).powi(2);
        }
    }
    let error_px = if along > 1e-9 { 0.2 + 0.2 * (along + across) / along } else { f64::INFINITY };
    if error_px > settings.max_error_px {
        return TraceOutcome::BadCondition;
    }

    let a = epi.idepth_at(camera, &(best_uv - dir * error_px), &dir);
    let b = epi.idepth_at(camera, &(best_uv + dir * error_px), &dir);
    let (lo, hi) = (a.min(b), a.max(b));
    if !lo.is_finite() || !hi.is_finite() || hi <= 0.0 {
        point.trace_failures += 1;
        return TraceOutcome::Outlier;
    }
    point.idepth_min = lo.max(0.0);
    point.idepth_max = hi;
    point.idepth = 0.5 * (point.idepth_min + point.idepth_max);
    point.trace_interval_px = 2.0 * error_px;
    TraceOutcome::Good
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImagePyramid;
    use crate::geometry::SE3;
    use crate::simulation::{BoxRoom, SyntheticSequence};
    use crate::window::keyframe::FrameState;
    use crate::window::types::{FrameId, PointId};
    use nalgebra::Vector3;

    #[test]
    fn trace_brackets_true_depth() {
        let cam = SyntheticSequence::default_camera();
        let room = BoxRoom::default();
        let host_pose = SE3::identity();
        let target_pose = SE3::from_translation(Vector3::new(0.15, 0.0, 0.0));
        let host_pyr = ImagePyramid::build(&room.render(&cam, &host_pose, 0.0), 1);
        let target_pyr = ImagePyramid::build(&room.render(&cam, &target_pose, 0.1), 1);
        let host_state = FrameState::new(host_pose);
        let target_state = FrameState::new(target_pose);
        let host = FrameView::current(&host_state, &host_pyr);
        let target = FrameView::current(&target_state, &target_pyr);

        let mut traced = 0;
        for (u, v) in [(60.0, 50.0), (90.0, 70.0), (100.0, 40.0), (70.0, 80.0)] {
            let mut point = Point::new_immature(PointId(0), FrameId(0), &host_pyr.levels[0], u, v, 50.0).unwrap();
            let outcome = trace_point(&mut point, &host, &target, &cam, &TraceSettings::default(), 9.0);
            if outcome != TraceOutcome::Good {
                continue;
            }
            traced += 1;
            let truth = 1.0 / room.depth(&cam, &host_pose, u, v).unwrap();
            assert!(
                point.idepth_min - 0.02 <= truth && truth <= point.idepth_max + 0.02,
                "idepth {truth} outside [{}, {}]",
                point.idepth_min,
                point.idepth_max
            );
        }
        assert!(traced >= 2);
    }

    #[test]
    fn pure_rotation_is_skipped() {
        let cam = SyntheticSequence::default_camera();
        let room = BoxRoom::default();
        let pyr = ImagePyramid::build(&room.render(&cam, &SE3::identity(), 0.0), 1);
        let state = FrameState::new(SE3::identity());
        let view = FrameView::current(&state, &pyr);
        let mut point = Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 80.0, 60.0, 50.0).unwrap();
        assert_eq!(trace_point(&mut point, &view, &view, &cam, &TraceSettings::default(), 9.0), TraceOutcome::Skipped);
    }
}
