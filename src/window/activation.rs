//! Promotion of immature points to active points.

use std::collections::HashSet;

use tracing::debug;

use crate::frame::CameraModel;
use crate::optimizer::photometric::{linearize, point_energy, FrameView};

use super::point::{PointStatus, Residual};
use super::types::{FrameId, PointId};
use super::window::ActiveWindow;

/// Thresholds used when activating points.
#[derive(Debug, Clone, Copy)]
pub struct ActivationParams {
    /// Desired number of active points in the window.
    pub target_active: usize,
    /// Minimum ratio second-best / best of the last trace.
    pub min_quality: f64,
    /// Maximum pixel length of the last trace interval.
    pub max_interval_px: f64,
    pub huber_k: f64,
    pub outlier_energy: f64,
    pub min_idepth_hessian: f64,
    pub gn_iterations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub activated: usize,
    pub rejected: usize,
}

/// Activates immature points, spreading them over the newest keyframe with
/// an adaptive minimum spacing.
#[derive(Debug, Clone)]
pub struct PointActivator {
    min_distance: f64,
}

impl Default for PointActivator {
    fn default() -> Self {
        Self { min_distance: 2.0 }
    }
}

impl PointActivator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_distance(&self) -> f64 {
        self.min_distance
    }

    pub fn activate(&mut self, window: &mut ActiveWindow, camera: &CameraModel, params: &ActivationParams) -> ActivationReport {
        let mut report = ActivationReport::default();
        if window.len() < 2 {
            return report;
        }
        let active = window.count_with_status(PointStatus::Active);
        let target = params.target_active as f64;
        if (active as f64) < 0.5 * target {
            self.min_distance -= 1.0;
        } else if (active as f64) < 0.66 * target {
            self.min_distance -= 0.5;
        } else if (active as f64) > 1.5 * target {
            self.min_distance += 0.8;
        } else if (active as f64) > target {
            self.min_distance += 0.3;
        }
        self.min_distance = self.min_distance.clamp(0.0, 4.0);
        let quota = params.target_active.saturating_sub(active);
        if quota == 0 {
            return report;
        }

        let Some(newest) = window.newest() else { return report };
        let newest_id = newest.id;
        let cell_px = 2.0 + 2.0 * self.min_distance;
        let cell_of = |u: f64, v: f64| ((u / cell_px) as i64, (v / cell_px) as i64);

        let mut occupied: HashSet<(i64, i64)> = HashSet::new();
        for point in window.points().filter(|p| p.is_active()) {
            if let Some(uv) = project_into(window, point.id, newest_id, point.idepth, camera) {
                occupied.insert(cell_of(uv.0, uv.1));
            }
        }

        let mut candidates: Vec<(PointId, f64)> = window
            .points()
            .filter(|p| {
                p.status == PointStatus::Immature
                    && p.idepth_max.is_finite()
                    && p.idepth_max > 0.0
                    && p.quality >= params.min_quality
                    && p.trace_interval_px < params.max_interval_px
            })
            .map(|p| (p.id, p.trace_interval_px))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        for (id, _) in candidates {
            if report.activated >= quota {
                break;
            }
            let Some(point) = window.point(id) else { continue };
            let Some(uv) = project_into(window, id, newest_id, point.idepth, camera) else { continue };
            let cell = cell_of(uv.0, uv.1);
            if occupied.contains(&cell) {
                continue;
            }
            match optimize_idepth(window, id, camera, params) {
                Some((idepth, hessian, residuals)) => {
                    let host = point.host;
                    if let Some(p) = window.point_mut(id) {
                        p.idepth = idepth;
                        p.idepth_hessian = hessian;
                        p.residuals = residuals;
                        p.set_status(PointStatus::Active);
                    }
                    if let Some(kf) = window.frame_mut(host) {
                        kf.activated_count += 1;
                    }
                    occupied.insert(cell);
                    report.activated += 1;
                }
                None => {
                    if let Some(p) = window.point_mut(id) {
                        p.set_status(PointStatus::Marginalized);
                    }
                    window.remove_point(id);
                    report.rejected += 1;
                }
            }
        }
        debug!(
            "[Activation] {} activated, {} rejected (min distance {:.1})",
            report.activated, report.rejected, self.min_distance
        );
        report
    }
}

fn project_into(window: &ActiveWindow, id: PointId, target: FrameId, idepth: f64, camera: &CameraModel) -> Option<(f64, f64)> {
    let point = window.point(id)?;
    let host = window.frame(point.host)?;
    let target = window.frame(target)?;
    let p_world = host.state.pose.transform_point(&(camera.unproject(point.u, point.v) / idepth.max(1e-6)));
    let uv = camera.project(&target.state.pose.inverse().transform_point(&p_world))?;
    camera.in_bounds(&uv, 0.0).then_some((uv.x, uv.y))
}

/// Gauss-Newton on the inverse depth against every other window frame with
/// the frame states held fixed. Returns `(idepth, hessian, inlier residuals)`
/// or `None` when no frame observes the point acceptably.
fn optimize_idepth(window: &ActiveWindow, id: PointId, camera: &CameraModel, params: &ActivationParams) -> Option<(f64, f64, Vec<Residual>)> {
    let point = window.point(id)?;
    let host = window.frame(point.host)?;
    let host_view = FrameView::of(host);
    let targets: Vec<_> = window.frames().iter().filter(|f| f.id != point.host).collect();

    let energy_at = |rho: f64| -> f64 {
        targets
            .iter()
            .map(|t| point_energy(point, rho, &host_view, &FrameView::of(t), camera, params.huber_k).unwrap_or(params.outlier_energy))
            .sum()
    };

    let mut idepth = point.idepth.max(1e-4);
    let mut energy = energy_at(idepth);
    let mut hessian = 0.0;
    for _ in 0..params.gn_iterations.max(1) {
        let mut h = 0.0;
        let mut b = 0.0;
        for t in &targets {
            if let Some(lin) = linearize(point, idepth, &host_view, &FrameView::of(t), camera, params.huber_k) {
                if lin.energy < params.outlier_energy {
                    let (hh, bb) = lin.idepth_terms();
                    h += hh;
                    b += bb;
                }
            }
        }
        hessian = h;
        if h < 1e-12 {
            break;
        }
        let step = -b / h;
        let trial_idepth = (idepth + step).max(1e-4);
        let trial = energy_at(trial_idepth);
        if trial < energy {
            idepth = trial_idepth;
            energy = trial;
        } else {
            break;
        }
    }

    let residuals: Vec<Residual> = targets
        .iter()
        .filter_map(|t| {
            let e = point_energy(point, idepth, &host_view, &FrameView::of(t), camera, params.huber_k)?;
            (e < params.outlier_energy).then(|| Residual { energy: e, ..Residual::new(t.id) })
        })
        .collect();
    if residuals.is_empty() || hessian < params.min_idepth_hessian || !idepth.is_finite() {
        return None;
    }
    Some((idepth, hessian, residuals))
}
