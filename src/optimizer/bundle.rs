//! Joint photometric-inertial optimization of the active window.
//!
//! Normal equations are built over all window frames (17 dims each) and
//! the inverse depths of active points. Each point couples only to its host
//! and the frames it is observed in, so inverse depths are eliminated by
//! Schur complement and the reduced frame system is solved with
//! Levenberg-Marquardt damping. Energies follow `E ≈ E₀ + 2bᵀδ + δᵀHδ`.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::CameraModel;
use crate::window::keyframe::{FrameState, FRAME_DIM, PHOTO_DIM, VEL};
use crate::window::point::{PointStatus, ResidualState, PATTERN_LEN};
use crate::window::types::{FrameId, PointId};
use crate::window::ActiveWindow;

use super::imu_factors::{ImuFactor, ImuFactorContext};
use super::marginalization::MarginalizationPrior;
use super::photometric::{add_block, add_rows, linearize, point_energy, FrameView, PhotoVector};

#[derive(Debug, Error, PartialEq)]
pub enum SolverError {
    #[error("reduced system is not positive definite")]
    NotPositiveDefinite,
    #[error("non-finite value in the solution")]
    NonFinite,
    #[error("nothing to optimize")]
    Empty,
}

/// Settings of the window optimization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_increase: f64,
    pub lambda_decrease: f64,
    /// Huber threshold on a single pattern residual (intensity units).
    pub huber_k: f64,
    /// A residual whose energy exceeds this times the pattern size becomes
    /// an outlier.
    pub outlier_energy_per_pixel: f64,
    /// Stop when the frame update falls below this norm.
    pub min_step: f64,
    /// Points with less inverse-depth information than this are not folded
    /// into the prior.
    pub min_idepth_hessian: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            initial_lambda: 1e-5,
            lambda_increase: 10.0,
            lambda_decrease: 0.25,
            huber_k: 9.0,
            outlier_energy_per_pixel: 144.0,
            min_step: 1e-6,
            min_idepth_hessian: 1e-4,
        }
    }
}

impl SolverSettings {
    #[inline]
    pub fn outlier_energy(&self) -> f64 {
        self.outlier_energy_per_pixel * PATTERN_LEN as f64
    }
}

/// Everything one solve operates on.
pub struct BundleProblem<'a> {
    pub window: &'a mut ActiveWindow,
    pub prior: &'a MarginalizationPrior,
    pub imu_factors: &'a mut [ImuFactor],
    pub camera: &'a CameraModel,
    /// Present once inertial terms take part; velocity and bias dims are
    /// held fixed otherwise.
    pub imu: Option<&'a ImuFactorContext>,
    /// Bias change that triggers re-integration of an IMU factor.
    pub repropagation_threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleReport {
    pub iterations: usize,
    pub accepted_steps: usize,
    pub initial_energy: f64,
    pub final_energy: f64,
    pub points: usize,
    pub new_outliers: usize,
    pub dropped_points: usize,
}

struct PointBlock {
    id: PointId,
    h_pp: f64,
    b_p: f64,
    /// Frame index and 8-dim coupling to that frame's pose-affine block.
    coupling: Vec<(usize, PhotoVector)>,
}

struct LinearSystem {
    h_ff: DMatrix<f64>,
    b_f: DVector<f64>,
    points: Vec<PointBlock>,
}

pub struct BundleSolver {
    settings: SolverSettings,
}

impl BundleSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Optimizes the window in place. On error the window is left at the
    /// last accepted estimate.
    pub fn solve(&self, problem: BundleProblem) -> Result<BundleReport, SolverError> {
        let BundleProblem { window, prior, imu_factors, camera, imu, repropagation_threshold } = problem;
        let frame_ids = window.frame_ids();
        if frame_ids.len() < 2 {
            return Err(SolverError::Empty);
        }
        let has_points = window.points().any(|p| p.is_active() && p.inlier_residuals().next().is_some());
        if !has_points && imu.is_none() {
            return Err(SolverError::Empty);
        }

        if let Some(ctx) = imu {
            for factor in imu_factors.iter_mut() {
                if let Some(state) = window.frame(factor.from).map(|f| f.state) {
                    if let Err(e) = factor.maybe_repropagate(&state, &ctx.noise, repropagation_threshold) {
                        warn!("[Bundle] repropagation {} -> {} failed: {}", factor.from, factor.to, e);
                    }
                }
            }
        }

        let mut energy = self.total_energy(window, prior, imu_factors, camera, imu);
        if !energy.is_finite() {
            return Err(SolverError::NonFinite);
        }
        let mut report = BundleReport { initial_energy: energy, ..Default::default() };
        let mut lambda = self.settings.initial_lambda;
        let mut system: Option<LinearSystem> = None;

        for iteration in 0..self.settings.max_iterations {
            report.iterations = iteration + 1;
            let sys = match system.take() {
                Some(s) => s,
                None => self.build_system(window, prior, imu_factors, camera, imu, &frame_ids),
            };
            report.points = sys.points.len();

            let (delta_f, delta_p) = solve_damped(&sys, lambda, imu.is_none(), frame_ids.len())?;
            if delta_f.iter().chain(delta_p.iter()).any(|v| !v.is_finite()) {
                return Err(SolverError::NonFinite);
            }

            let backup_frames: Vec<FrameState> = window.frames().iter().map(|f| f.state).collect();
            let backup_points: Vec<(PointId, f64)> = sys
                .points
                .iter()
                .filter_map(|b| window.point(b.id).map(|p| (b.id, p.idepth)))
                .collect();

            apply_step(window, &sys, &delta_f, &delta_p);
            let trial = self.total_energy(window, prior, imu_factors, camera, imu);
            let step_norm = delta_f.norm();

            if trial.is_finite() && trial < energy {
                debug!("[Bundle] it {}: {:.3} -> {:.3} (λ={:.1e})", iteration, energy, trial, lambda);
                energy = trial;
                lambda = (lambda * self.settings.lambda_decrease).max(1e-12);
                report.accepted_steps += 1;
                if step_norm < self.settings.min_step {
                    break;
                }
            } else {
                for (frame, state) in window.frames_mut().iter_mut().zip(backup_frames) {
                    frame.state = state;
                }
                for (id, idepth) in backup_points {
                    if let Some(p) = window.point_mut(id) {
                        p.idepth = idepth;
                    }
                }
                lambda *= self.settings.lambda_increase;
                // Same linearization point: reuse the system.
                system = Some(sys);
                if step_norm < self.settings.min_step {
                    break;
                }
            }
        }
        report.final_energy = energy;

        if window.frames().iter().any(|f| !f.state.is_finite()) {
            return Err(SolverError::NonFinite);
        }
        let final_system = self.build_system(window, prior, imu_factors, camera, imu, &frame_ids);
        for block in &final_system.points {
            if let Some(p) = window.point_mut(block.id) {
                p.idepth_hessian = block.h_pp;
            }
        }
        let (outliers, dropped) = self.classify_residuals(window, camera);
        report.new_outliers = outliers;
        report.dropped_points = dropped;
        debug!(
            "[Bundle] {} iterations, energy {:.3} -> {:.3}, {} points, {} outliers",
            report.iterations, report.initial_energy, report.final_energy, report.points, report.new_outliers
        );
        Ok(report)
    }

    /// Total energy of photometric residuals, IMU factors and the prior at
    /// the current window state.
    pub fn total_energy(
        &self,
        window: &ActiveWindow,
        prior: &MarginalizationPrior,
        imu_factors: &[ImuFactor],
        camera: &CameraModel,
        imu: Option<&ImuFactorContext>,
    ) -> f64 {
        let outlier = self.settings.outlier_energy();
        let mut energy = 0.0;
        for point in window.points().filter(|p| p.is_active()) {
            let Some(host) = window.frame(point.host) else { continue };
            for residual in point.inlier_residuals() {
                let Some(target) = window.frame(residual.target) else { continue };
                energy += point_energy(point, point.idepth, &FrameView::of(host), &FrameView::of(target), camera, self.settings.huber_k)
                    .unwrap_or(outlier);
            }
        }
        if let Some(ctx) = imu {
            for factor in imu_factors {
                if let (Some(i), Some(j)) = (window.frame(factor.from), window.frame(factor.to)) {
                    energy += factor.energy(&i.state, &j.state, &ctx.t_cam_imu, &ctx.noise, ctx.weight);
                }
            }
        }
        energy + prior.energy(|id| window.frame(id).map(|f| f.state))
    }

    fn build_system(
        &self,
        window: &ActiveWindow,
        prior: &MarginalizationPrior,
        imu_factors: &[ImuFactor],
        camera: &CameraModel,
        imu: Option<&ImuFactorContext>,
        frame_ids: &[FrameId],
    ) -> LinearSystem {
        let n = frame_ids.len() * FRAME_DIM;
        let index = |id: FrameId| frame_ids.iter().position(|f| *f == id);
        let mut h_ff = DMatrix::<f64>::zeros(n, n);
        let mut b_f = DVector::<f64>::zeros(n);
        let mut points = Vec::new();

        for point in window.points().filter(|p| p.is_active()) {
            let (Some(host), Some(hi)) = (window.frame(point.host), index(point.host)) else { continue };
            let h_off = hi * FRAME_DIM;
            let mut block = PointBlock { id: point.id, h_pp: 0.0, b_p: 0.0, coupling: vec![(hi, PhotoVector::zeros())] };
            for residual in point.inlier_residuals() {
                let (Some(target), Some(ti)) = (window.frame(residual.target), index(residual.target)) else { continue };
                let Some(lin) = linearize(point, point.idepth, &FrameView::of(host), &FrameView::of(target), camera, self.settings.huber_k) else {
                    continue;
                };
                let t_off = ti * FRAME_DIM;
                let nb = lin.normal_blocks();
                add_block(&mut h_ff, h_off, h_off, &nb.host_host);
                add_block(&mut h_ff, t_off, t_off, &nb.target_target);
                add_block(&mut h_ff, h_off, t_off, &nb.host_target);
                add_block(&mut h_ff, t_off, h_off, &nb.host_target.transpose());
                add_rows(&mut b_f, h_off, &nb.b_host);
                add_rows(&mut b_f, t_off, &nb.b_target);
                block.coupling[0].1 += nb.host_idepth;
                block.coupling.push((ti, nb.target_idepth));
                block.h_pp += nb.idepth_idepth;
                block.b_p += nb.b_idepth;
            }
            if block.h_pp > 0.0 && block.coupling.len() > 1 {
                points.push(block);
            }
        }

        if let Some(ctx) = imu {
            for factor in imu_factors {
                let (Some(i), Some(j)) = (index(factor.from), index(factor.to)) else { continue };
                let (Some(fi), Some(fj)) = (window.frame(factor.from), window.frame(factor.to)) else { continue };
                let lin = factor.linearize(
                    (&fi.state, &fj.state),
                    (fi.linearization_state(), fj.linearization_state()),
                    &ctx.t_cam_imu,
                    &ctx.noise,
                    ctx.weight,
                );
                let offsets = [i * FRAME_DIM, j * FRAME_DIM];
                for (a, oa) in offsets.iter().enumerate() {
                    for (b, ob) in offsets.iter().enumerate() {
                        let mut view = h_ff.fixed_view_mut::<FRAME_DIM, FRAME_DIM>(*oa, *ob);
                        view += lin.hessian.fixed_view::<FRAME_DIM, FRAME_DIM>(a * FRAME_DIM, b * FRAME_DIM);
                    }
                    let mut rows = b_f.fixed_rows_mut::<FRAME_DIM>(*oa);
                    rows += lin.gradient.fixed_rows::<FRAME_DIM>(a * FRAME_DIM);
                }
            }
        }

        if !prior.is_empty() {
            let gradient = prior.gradient_at(|id| window.frame(id).map(|f| f.state));
            let slots: Vec<Option<usize>> = prior.frames().iter().map(|f| index(*f)).collect();
            for (sa, wa) in slots.iter().enumerate() {
                let Some(wa) = wa else { continue };
                for (sb, wb) in slots.iter().enumerate() {
                    let Some(wb) = wb else { continue };
                    let mut view = h_ff.fixed_view_mut::<FRAME_DIM, FRAME_DIM>(wa * FRAME_DIM, wb * FRAME_DIM);
                    view += prior.hessian().fixed_view::<FRAME_DIM, FRAME_DIM>(sa * FRAME_DIM, sb * FRAME_DIM);
                }
                let mut rows = b_f.fixed_rows_mut::<FRAME_DIM>(wa * FRAME_DIM);
                rows += gradient.fixed_rows::<FRAME_DIM>(sa * FRAME_DIM);
            }
        }

        LinearSystem { h_ff, b_f, points }
    }

    /// Re-evaluates every inlier residual at the final estimate: large
    /// energies become outliers, failed projections become out of bounds.
    /// Points left without inliers become outliers (some residual rejected)
    /// or are dropped (only out-of-bounds). Returns `(outliers, dropped)`.
    fn classify_residuals(&self, window: &mut ActiveWindow, camera: &CameraModel) -> (usize, usize) {
        let threshold = self.settings.outlier_energy();
        let mut updates: Vec<(PointId, usize, ResidualState, f64)> = Vec::new();
        for point in window.points().filter(|p| p.is_active()) {
            let Some(host) = window.frame(point.host) else { continue };
            for (k, residual) in point.residuals.iter().enumerate() {
                if residual.state != ResidualState::Inlier {
                    continue;
                }
                let Some(target) = window.frame(residual.target) else { continue };
                let update = match point_energy(point, point.idepth, &FrameView::of(host), &FrameView::of(target), camera, self.settings.huber_k) {
                    None => (ResidualState::OutOfBounds, f64::INFINITY),
                    Some(e) if e > threshold => (ResidualState::Outlier, e),
                    Some(e) => (ResidualState::Inlier, e),
                };
                updates.push((point.id, k, update.0, update.1));
            }
        }
        for (id, k, state, energy) in updates {
            if let Some(r) = window.point_mut(id).and_then(|p| p.residuals.get_mut(k)) {
                r.state = state;
                r.energy = energy;
            }
        }

        let mut outliers = 0;
        let mut dropped = Vec::new();
        for point in window.points_mut().filter(|p| p.is_active()) {
            if point.inlier_residuals().next().is_some() {
                continue;
            }
            if point.residuals.iter().any(|r| r.state == ResidualState::Outlier) {
                point.set_status(PointStatus::Outlier);
                outliers += 1;
            } else {
                point.set_status(PointStatus::Marginalized);
                dropped.push(point.id);
            }
        }
        for id in &dropped {
            window.remove_point(*id);
        }
        (outliers, dropped.len())
    }
}

/// Solves the damped Schur-reduced system; returns frame and inverse-depth
/// increments.
fn solve_damped(sys: &LinearSystem, lambda: f64, fix_inertial: bool, num_frames: usize) -> Result<(DVector<f64>, Vec<f64>), SolverError> {
    let n = sys.h_ff.nrows();
    let mut h = sys.h_ff.clone();
    let mut b = sys.b_f.clone();
    for i in 0..n {
        h[(i, i)] = h[(i, i)] * (1.0 + lambda) + 1e-9;
    }

    let damped_pp: Vec<f64> = sys.points.iter().map(|p| p.h_pp * (1.0 + lambda) + 1e-9).collect();
    for (block, hpp) in sys.points.iter().zip(&damped_pp) {
        for (fa, ca) in &block.coupling {
            for (fb, cb) in &block.coupling {
                add_block(&mut h, fa * FRAME_DIM, fb * FRAME_DIM, &(-(ca * cb.transpose()) / *hpp));
            }
            add_rows(&mut b, fa * FRAME_DIM, &(-ca * (block.b_p / *hpp)));
        }
    }

    if fix_inertial {
        for f in 0..num_frames {
            for k in VEL..FRAME_DIM {
                let i = f * FRAME_DIM + k;
                h.row_mut(i).fill(0.0);
                h.column_mut(i).fill(0.0);
                h[(i, i)] = 1.0;
                b[i] = 0.0;
            }
        }
    }

    let rhs = -b;
    let delta_f = match h.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => h.lu().solve(&rhs).ok_or(SolverError::NotPositiveDefinite)?,
    };

    let delta_p = sys
        .points
        .iter()
        .zip(&damped_pp)
        .map(|(block, hpp)| {
            let coupled: f64 = block
                .coupling
                .iter()
                .map(|(f, c)| c.dot(&delta_f.fixed_rows::<PHOTO_DIM>(f * FRAME_DIM)))
                .sum();
            -(block.b_p + coupled) / hpp
        })
        .collect();
    Ok((delta_f, delta_p))
}

fn apply_step(window: &mut ActiveWindow, sys: &LinearSystem, delta_f: &DVector<f64>, delta_p: &[f64]) {
    for (i, frame) in window.frames_mut().iter_mut().enumerate() {
        let d = delta_f.fixed_rows::<FRAME_DIM>(i * FRAME_DIM).into_owned();
        frame.state = frame.state.retract(&d);
    }
    for (block, dp) in sys.points.iter().zip(delta_p) {
        if let Some(p) = window.point_mut(block.id) {
            p.idepth = (p.idepth + dp).max(1e-4);
        }
    }
}
