//! Marginalization prior and the operations that fold variables into it.
//!
//! The prior is a quadratic energy over the tangent spaces of the window
//! frames it is connected to, expanded around each frame's first-estimate
//! linearization state:
//!
//! ```text
//! E(Δ) = 2·bᵀΔ + ΔᵀHΔ,    Δ = x ⊟ x_lin
//! ```
//!
//! Frames are connected on first use and keep their linearization state
//! frozen from then on (see [`KeyFrame::fej`]), so every later Jacobian
//! touching them is evaluated at the same point.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

use crate::frame::CameraModel;
use crate::geometry::Sim3;
use crate::window::keyframe::{FrameState, KeyFrame, FRAME_DIM, PHOTO_DIM, TRANS, VEL};
use crate::window::point::{PointStatus, ResidualState};
use crate::window::types::{FrameId, PointId};
use crate::window::ActiveWindow;

use super::imu_factors::{ImuFactor, ImuFactorContext};
use super::photometric::{add_block, add_rows, linearize, FrameView};

/// Linear prior carrying the information of removed variables.
#[derive(Debug, Clone, Default)]
pub struct MarginalizationPrior {
    frames: Vec<FrameId>,
    linearization: Vec<FrameState>,
    hessian: DMatrix<f64>,
    gradient: DVector<f64>,
}

impl MarginalizationPrior {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            linearization: Vec::new(),
            hessian: DMatrix::zeros(0, 0),
            gradient: DVector::zeros(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[FrameId] {
        &self.frames
    }

    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    pub fn gradient(&self) -> &DVector<f64> {
        &self.gradient
    }

    pub fn contains(&self, frame: FrameId) -> bool {
        self.frames.contains(&frame)
    }

    fn slot(&self, frame: FrameId) -> Option<usize> {
        self.frames.iter().position(|f| *f == frame)
    }

    pub fn linearization_of(&self, frame: FrameId) -> Option<&FrameState> {
        self.slot(frame).map(|i| &self.linearization[i])
    }

    /// Connects a frame to the prior, freezing its linearization state.
    pub fn ensure_frame(&mut self, frame: &mut KeyFrame) {
        if self.contains(frame.id) {
            return;
        }
        let lin = frame.fej.unwrap_or(frame.state);
        frame.fej = Some(lin);
        self.frames.push(frame.id);
        self.linearization.push(lin);
        let n = self.frames.len() * FRAME_DIM;
        self.hessian = self.hessian.clone().resize(n, n, 0.0);
        self.gradient = self.gradient.clone().resize_vertically(n, 0.0);
    }

    /// Strong prior holding the pose and affine brightness of `frame` at its
    /// current value; fixes the gauge of the window.
    pub fn add_anchor(&mut self, frame: &mut KeyFrame, weight: f64) {
        self.ensure_frame(frame);
        if let Some(slot) = self.slot(frame.id) {
            for k in 0..PHOTO_DIM {
                let i = slot * FRAME_DIM + k;
                self.hessian[(i, i)] += weight;
            }
        }
        debug!("[Marginalizer] anchored {}", frame.id);
    }

    /// Stacked `x ⊟ x_lin` for all connected frames.
    pub fn delta<F>(&self, state_of: F) -> Option<DVector<f64>>
    where
        F: Fn(FrameId) -> Option<FrameState>,
    {
        let mut delta = DVector::zeros(self.frames.len() * FRAME_DIM);
        for (slot, (id, lin)) in self.frames.iter().zip(&self.linearization).enumerate() {
            let state = state_of(*id)?;
            delta
                .rows_mut(slot * FRAME_DIM, FRAME_DIM)
                .copy_from(&state.local_difference(lin));
        }
        Some(delta)
    }

    /// Prior energy at the states returned by `state_of`.
    pub fn energy<F>(&self, state_of: F) -> f64
    where
        F: Fn(FrameId) -> Option<FrameState>,
    {
        if self.is_empty() {
            return 0.0;
        }
        match self.delta(state_of) {
            Some(d) => 2.0 * self.gradient.dot(&d) + (d.transpose() * &self.hessian * &d)[(0, 0)],
            None => 0.0,
        }
    }

    /// Gradient `b + HΔ` at the given states.
    pub fn gradient_at<F>(&self, state_of: F) -> DVector<f64>
    where
        F: Fn(FrameId) -> Option<FrameState>,
    {
        match self.delta(state_of) {
            Some(d) => &self.gradient + &self.hessian * d,
            None => self.gradient.clone(),
        }
    }

    /// Folds a quadratic block over `frames` (all already connected) that was
    /// linearized around the current states into the prior.
    pub fn add_block<F>(&mut self, frames: &[FrameId], hessian: &DMatrix<f64>, gradient: &DVector<f64>, state_of: F)
    where
        F: Fn(FrameId) -> Option<FrameState>,
    {
        let slots: Vec<Option<usize>> = frames.iter().map(|f| self.slot(*f)).collect();
        // Shift the block's expansion point from the current state to the
        // linearization state: b_lin = b_cur - H·(x_cur ⊟ x_lin).
        let mut shift = DVector::zeros(frames.len() * FRAME_DIM);
        for (bi, (id, slot)) in frames.iter().zip(&slots).enumerate() {
            if let (Some(slot), Some(state)) = (slot, state_of(*id)) {
                shift
                    .rows_mut(bi * FRAME_DIM, FRAME_DIM)
                    .copy_from(&state.local_difference(&self.linearization[*slot]));
            }
        }
        let b_lin = gradient - hessian * shift;

        for (bi, si) in slots.iter().enumerate() {
            let Some(si) = si else { continue };
            for (bj, sj) in slots.iter().enumerate() {
                let Some(sj) = sj else { continue };
                let mut target = self.hessian.view_mut((si * FRAME_DIM, sj * FRAME_DIM), (FRAME_DIM, FRAME_DIM));
                target += hessian.view((bi * FRAME_DIM, bj * FRAME_DIM), (FRAME_DIM, FRAME_DIM));
            }
            let mut target = self.gradient.rows_mut(si * FRAME_DIM, FRAME_DIM);
            target += b_lin.rows(bi * FRAME_DIM, FRAME_DIM);
        }
    }

    /// Removes a frame's variables by Schur complement onto the rest.
    pub fn eliminate_frame(&mut self, frame: FrameId) {
        let Some(slot) = self.slot(frame) else { return };
        let n = self.frames.len() * FRAME_DIM;
        let marg: Vec<usize> = (slot * FRAME_DIM..(slot + 1) * FRAME_DIM).collect();
        let keep: Vec<usize> = (0..n).filter(|i| !marg.contains(i)).collect();

        let h_mm = self.hessian.select_rows(&marg).select_columns(&marg);
        let h_km = self.hessian.select_rows(&keep).select_columns(&marg);
        let h_kk = self.hessian.select_rows(&keep).select_columns(&keep);
        let b_m = self.gradient.select_rows(&marg);
        let b_k = self.gradient.select_rows(&keep);

        let h_mm_inv = pseudo_inverse(&h_mm);
        let mut h = h_kk - &h_km * &h_mm_inv * h_km.transpose();
        let b = b_k - &h_km * &h_mm_inv * b_m;
        symmetrize(&mut h);

        self.hessian = h;
        self.gradient = b;
        self.frames.remove(slot);
        self.linearization.remove(slot);
        debug!("[Marginalizer] eliminated {} ({} frames in prior)", frame, self.frames.len());
    }

    /// Re-expresses the prior after the world frame is changed by `sim3`.
    ///
    /// Translation and velocity increments scale and rotate with the
    /// transform; rotation (right perturbation), affine and bias increments
    /// are unaffected.
    pub fn transform_world(&mut self, sim3: &Sim3) {
        let n = self.frames.len() * FRAME_DIM;
        if n == 0 {
            return;
        }
        let r_inv = sim3.rotation.inverse().to_rotation_matrix().into_inner() / sim3.scale;
        let mut a_inv = DMatrix::<f64>::identity(n, n);
        for slot in 0..self.frames.len() {
            for offset in [TRANS, VEL] {
                let i = slot * FRAME_DIM + offset;
                a_inv.fixed_view_mut::<3, 3>(i, i).copy_from(&r_inv);
            }
        }
        self.hessian = a_inv.transpose() * &self.hessian * &a_inv;
        self.gradient = a_inv.transpose() * &self.gradient;
        for lin in &mut self.linearization {
            lin.pose = sim3.transform_pose(&lin.pose);
            lin.velocity = sim3.transform_vector(&lin.velocity);
        }
    }
}

fn symmetrize(h: &mut DMatrix<f64>) {
    for i in 0..h.nrows() {
        for j in (i + 1)..h.ncols() {
            let avg = 0.5 * (h[(i, j)] + h[(j, i)]);
            h[(i, j)] = avg;
            h[(j, i)] = avg;
        }
    }
}

/// Pseudo-inverse of a symmetric positive semi-definite matrix; directions
/// with negligible eigenvalues carry no information and are dropped.
fn pseudo_inverse(h: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(h.clone());
    let max = eigen.eigenvalues.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let cutoff = (max * 1e-12).max(1e-12);
    let inv_values = eigen.eigenvalues.map(|v| if v > cutoff { 1.0 / v } else { 0.0 });
    &eigen.eigenvectors * DMatrix::from_diagonal(&inv_values) * eigen.eigenvectors.transpose()
}

/// Outcome of removing a frame from the window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarginalizationReport {
    pub frame: Option<FrameId>,
    pub points_folded: usize,
    pub points_dropped: usize,
    pub residuals_dropped: usize,
    pub imu_factors_folded: usize,
    pub imu_factors_dropped: usize,
}

/// Folds departing variables into a [`MarginalizationPrior`].
#[derive(Debug, Clone, Copy)]
pub struct Marginalizer {
    pub huber_k: f64,
    /// Points whose inverse-depth information is below this are dropped
    /// instead of folded.
    pub min_idepth_hessian: f64,
}

impl Marginalizer {
    pub fn new(huber_k: f64, min_idepth_hessian: f64) -> Self {
        Self { huber_k, min_idepth_hessian }
    }

    /// Folds the given active points into the prior and removes them from
    /// the window. Points that cannot be linearized are dropped. Returns
    /// `(folded, dropped)`.
    pub fn marginalize_points(
        &self,
        window: &mut ActiveWindow,
        prior: &mut MarginalizationPrior,
        points: &[PointId],
        camera: &CameraModel,
    ) -> (usize, usize) {
        let mut folded = 0;
        let mut dropped = 0;
        for id in points {
            if self.fold_point(window, prior, *id, camera) {
                folded += 1;
            } else {
                dropped += 1;
            }
            if let Some(point) = window.point_mut(*id) {
                point.set_status(PointStatus::Marginalized);
            }
            window.remove_point(*id);
        }
        (folded, dropped)
    }

    fn fold_point(&self, window: &mut ActiveWindow, prior: &mut MarginalizationPrior, id: PointId, camera: &CameraModel) -> bool {
        let Some(point) = window.point(id) else { return false };
        if !point.is_active() || point.inlier_residuals().next().is_none() {
            return false;
        }
        let host = point.host;
        let targets: Vec<FrameId> = point.inlier_residuals().map(|r| r.target).collect();

        // Connect every involved frame first so the Jacobians below use the
        // frozen linearization states.
        for f in std::iter::once(host).chain(targets.iter().copied()) {
            if let Some(kf) = window.frame_mut(f) {
                prior.ensure_frame(kf);
            }
        }

        let Some(point) = window.point(id) else { return false };
        let Some(host_kf) = window.frame(host) else { return false };
        let frames: Vec<FrameId> = std::iter::once(host).chain(targets.iter().copied()).collect();
        let dim = frames.len() * FRAME_DIM;
        let mut h_ff = DMatrix::<f64>::zeros(dim, dim);
        let mut b_f = DVector::<f64>::zeros(dim);
        let mut h_fp = DVector::<f64>::zeros(dim);
        let mut h_pp = 0.0;
        let mut b_p = 0.0;

        for (ti, target) in targets.iter().enumerate() {
            let Some(target_kf) = window.frame(*target) else { continue };
            let Some(lin) = linearize(point, point.idepth, &FrameView::of(host_kf), &FrameView::of(target_kf), camera, self.huber_k) else {
                continue;
            };
            let t_off = (ti + 1) * FRAME_DIM;
            let nb = lin.normal_blocks();
            add_block(&mut h_ff, 0, 0, &nb.host_host);
            add_block(&mut h_ff, t_off, t_off, &nb.target_target);
            add_block(&mut h_ff, 0, t_off, &nb.host_target);
            add_block(&mut h_ff, t_off, 0, &nb.host_target.transpose());
            add_rows(&mut b_f, 0, &nb.b_host);
            add_rows(&mut b_f, t_off, &nb.b_target);
            add_rows(&mut h_fp, 0, &nb.host_idepth);
            add_rows(&mut h_fp, t_off, &nb.target_idepth);
            h_pp += nb.idepth_idepth;
            b_p += nb.b_idepth;
        }

        if h_pp < self.min_idepth_hessian || !h_pp.is_finite() {
            return false;
        }
        let h = h_ff - &h_fp * h_fp.transpose() / h_pp;
        let b = b_f - &h_fp * (b_p / h_pp);
        let states: Vec<(FrameId, FrameState)> = frames
            .iter()
            .filter_map(|f| window.frame(*f).map(|kf| (*f, kf.state)))
            .collect();
        prior.add_block(&frames, &h, &b, |f| states.iter().find(|(id, _)| *id == f).map(|(_, s)| *s));
        true
    }

    /// Removes `frame` from the window: hosted points are folded or dropped,
    /// residuals into it are dropped, IMU factors touching it are folded
    /// (when `imu` is given) or dropped, and its variables are eliminated
    /// from the prior.
    pub fn marginalize_frame(
        &self,
        window: &mut ActiveWindow,
        prior: &mut MarginalizationPrior,
        imu_factors: &mut Vec<ImuFactor>,
        frame: FrameId,
        camera: &CameraModel,
        imu: Option<&ImuFactorContext>,
    ) -> MarginalizationReport {
        let mut report = MarginalizationReport { frame: Some(frame), ..Default::default() };
        let Some(kf) = window.frame(frame) else {
            return report;
        };
        let hosted = kf.hosted.clone();

        // Hosted points: active ones are folded, the rest are removed.
        let active: Vec<PointId> = hosted
            .iter()
            .copied()
            .filter(|id| window.point(*id).is_some_and(|p| p.is_active()))
            .collect();
        let (folded, dropped) = self.marginalize_points(window, prior, &active, camera);
        report.points_folded = folded;
        report.points_dropped = dropped;
        for id in hosted {
            if let Some(point) = window.point_mut(id) {
                point.set_status(PointStatus::Marginalized);
                report.points_dropped += 1;
            }
            window.remove_point(id);
        }

        report.residuals_dropped = window.drop_residuals_to(frame);
        // Active points left without any usable observation carry nothing.
        let orphaned: Vec<PointId> = window
            .points()
            .filter(|p| p.is_active() && !p.residuals.iter().any(|r| r.state == ResidualState::Inlier))
            .map(|p| p.id)
            .collect();
        for id in orphaned {
            if let Some(point) = window.point_mut(id) {
                point.set_status(PointStatus::Marginalized);
            }
            window.remove_point(id);
            report.points_dropped += 1;
        }

        let (touching, rest): (Vec<ImuFactor>, Vec<ImuFactor>) = imu_factors.drain(..).partition(|f| f.touches(frame));
        *imu_factors = rest;
        for factor in touching {
            match imu {
                Some(ctx) if self.fold_imu_factor(window, prior, &factor, ctx) => report.imu_factors_folded += 1,
                _ => report.imu_factors_dropped += 1,
            }
        }

        prior.eliminate_frame(frame);
        window.remove_frame(frame);
        debug!(
            "[Marginalizer] removed {}: {} points folded, {} dropped, {} residuals dropped",
            frame, report.points_folded, report.points_dropped, report.residuals_dropped
        );
        report
    }

    fn fold_imu_factor(&self, window: &mut ActiveWindow, prior: &mut MarginalizationPrior, factor: &ImuFactor, ctx: &ImuFactorContext) -> bool {
        for f in [factor.from, factor.to] {
            match window.frame_mut(f) {
                Some(kf) => prior.ensure_frame(kf),
                None => return false,
            }
        }
        let (Some(i), Some(j)) = (window.frame(factor.from), window.frame(factor.to)) else {
            return false;
        };
        let lin = factor.linearize(
            (&i.state, &j.state),
            (i.linearization_state(), j.linearization_state()),
            &ctx.t_cam_imu,
            &ctx.noise,
            ctx.weight,
        );
        let h = DMatrix::from_column_slice(2 * FRAME_DIM, 2 * FRAME_DIM, lin.hessian.as_slice());
        let b = DVector::from_column_slice(lin.gradient.as_slice());
        let states = [(i.id, i.state), (j.id, j.state)];
        prior.add_block(&[factor.from, factor.to], &h, &b, |f| states.iter().find(|(id, _)| *id == f).map(|(_, s)| *s));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::frame::{ImageAndExposure, ImagePyramid};
    use crate::geometry::SE3;
    use crate::optimizer::bundle::{BundleProblem, BundleSolver, SolverSettings};
    use crate::simulation::{BoxRoom, SyntheticSequence};
    use crate::window::keyframe::FrameVector;
    use crate::window::point::{Point, Residual};

    fn keyframe(id: u64, x: f64) -> KeyFrame {
        let img = ImageAndExposure::new(32, 32, vec![100.0; 1024], 0.0).unwrap();
        KeyFrame::new(
            FrameId(id),
            id as f64,
            Arc::new(ImagePyramid::build(&img, 1)),
            FrameState::new(SE3::from_translation(Vector3::new(x, 0.0, 0.0))),
        )
    }

    #[test]
    fn anchor_penalizes_pose_change() {
        let mut prior = MarginalizationPrior::new();
        let mut kf = keyframe(0, 0.0);
        prior.add_anchor(&mut kf, 1e4);
        assert!(kf.fej.is_some());
        let mut moved = kf.state;
        moved.pose.translation.x += 0.1;
        let e = prior.energy(|_| Some(moved));
        assert_relative_eq!(e, 1e4 * 0.01, epsilon = 1e-9);
        // Velocity carries no prior information.
        let mut fast = kf.state;
        fast.velocity.x = 3.0;
        assert_relative_eq!(prior.energy(|_| Some(fast)), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn eliminating_a_frame_keeps_the_relative_constraint() {
        // Two frames tied by a relative x-translation constraint, plus an
        // anchor on the first; removing the first must keep frame 1 pinned.
        let mut prior = MarginalizationPrior::new();
        let mut a = keyframe(0, 0.0);
        let mut b = keyframe(1, 1.0);
        prior.add_anchor(&mut a, 100.0);
        prior.ensure_frame(&mut b);
        let mut h = DMatrix::zeros(2 * FRAME_DIM, 2 * FRAME_DIM);
        h[(0, 0)] = 10.0;
        h[(FRAME_DIM, FRAME_DIM)] = 10.0;
        h[(0, FRAME_DIM)] = -10.0;
        h[(FRAME_DIM, 0)] = -10.0;
        let g = DVector::zeros(2 * FRAME_DIM);
        let (sa, sb) = (a.state, b.state);
        prior.add_block(&[a.id, b.id], &h, &g, |f| if f == a.id { Some(sa) } else { Some(sb) });
        prior.eliminate_frame(a.id);
        assert_eq!(prior.frames(), &[b.id]);
        // Series combination of stiffness 100 and 10.
        assert_relative_eq!(prior.hessian()[(0, 0)], 100.0 * 10.0 / 110.0, epsilon = 1e-9);
    }

    #[test]
    fn add_block_reexpresses_gradient_at_linearization_point() {
        let mut prior = MarginalizationPrior::new();
        let mut kf = keyframe(0, 0.0);
        prior.ensure_frame(&mut kf);
        let mut current = kf.state;
        current.pose.translation.x = 0.5;
        let mut h = DMatrix::zeros(FRAME_DIM, FRAME_DIM);
        h[(0, 0)] = 2.0;
        let g = DVector::zeros(FRAME_DIM);
        // The block is centred at the current state: its energy vanishes there.
        prior.add_block(&[kf.id], &h, &g, |_| Some(current));
        assert_relative_eq!(prior.energy(|_| Some(current)), -0.5, epsilon = 1e-12);
        let mut d = FrameVector::zeros();
        d[0] = 0.1;
        let grad = prior.gradient_at(|_| Some(current.retract(&d)));
        assert_relative_eq!(grad[0], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn world_transform_preserves_energy() {
        let mut prior = MarginalizationPrior::new();
        let mut kf = keyframe(0, 1.0);
        prior.add_anchor(&mut kf, 50.0);
        let mut h = DMatrix::zeros(FRAME_DIM, FRAME_DIM);
        h[(VEL, VEL)] = 3.0;
        h[(TRANS + 1, TRANS + 1)] = 7.0;
        let mut g = DVector::zeros(FRAME_DIM);
        g[TRANS + 2] = 0.4;
        let s = kf.state;
        prior.add_block(&[kf.id], &h, &g, |_| Some(s));

        let mut shifted = kf.state;
        shifted.pose.translation += Vector3::new(0.1, -0.2, 0.05);
        shifted.pose.rotation = shifted.pose.rotation * UnitQuaternion::from_euler_angles(0.01, 0.02, -0.01);
        shifted.velocity = Vector3::new(0.3, 0.0, -0.1);
        let before = prior.energy(|_| Some(shifted));

        let sim3 = Sim3::new(UnitQuaternion::from_euler_angles(0.2, -0.4, 1.0), Vector3::new(1.0, 2.0, 3.0), 2.5);
        prior.transform_world(&sim3);
        let mut moved = shifted;
        moved.pose = sim3.transform_pose(&shifted.pose);
        moved.velocity = sim3.transform_vector(&shifted.velocity);
        let after = prior.energy(|_| Some(moved));
        assert_relative_eq!(before, after, epsilon = 1e-9, max_relative = 1e-9);
    }

    fn solve(window: &mut ActiveWindow, prior: &MarginalizationPrior, camera: &CameraModel) {
        let mut imu_factors: Vec<ImuFactor> = Vec::new();
        let solver = BundleSolver::new(SolverSettings::default());
        for _ in 0..3 {
            solver
                .solve(BundleProblem {
                    window: &mut *window,
                    prior,
                    imu_factors: &mut imu_factors,
                    camera,
                    imu: None,
                    repropagation_threshold: 0.1,
                })
                .unwrap();
        }
    }

    fn nudge(window: &mut ActiveWindow, ids: &[FrameId]) {
        for id in ids {
            let pose = &mut window.frame_mut(*id).unwrap().state.pose;
            pose.translation += Vector3::new(0.03, -0.02, 0.01);
            pose.rotation = pose.rotation * UnitQuaternion::from_euler_angles(0.0, 0.008, -0.004);
        }
    }

    #[test]
    fn marginalizing_the_oldest_frame_keeps_the_solution() {
        let cam = SyntheticSequence::default_camera();
        let room = BoxRoom::default();
        let mut window = ActiveWindow::new(8);
        for k in 0..4u64 {
            let pose = SE3::from_translation(Vector3::new(0.08, 0.02, -0.05) * k as f64);
            let t = k as f64 * 0.1;
            let pyramid = ImagePyramid::build(&room.render(&cam, &pose, t), 1);
            window.insert_frame(KeyFrame::new(FrameId(k), t, Arc::new(pyramid), FrameState::new(pose)));
        }
        let ids = window.frame_ids();
        for host in [FrameId(0), FrameId(1)] {
            let (pose, pyramid) = {
                let kf = window.frame(host).unwrap();
                (kf.state.pose, kf.pyramid.clone())
            };
            for v in (0..8).map(|k| 16.5 + 12.0 * k as f64) {
                for u in (0..11).map(|k| 16.5 + 12.0 * k as f64) {
                    let id = window.allocate_point_id();
                    let Some(mut point) = Point::new_immature(id, host, pyramid.level(0), u, v, 50.0) else { continue };
                    point.idepth = 1.0 / room.depth(&cam, &pose, u, v).unwrap();
                    assert!(point.set_status(PointStatus::Active));
                    point.residuals = ids.iter().filter(|t| **t != host).map(|t| Residual::new(*t)).collect();
                    window.add_point(point);
                }
            }
        }

        let mut prior = MarginalizationPrior::new();
        prior.add_anchor(window.frame_mut(FrameId(0)).unwrap(), 1e6);
        nudge(&mut window, &[FrameId(2), FrameId(3)]);
        solve(&mut window, &prior, &cam);
        let before: Vec<SE3> = ids[1..].iter().map(|id| window.frame(*id).unwrap().state.pose).collect();

        let report = Marginalizer::new(9.0, 1e-4).marginalize_frame(&mut window, &mut prior, &mut Vec::new(), FrameId(0), &cam, None);
        assert!(report.points_folded > 20);
        assert!(window.frame(FrameId(0)).is_none());
        let mut connected = prior.frames().to_vec();
        connected.sort();
        assert_eq!(connected, ids[1..].to_vec());

        // Knock the remaining frames off and let the reduced problem pull
        // them back.
        nudge(&mut window, &[FrameId(2), FrameId(3)]);
        solve(&mut window, &prior, &cam);
        for (id, expected) in ids[1..].iter().zip(&before) {
            let pose = window.frame(*id).unwrap().state.pose;
            assert!(
                (pose.translation - expected.translation).norm() < 1e-2,
                "{id} moved by {:.4}",
                (pose.translation - expected.translation).norm()
            );
            assert!(pose.rotation.angle_to(&expected.rotation) < 5e-3);
        }
    }
}
