//! Direct frame-to-keyframe alignment.
//!
//! The newest keyframe is published by the mapping thread as an immutable
//! [`TrackingReference`]: its pyramid, its state and, per pyramid level, the
//! inverse depths of the active points reprojected into it. A new frame is
//! aligned to that snapshot coarse to fine, jointly estimating the relative
//! pose and the two affine brightness parameters of the new frame.
//!
//! Pose Jacobians come from the reference image gradients and are computed
//! once per snapshot (inverse-compositional). The relative pose is updated
//! by right composition, residuals are Huber weighted, and residuals above
//! a cutoff are saturated and excluded from the normal equations.

use std::sync::Arc;

use nalgebra::{RowVector2, SMatrix, SVector, Vector3};
use serde::Deserialize;
use tracing::debug;

use crate::frame::{CameraModel, ImagePyramid, PyramidLevel};
use crate::geometry::{skew, Sim3, SE3};
use crate::optimizer::photometric::{huber_energy, huber_weight};
use crate::window::{AffineLight, FrameId, FrameState};

use super::result::{CoarseEstimate, FlowIndicators, TrackingFailure};

type Matrix8 = SMatrix<f64, 8, 8>;
type Vector8 = SVector<f64, 8>;
type Vector6 = SVector<f64, 6>;

/// Border kept free around reprojected reference points.
const TRACK_MARGIN: f64 = 2.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Pyramid levels built for every frame.
    pub pyramid_levels: usize,
    /// Gauss-Newton iterations per level, finest first.
    pub iterations_per_level: Vec<usize>,
    pub huber_k: f64,
    /// Residuals above this are saturated (intensity units).
    pub residual_cutoff: f64,
    /// Cutoff used while recovering from a failed frame.
    pub recovery_cutoff: f64,
    /// Minimum fraction of reference points valid at the finest level.
    pub min_valid_fraction: f64,
    /// A frame whose RMSE exceeds this multiple of the last good RMSE diverged.
    pub divergence_factor: f64,
    /// Floor of the RMSE used for the divergence test.
    pub min_reference_rmse: f64,
    /// Hypotheses stop early once one is within this factor of the last RMSE.
    pub good_rmse_factor: f64,
    pub initial_lambda: f64,
    pub convergence_eps: f64,
    /// Consecutive failed frames before tracking is declared lost.
    pub max_lost_frames: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            pyramid_levels: 4,
            iterations_per_level: vec![10, 20, 50, 50],
            huber_k: 9.0,
            residual_cutoff: 40.0,
            recovery_cutoff: 25.0,
            min_valid_fraction: 0.4,
            divergence_factor: 3.0,
            min_reference_rmse: 6.0,
            good_rmse_factor: 1.5,
            initial_lambda: 0.01,
            convergence_eps: 1e-3,
            max_lost_frames: 3,
        }
    }
}

/// A reference point at one pyramid level.
#[derive(Debug, Clone)]
pub struct ReferencePoint {
    pub u: f64,
    pub v: f64,
    pub idepth: f64,
    pub color: f64,
    grad: [f64; 2],
    /// Point in reference camera coordinates.
    point: Vector3<f64>,
    /// Derivative of the reference intensity w.r.t. a right pose increment.
    j_pose: Vector6,
}

impl ReferencePoint {
    fn new(camera: &CameraModel, u: f64, v: f64, idepth: f64, color: f64, grad: [f64; 2]) -> Self {
        let point = camera.unproject(u, v) / idepth;
        Self {
            u,
            v,
            idepth,
            color,
            grad,
            point,
            j_pose: pose_jacobian(camera, &point, grad),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceLevel {
    pub camera: CameraModel,
    pub points: Vec<ReferencePoint>,
}

/// Immutable snapshot of the newest keyframe, shared with the tracker.
#[derive(Debug, Clone)]
pub struct TrackingReference {
    pub keyframe_id: FrameId,
    pub timestamp_s: f64,
    /// Full estimated state, including velocity and bias once inertial.
    pub state: FrameState,
    pub pyramid: Arc<ImagePyramid>,
    pub levels: Vec<ReferenceLevel>,
    /// World definition the pose is expressed in.
    pub world_epoch: u64,
}

impl TrackingReference {
    /// Builds the per-level depth maps from level-0 observations
    /// `(u, v, idepth)` in the reference frame. Coarser levels average the
    /// inverse depths falling into each pixel.
    pub fn new(
        keyframe_id: FrameId,
        timestamp_s: f64,
        state: FrameState,
        pyramid: Arc<ImagePyramid>,
        camera: &CameraModel,
        observations: &[(f64, f64, f64)],
        world_epoch: u64,
    ) -> Self {
        let levels = (0..pyramid.num_levels())
            .map(|lvl| build_level(pyramid.level(lvl), &camera.at_level(lvl), lvl, observations))
            .collect();
        Self {
            keyframe_id,
            timestamp_s,
            state,
            pyramid,
            levels,
            world_epoch,
        }
    }

    pub fn point_count(&self) -> usize {
        self.levels.first().map_or(0, |l| l.points.len())
    }

    #[inline]
    pub fn pose(&self) -> &SE3 {
        &self.state.pose
    }

    #[inline]
    pub fn exposure(&self) -> f64 {
        self.pyramid.exposure_time
    }

    /// The same snapshot expressed after a world change: the pose moves and
    /// inverse depths shrink by the scale.
    pub fn transformed(&self, sim3: &Sim3, world_epoch: u64) -> Self {
        let mut out = self.clone();
        out.state.pose = sim3.transform_pose(&self.state.pose);
        out.state.velocity = sim3.transform_vector(&self.state.velocity);
        out.world_epoch = world_epoch;
        for level in &mut out.levels {
            let camera = level.camera;
            for p in &mut level.points {
                *p = ReferencePoint::new(&camera, p.u, p.v, p.idepth / sim3.scale, p.color, p.grad);
            }
        }
        out
    }
}

fn build_level(level: &PyramidLevel, camera: &CameraModel, lvl: usize, observations: &[(f64, f64, f64)]) -> ReferenceLevel {
    let (w, h) = (level.width, level.height);
    let mut sum = vec![0.0f64; w * h];
    let mut count = vec![0u32; w * h];
    let s = (1usize << lvl) as f64;
    for &(u, v, idepth) in observations {
        if !(idepth > 0.0 && idepth.is_finite()) {
            continue;
        }
        let x = ((u + 0.5) / s - 0.5).round();
        let y = ((v + 0.5) / s - 0.5).round();
        if x < 0.0 || y < 0.0 || x >= w as f64 || y >= h as f64 {
            continue;
        }
        let i = y as usize * w + x as usize;
        sum[i] += idepth;
        count[i] += 1;
    }

    let mut points = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            if count[i] == 0 || !level.in_bounds(x as f64, y as f64, TRACK_MARGIN) {
                continue;
            }
            points.push(ReferencePoint::new(
                camera,
                x as f64,
                y as f64,
                sum[i] / count[i] as f64,
                level.intensity[i] as f64,
                [level.grad_x[i] as f64, level.grad_y[i] as f64],
            ));
        }
    }
    ReferenceLevel { camera: *camera, points }
}

/// `∇I · ∂π/∂p · [I, -[p]×]` for a right increment of the relative pose.
fn pose_jacobian(camera: &CameraModel, p: &Vector3<f64>, grad: [f64; 2]) -> Vector6 {
    let g = RowVector2::new(grad[0], grad[1]) * camera.projection_jacobian(p);
    let j_rot = -(g * skew(p));
    Vector6::new(g[0], g[1], g[2], j_rot[0], j_rot[1], j_rot[2])
}

/// Accumulated system of one evaluation at one level.
struct LevelSystem {
    hessian: Matrix8,
    gradient: Vector8,
    energy: f64,
    /// In-bounds residual terms, saturated ones included.
    terms: usize,
    inliers: usize,
    total: usize,
}

impl LevelSystem {
    fn mean_energy(&self) -> f64 {
        if self.terms == 0 {
            f64::INFINITY
        } else {
            self.energy / self.terms as f64
        }
    }
}

/// Relative-pose parameterization used during alignment.
#[derive(Debug, Clone, Copy)]
struct Alignment {
    /// `T_new_ref`.
    new_from_ref: SE3,
    affine: AffineLight,
}

pub struct CoarseTracker {
    settings: TrackerSettings,
}

impl CoarseTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Tries the pose hypotheses in order and keeps the best alignment.
    /// Stops early once a hypothesis reaches `good_rmse_factor` times
    /// `last_rmse`.
    pub fn track_hypotheses(
        &self,
        reference: &TrackingReference,
        pyramid: &ImagePyramid,
        hypotheses: &[SE3],
        affine_guess: &AffineLight,
        last_rmse: Option<f64>,
        recovery: bool,
    ) -> Result<CoarseEstimate, TrackingFailure> {
        if reference.point_count() == 0 {
            return Err(TrackingFailure::NoReference);
        }
        let mut best: Option<CoarseEstimate> = None;
        let mut last_error = TrackingFailure::NoReference;
        for (index, pose) in hypotheses.iter().enumerate() {
            match self.track(reference, pyramid, pose, affine_guess, last_rmse, recovery) {
                Ok(mut estimate) => {
                    estimate.hypothesis = index;
                    let good_enough = last_rmse.is_some_and(|r| estimate.rmse < self.settings.good_rmse_factor * r);
                    if best.as_ref().map_or(true, |b| estimate.rmse < b.rmse) {
                        best = Some(estimate);
                    }
                    if good_enough {
                        break;
                    }
                }
                Err(e) => last_error = e,
            }
        }
        best.ok_or(last_error)
    }

    /// Aligns `pyramid` to the reference starting from `pose_guess` (`T_wc`).
    pub fn track(
        &self,
        reference: &TrackingReference,
        pyramid: &ImagePyramid,
        pose_guess: &SE3,
        affine_guess: &AffineLight,
        last_rmse: Option<f64>,
        recovery: bool,
    ) -> Result<CoarseEstimate, TrackingFailure> {
        if reference.point_count() == 0 {
            return Err(TrackingFailure::NoReference);
        }
        let cutoff = if recovery {
            self.settings.recovery_cutoff
        } else {
            self.settings.residual_cutoff
        };
        let exposures = (reference.exposure(), pyramid.exposure_time);
        let mut current = Alignment {
            new_from_ref: pose_guess.inverse().compose(reference.pose()),
            affine: *affine_guess,
        };

        let num_levels = reference.levels.len().min(pyramid.num_levels());
        let mut finest: Option<LevelSystem> = None;
        for lvl in (0..num_levels).rev() {
            let level = &reference.levels[lvl];
            if level.points.is_empty() {
                continue;
            }
            let target = pyramid.level(lvl);
            let iterations = self
                .settings
                .iterations_per_level
                .get(lvl)
                .or(self.settings.iterations_per_level.last())
                .copied()
                .unwrap_or(10);

            let mut system = self.evaluate(level, target, reference, &current, exposures, cutoff);
            let mut lambda = self.settings.initial_lambda;
            for _ in 0..iterations {
                let Some(step) = solve_step(&system, lambda) else {
                    lambda *= 4.0;
                    continue;
                };
                let trial = apply_step(&current, &step);
                let trial_system = self.evaluate(level, target, reference, &trial, exposures, cutoff);
                if trial_system.mean_energy() < system.mean_energy() {
                    current = trial;
                    system = trial_system;
                    lambda = (lambda * 0.5).max(1e-6);
                    if step.norm() < self.settings.convergence_eps {
                        break;
                    }
                } else {
                    lambda *= 4.0;
                    if lambda > 1e6 {
                        break;
                    }
                }
            }
            debug!(
                "[CoarseTracker] level {} rmse {:.3} valid {}/{}",
                lvl,
                system.mean_energy().sqrt(),
                system.inliers,
                system.total
            );
            if lvl == 0 {
                finest = Some(system);
            }
        }

        let Some(finest) = finest else {
            return Err(TrackingFailure::NoReference);
        };
        let rmse = finest.mean_energy().sqrt();
        let valid_fraction = finest.inliers as f64 / finest.total.max(1) as f64;
        let pose = reference.pose().compose(&current.new_from_ref.inverse());
        let divergence_limit = self.settings.divergence_factor * last_rmse.unwrap_or(0.0).max(self.settings.min_reference_rmse);
        if !rmse.is_finite() || !pose.is_finite() || rmse > divergence_limit {
            return Err(TrackingFailure::Diverged { rmse });
        }
        if valid_fraction < self.settings.min_valid_fraction {
            return Err(TrackingFailure::LostCandidate { valid_fraction });
        }

        let (scale, _) = AffineLight::relative(&reference.state.affine, exposures.0, &current.affine, exposures.1);
        let mut indicators = flow_indicators(&reference.levels[0], &current.new_from_ref);
        indicators.brightness = scale.ln().abs();
        indicators.valid_fraction = valid_fraction;
        Ok(CoarseEstimate {
            pose,
            affine: current.affine,
            rmse,
            indicators,
            hypothesis: 0,
        })
    }

    fn evaluate(
        &self,
        level: &ReferenceLevel,
        target: &PyramidLevel,
        reference: &TrackingReference,
        alignment: &Alignment,
        exposures: (f64, f64),
        cutoff: f64,
    ) -> LevelSystem {
        let k = self.settings.huber_k;
        let ref_affine = reference.state.affine;
        let (scale, offset) = AffineLight::relative(&ref_affine, exposures.0, &alignment.affine, exposures.1);
        let rotation = alignment.new_from_ref.rotation_matrix();
        let translation = alignment.new_from_ref.translation;

        let mut sys = LevelSystem {
            hessian: Matrix8::zeros(),
            gradient: Vector8::zeros(),
            energy: 0.0,
            terms: 0,
            inliers: 0,
            total: level.points.len(),
        };
        for p in &level.points {
            let pn = rotation * p.point + translation;
            let Some(uv) = level.camera.project(&pn) else {
                continue;
            };
            if !target.in_bounds(uv.x, uv.y, TRACK_MARGIN) {
                continue;
            }
            let Some([intensity, _, _]) = target.interpolate(uv.x, uv.y) else {
                continue;
            };
            let r = intensity - (scale * p.color + offset);
            sys.terms += 1;
            if r.abs() > cutoff {
                sys.energy += huber_energy(cutoff, k);
                continue;
            }
            sys.inliers += 1;
            sys.energy += huber_energy(r, k);
            let w = huber_weight(r, k);
            let mut g = Vector8::zeros();
            g.fixed_rows_mut::<6>(0).copy_from(&(p.j_pose * scale));
            g[6] = -scale * (p.color - ref_affine.b);
            g[7] = -1.0;
            sys.hessian += g * g.transpose() * w;
            sys.gradient += g * (w * r);
        }
        sys
    }
}

/// LM step `(H + λ diag H) δ = -b`.
fn solve_step(sys: &LevelSystem, lambda: f64) -> Option<Vector8> {
    if sys.inliers < 8 {
        return None;
    }
    let mut h = sys.hessian;
    for i in 0..8 {
        h[(i, i)] = h[(i, i)] * (1.0 + lambda) + 1e-9;
    }
    let step = h.cholesky().map(|c| c.solve(&(-sys.gradient)))?;
    step.iter().all(|v| v.is_finite()).then_some(step)
}

fn apply_step(current: &Alignment, step: &Vector8) -> Alignment {
    let xi: Vector6 = step.fixed_rows::<6>(0).into_owned();
    Alignment {
        new_from_ref: current.new_from_ref.compose(&SE3::exp(&xi)),
        affine: AffineLight::new(current.affine.a + step[6], current.affine.b + step[7]),
    }
}

/// RMS image motion of the reference points, with and without rotation.
fn flow_indicators(level0: &ReferenceLevel, new_from_ref: &SE3) -> FlowIndicators {
    let rotation = new_from_ref.rotation_matrix();
    let t = new_from_ref.translation;
    let (mut sum_t, mut sum_rt, mut n) = (0.0, 0.0, 0usize);
    for p in &level0.points {
        let (Some(uv_t), Some(uv_rt)) = (level0.camera.project(&(p.point + t)), level0.camera.project(&(rotation * p.point + t))) else {
            continue;
        };
        sum_t += (uv_t.x - p.u).powi(2) + (uv_t.y - p.v).powi(2);
        sum_rt += (uv_rt.x - p.u).powi(2) + (uv_rt.y - p.v).powi(2);
        n += 1;
    }
    let n = n.max(1) as f64;
    FlowIndicators {
        flow_t: (sum_t / n).sqrt(),
        flow_rt: (sum_rt / n).sqrt(),
        ..FlowIndicators::default()
    }
}
