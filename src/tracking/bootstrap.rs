//! Monocular bootstrap of the first two keyframes.
//!
//! The first frame seeds points at unit inverse depth. Every following frame
//! is aligned to it by jointly optimizing the relative pose, the affine
//! brightness of the new frame and all inverse depths. Inverse depths are
//! regularized toward their mean, and the mean is renormalized to one after
//! each pyramid level, which fixes the unobservable scale. Once the
//! translational flow is large enough the result becomes the initial map.

use std::sync::Arc;

use nalgebra::{DVector, RowVector2, RowVector3, SMatrix, SVector, Vector3};
use serde::Deserialize;
use tracing::{debug, info};

use crate::frame::{CameraModel, ImagePyramid, PixelSelector, PyramidLevel};
use crate::geometry::{skew, SE3};
use crate::optimizer::photometric::{huber_energy, huber_weight};
use crate::window::{AffineLight, FrameId};

type Matrix8 = SMatrix<f64, 8, 8>;
type Vector8 = SVector<f64, 8>;

const MIN_IDEPTH: f64 = 1e-3;
const MAX_IDEPTH: f64 = 50.0;
const MARGIN: f64 = 2.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Points seeded in the first frame.
    pub num_points: usize,
    /// Pyramid levels used, coarsest first.
    pub levels: usize,
    pub iterations_per_level: usize,
    /// Weight pulling inverse depths toward their mean.
    pub regularization: f64,
    pub huber_k: f64,
    pub residual_cutoff: f64,
    /// RMS translational flow (level-0 pixels) needed to finish.
    pub min_flow_px: f64,
    /// Consecutive frames above the flow threshold.
    pub confirm_frames: usize,
    /// Alignment is restarted from the current frame above this RMSE.
    pub max_rmse: f64,
    /// Restart when no result after this many frames.
    pub max_frames: usize,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            num_points: 400,
            levels: 3,
            iterations_per_level: 8,
            regularization: 50.0,
            huber_k: 9.0,
            residual_cutoff: 40.0,
            min_flow_px: 5.0,
            confirm_frames: 2,
            max_rmse: 15.0,
            max_frames: 40,
        }
    }
}

#[derive(Debug, Clone)]
struct SeedPoint {
    u: f64,
    v: f64,
    idepth: f64,
    /// First-frame intensity at each level, `None` near the border.
    colors: Vec<Option<f64>>,
}

#[derive(Debug, Clone)]
struct FirstFrame {
    id: FrameId,
    timestamp_s: f64,
    pyramid: Arc<ImagePyramid>,
}

/// The map the system starts from.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub first_id: FrameId,
    pub first_timestamp_s: f64,
    pub first_pyramid: Arc<ImagePyramid>,
    /// `(u, v, idepth)` in the first frame.
    pub points: Vec<(f64, f64, f64)>,
    /// `T_wc` of the frame that completed the bootstrap; the first frame is
    /// the world origin.
    pub pose: SE3,
    pub affine: AffineLight,
    pub rmse: f64,
}

#[derive(Debug, Clone)]
pub enum BootstrapStatus {
    /// The frame became the first frame.
    Started,
    /// Aligned, not enough motion yet.
    Tracking { flow_px: f64, rmse: f64 },
    Ready(BootstrapResult),
    /// Alignment failed or took too long; the frame became the first frame.
    Restarted,
}

#[derive(Debug, Clone, Copy)]
struct Estimate {
    /// `T_new_first`.
    new_from_first: SE3,
    affine: AffineLight,
}

struct Evaluation {
    energy: f64,
    terms: usize,
    inliers: usize,
    h_xx: Matrix8,
    b_x: Vector8,
    h_xp: Vec<Vector8>,
    h_pp: Vec<f64>,
    b_p: Vec<f64>,
}

pub struct VisualBootstrap {
    settings: BootstrapSettings,
    camera: CameraModel,
    selector: PixelSelector,
    first: Option<FirstFrame>,
    points: Vec<SeedPoint>,
    estimate: Estimate,
    frames_tracked: usize,
    frames_above_flow: usize,
}

impl VisualBootstrap {
    pub fn new(camera: CameraModel, settings: BootstrapSettings, selector: PixelSelector) -> Self {
        Self {
            settings,
            camera,
            selector,
            first: None,
            points: Vec::new(),
            estimate: Estimate {
                new_from_first: SE3::identity(),
                affine: AffineLight::default(),
            },
            frames_tracked: 0,
            frames_above_flow: 0,
        }
    }

    pub fn has_first(&self) -> bool {
        self.first.is_some()
    }

    pub fn first_id(&self) -> Option<FrameId> {
        self.first.as_ref().map(|f| f.id)
    }

    pub fn reset(&mut self) {
        self.first = None;
        self.points.clear();
        self.frames_tracked = 0;
        self.frames_above_flow = 0;
    }

    /// Makes `pyramid` the first frame and seeds points on it.
    pub fn set_first(&mut self, id: FrameId, timestamp_s: f64, pyramid: Arc<ImagePyramid>) {
        let levels = self.settings.levels.min(pyramid.num_levels()).max(1);
        self.points = self
            .selector
            .select(&pyramid, 0, self.settings.num_points)
            .into_iter()
            .map(|c| {
                let (u, v) = (c.x as f64, c.y as f64);
                let colors = (0..levels)
                    .map(|lvl| {
                        let s = (1usize << lvl) as f64;
                        let level = pyramid.level(lvl);
                        let (ul, vl) = ((u + 0.5) / s - 0.5, (v + 0.5) / s - 0.5);
                        level
                            .in_bounds(ul, vl, MARGIN)
                            .then(|| level.interpolate(ul, vl).map(|s| s[0]))
                            .flatten()
                    })
                    .collect();
                SeedPoint { u, v, idepth: 1.0, colors }
            })
            .collect();
        debug!("[Bootstrap] first frame {} with {} seeds", id.0, self.points.len());
        self.first = Some(FirstFrame { id, timestamp_s, pyramid });
        self.estimate = Estimate {
            new_from_first: SE3::identity(),
            affine: AffineLight::default(),
        };
        self.frames_tracked = 0;
        self.frames_above_flow = 0;
    }

    /// Aligns the next frame to the first one.
    pub fn add_frame(&mut self, id: FrameId, timestamp_s: f64, pyramid: &Arc<ImagePyramid>) -> BootstrapStatus {
        let Some(first) = self.first.clone() else {
            self.set_first(id, timestamp_s, pyramid.clone());
            return BootstrapStatus::Started;
        };
        self.frames_tracked += 1;

        let levels = self.settings.levels.min(pyramid.num_levels()).min(first.pyramid.num_levels()).max(1);
        let mut rmse = f64::INFINITY;
        let mut valid_fraction = 0.0;
        for lvl in (0..levels).rev() {
            let (r, v) = self.optimize_level(pyramid, &first, lvl);
            rmse = r;
            valid_fraction = v;
            self.normalize_scale();
        }

        if !rmse.is_finite() || rmse > self.settings.max_rmse || valid_fraction < 0.5 || self.frames_tracked > self.settings.max_frames {
            info!(
                "[Bootstrap] restarting at frame {} (rmse {:.2}, valid {:.2}, frames {})",
                id.0, rmse, valid_fraction, self.frames_tracked
            );
            self.set_first(id, timestamp_s, pyramid.clone());
            return BootstrapStatus::Restarted;
        }

        let flow_px = self.translational_flow();
        if flow_px > self.settings.min_flow_px {
            self.frames_above_flow += 1;
        } else {
            self.frames_above_flow = 0;
        }
        if self.frames_above_flow < self.settings.confirm_frames.max(1) {
            return BootstrapStatus::Tracking { flow_px, rmse };
        }

        info!(
            "[Bootstrap] done after {} frames: flow {:.2}px rmse {:.2}",
            self.frames_tracked, flow_px, rmse
        );
        let result = BootstrapResult {
            first_id: first.id,
            first_timestamp_s: first.timestamp_s,
            first_pyramid: first.pyramid,
            points: self.points.iter().map(|p| (p.u, p.v, p.idepth)).collect(),
            pose: self.estimate.new_from_first.inverse(),
            affine: self.estimate.affine,
            rmse,
        };
        self.reset();
        BootstrapStatus::Ready(result)
    }

    fn optimize_level(&mut self, pyramid: &ImagePyramid, first: &FirstFrame, lvl: usize) -> (f64, f64) {
        let exposures = (first.pyramid.exposure_time, pyramid.exposure_time);
        let camera = self.camera.at_level(lvl);
        let target = pyramid.level(lvl);
        let mean = self.mean_idepth();
        let mut eval = self.evaluate(&camera, target, lvl, &self.estimate, None, mean, exposures);
        let mut lambda = 0.1;
        for _ in 0..self.settings.iterations_per_level {
            let Some((dx, dp)) = solve(&eval, lambda) else {
                lambda *= 4.0;
                continue;
            };
            let trial = Estimate {
                new_from_first: SE3::exp(&dx.fixed_rows::<6>(0).into_owned()).compose(&self.estimate.new_from_first),
                affine: AffineLight::new(self.estimate.affine.a + dx[6], self.estimate.affine.b + dx[7]),
            };
            let idepths: Vec<f64> = self
                .points
                .iter()
                .zip(dp.iter())
                .map(|(p, d)| (p.idepth + d).clamp(MIN_IDEPTH, MAX_IDEPTH))
                .collect();
            let trial_eval = self.evaluate(&camera, target, lvl, &trial, Some(&idepths), mean, exposures);
            if trial_eval.energy < eval.energy {
                self.estimate = trial;
                for (p, d) in self.points.iter_mut().zip(idepths) {
                    p.idepth = d;
                }
                eval = trial_eval;
                lambda = (lambda * 0.5).max(1e-5);
                if dx.norm() < 1e-5 {
                    break;
                }
            } else {
                lambda *= 4.0;
            }
        }
        let considered = self.points.iter().filter(|p| p.colors.get(lvl).copied().flatten().is_some()).count();
        let photometric_terms = eval.terms.max(1) as f64;
        let rmse = (eval.energy_photometric(self.regularization_energy(mean)) / photometric_terms).sqrt();
        (rmse, eval.inliers as f64 / considered.max(1) as f64)
    }

    /// Residuals, Jacobians and the point-wise blocks of the joint system.
    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        camera: &CameraModel,
        target: &PyramidLevel,
        lvl: usize,
        estimate: &Estimate,
        idepths: Option<&[f64]>,
        mean: f64,
        exposures: (f64, f64),
    ) -> Evaluation {
        let n = self.points.len();
        let (k, cutoff, alpha) = (self.settings.huber_k, self.settings.residual_cutoff, self.settings.regularization);
        let (scale, offset) = AffineLight::relative(&AffineLight::default(), exposures.0, &estimate.affine, exposures.1);
        let rotation = estimate.new_from_first.rotation_matrix();
        let translation = estimate.new_from_first.translation;
        let mut eval = Evaluation {
            energy: 0.0,
            terms: 0,
            inliers: 0,
            h_xx: Matrix8::zeros(),
            b_x: Vector8::zeros(),
            h_xp: vec![Vector8::zeros(); n],
            h_pp: vec![alpha; n],
            b_p: vec![0.0; n],
        };
        let s = (1usize << lvl) as f64;
        for (i, p) in self.points.iter().enumerate() {
            let idepth = idepths.map_or(p.idepth, |d| d[i]);
            let reg = idepth - mean;
            eval.energy += alpha * reg * reg;
            eval.b_p[i] += alpha * reg;

            let Some(color) = p.colors.get(lvl).copied().flatten() else {
                continue;
            };
            let bearing = camera.unproject((p.u + 0.5) / s - 0.5, (p.v + 0.5) / s - 0.5);
            let pn = rotation * (bearing / idepth) + translation;
            let Some(uv) = camera.project(&pn) else {
                continue;
            };
            if !target.in_bounds(uv.x, uv.y, MARGIN) {
                continue;
            }
            let Some([intensity, gx, gy]) = target.interpolate(uv.x, uv.y) else {
                continue;
            };
            let r = intensity - (scale * color + offset);
            eval.terms += 1;
            if r.abs() > cutoff {
                eval.energy += huber_energy(cutoff, k);
                continue;
            }
            eval.inliers += 1;
            eval.energy += huber_energy(r, k);
            let w = huber_weight(r, k);

            let d_img: RowVector3<f64> = RowVector2::new(gx, gy) * camera.projection_jacobian(&pn);
            let j_rot = -(d_img * skew(&pn));
            let mut g = Vector8::zeros();
            g.fixed_rows_mut::<3>(0).copy_from(&d_img.transpose());
            g.fixed_rows_mut::<3>(3).copy_from(&j_rot.transpose());
            g[6] = -scale * color;
            g[7] = -1.0;
            let j_idepth = (d_img * (rotation * (-bearing / (idepth * idepth))))[0];

            eval.h_xx += g * g.transpose() * w;
            eval.b_x += g * (w * r);
            eval.h_xp[i] += g * (w * j_idepth);
            eval.h_pp[i] += w * j_idepth * j_idepth;
            eval.b_p[i] += w * j_idepth * r;
        }
        eval
    }

    fn mean_idepth(&self) -> f64 {
        if self.points.is_empty() {
            return 1.0;
        }
        self.points.iter().map(|p| p.idepth).sum::<f64>() / self.points.len() as f64
    }

    fn regularization_energy(&self, mean: f64) -> f64 {
        self.settings.regularization * self.points.iter().map(|p| (p.idepth - mean).powi(2)).sum::<f64>()
    }

    /// Rescales inverse depths to unit mean and the translation to match.
    fn normalize_scale(&mut self) {
        let mean = self.mean_idepth();
        if !(mean > 0.0 && mean.is_finite()) {
            return;
        }
        for p in &mut self.points {
            p.idepth /= mean;
        }
        self.estimate.new_from_first.translation *= mean;
    }

    /// RMS level-0 pixel shift caused by the translation alone.
    fn translational_flow(&self) -> f64 {
        let t: Vector3<f64> = self.estimate.new_from_first.translation;
        let (mut sum, mut n) = (0.0, 0usize);
        for p in &self.points {
            let point = self.camera.unproject(p.u, p.v) / p.idepth;
            if let Some(uv) = self.camera.project(&(point + t)) {
                sum += (uv.x - p.u).powi(2) + (uv.y - p.v).powi(2);
                n += 1;
            }
        }
        (sum / n.max(1) as f64).sqrt()
    }
}

impl Evaluation {
    fn energy_photometric(&self, regularization: f64) -> f64 {
        (self.energy - regularization).max(0.0)
    }
}

/// Schur complement on the inverse depths, then LM on the 8 frame dims.
fn solve(eval: &Evaluation, lambda: f64) -> Option<(Vector8, DVector<f64>)> {
    if eval.inliers < 8 {
        return None;
    }
    let mut h = eval.h_xx;
    let mut b = eval.b_x;
    let h_pp: Vec<f64> = eval.h_pp.iter().map(|v| v * (1.0 + lambda)).collect();
    for i in 0..h_pp.len() {
        h -= eval.h_xp[i] * eval.h_xp[i].transpose() / h_pp[i];
        b -= eval.h_xp[i] * (eval.b_p[i] / h_pp[i]);
    }
    for i in 0..8 {
        h[(i, i)] = h[(i, i)] * (1.0 + lambda) + 1e-9;
    }
    let dx = h.cholesky().map(|c| c.solve(&(-b)))?;
    let dp = DVector::from_iterator(
        h_pp.len(),
        (0..h_pp.len()).map(|i| -(eval.b_p[i] + eval.h_xp[i].dot(&dx)) / h_pp[i]),
    );
    (dx.iter().all(|v| v.is_finite()) && dp.iter().all(|v| v.is_finite())).then_some((dx, dp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelSelectorSettings;
    use crate::simulation::{CircularTrajectory, ImuSimulator, SyntheticSequence};

    #[test]
    fn bootstrap_finds_translation_direction() {
        let camera = SyntheticSequence::default_camera();
        let mut seq = SyntheticSequence::new(camera, 20.0, Box::new(CircularTrajectory::default()), ImuSimulator::ideal(200.0));
        let mut boot = VisualBootstrap::new(
            camera,
            BootstrapSettings::default(),
            PixelSelector::new(PixelSelectorSettings::default()),
        );

        let first_pose = seq.frame(0).ground_truth;
        let mut result = None;
        for i in 0..40u64 {
            let frame = seq.frame(i);
            let pyramid = Arc::new(ImagePyramid::build(&frame.image, 4));
            match boot.add_frame(FrameId(i), frame.image.timestamp_s, &pyramid) {
                BootstrapStatus::Ready(r) => {
                    result = Some((r, frame.ground_truth));
                    break;
                }
                BootstrapStatus::Restarted => panic!("bootstrap restarted at frame {i}"),
                _ => {}
            }
        }
        let (result, truth) = result.expect("bootstrap never finished");
        assert_eq!(result.first_id, FrameId(0));
        let true_rel = first_pose.inverse().compose(&truth);
        let est_dir = result.pose.translation.normalize();
        let true_dir = true_rel.translation.normalize();
        assert!(est_dir.dot(&true_dir) > 0.9, "direction {est_dir:?} vs {true_dir:?}");
        assert!(result.pose.rotation.angle_to(&true_rel.rotation) < 0.02);
        let mean: f64 = result.points.iter().map(|p| p.2).sum::<f64>() / result.points.len() as f64;
        approx::assert_relative_eq!(mean, 1.0, epsilon = 1e-6);
    }
}
