//! Delayed scale and gravity initialization for monocular visual-inertial
//! operation.
//!
//! The initializer watches the up-to-scale keyframe trajectory and the
//! inertial deltas between keyframes. Every new keyframe triggers one
//! estimation attempt over the recent history:
//! - a linear alignment gives the starting point
//! - a Levenberg-Marquardt refinement adds bias priors (tightest for short
//!   histories) and a prior on the log scale centred on the previous
//!   estimate whose sigma grows with every attempt
//!
//! Results land in a [`ProvisionalScaleState`]. Only after the scale sigma
//! has stayed below the threshold for the required number of consecutive
//! keyframes is it converted, in one step, into the committed
//! [`ScaleState`] that the mapper applies to the live estimate.
//!
//! The initializer runs inline on the mapping thread, once per keyframe,
//! after the window optimization and before marginalization. Each attempt
//! is a small dense problem over at most the configured history, so it
//! stays well inside one keyframe period. A commit therefore happens inside
//! the same keyframe step that produced it, in `LocalMapper::commit_scale`,
//! and no other thread ever sees a half-transformed window.

use std::collections::VecDeque;

use nalgebra::Vector3;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::geometry::{Sim3, SE3};
use crate::imu::{ImuBias, PreintegratedImu};
use crate::optimizer::inertial_init_optim::{
    initial_alignment, optimize_inertial_init, InertialInitConfig, InertialInitEstimate, InertialInitProblem,
};
use crate::window::FrameId;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitializerSettings {
    /// Keyframes needed before the first attempt.
    pub min_keyframes: usize,
    /// Longest history used by one attempt.
    pub max_keyframes: usize,
    /// Give up after this many keyframes without convergence.
    pub timeout_keyframes: usize,
    /// Minimum time spanned by the history (seconds).
    pub min_time_span: f64,
    /// Convergence threshold on the standard deviation of the log scale.
    pub scale_sigma_threshold: f64,
    /// Attempts in a row that must satisfy the threshold.
    pub required_consecutive: usize,
    /// Sigma of the log-scale prior on the second attempt.
    pub scale_prior_sigma: f64,
    /// Factor applied to the prior sigma after every attempt.
    pub scale_prior_relaxation: f64,
    pub max_iterations: usize,
}

impl Default for InitializerSettings {
    fn default() -> Self {
        Self {
            min_keyframes: 6,
            max_keyframes: 25,
            timeout_keyframes: 80,
            min_time_span: 1.0,
            scale_sigma_threshold: 0.02,
            required_consecutive: 3,
            scale_prior_sigma: 0.1,
            scale_prior_relaxation: 1.5,
            max_iterations: 20,
        }
    }
}

/// One keyframe as seen by the initializer.
#[derive(Debug, Clone)]
pub struct InitKeyframe {
    pub id: FrameId,
    pub timestamp_s: f64,
    /// Up-to-scale `T_wc`.
    pub pose: SE3,
    /// Integration from the previous keyframe; `None` breaks the chain.
    pub preint_from_previous: Option<PreintegratedImu>,
}

/// Latest estimate; never applied to the live window.
#[derive(Debug, Clone)]
pub struct ProvisionalScaleState {
    pub scale: f64,
    /// Standard deviation of `ln(scale)`.
    pub scale_sigma: f64,
    /// Gravity direction as `R_wg` in the visual world.
    pub rotation_wg: nalgebra::UnitQuaternion<f64>,
    pub bias: ImuBias,
    /// Metric velocities, visual world orientation.
    pub velocities: Vec<(FrameId, Vector3<f64>)>,
    pub keyframes_used: usize,
}

impl ProvisionalScaleState {
    fn from_estimate(ids: &[FrameId], estimate: &InertialInitEstimate, scale_sigma: f64) -> Self {
        Self {
            scale: estimate.scale(),
            scale_sigma,
            rotation_wg: estimate.rwg,
            bias: estimate.bias,
            velocities: ids.iter().copied().zip(estimate.velocities.iter().copied()).collect(),
            keyframes_used: ids.len(),
        }
    }

    /// Converts the estimate into the world change and inertial states the
    /// mapper installs. Consumes the provisional state.
    pub fn commit(self) -> ScaleState {
        // x_new = s · R_wgᵀ · x_visual; gravity becomes (0, 0, -g).
        let alignment = Sim3::new(self.rotation_wg.inverse(), Vector3::zeros(), self.scale);
        let velocities = self
            .velocities
            .iter()
            .map(|(id, v)| (*id, alignment.rotation * v))
            .collect();
        ScaleState {
            alignment,
            bias: self.bias,
            velocities,
            scale_sigma: self.scale_sigma,
        }
    }
}

/// Committed result of the initializer.
#[derive(Debug, Clone)]
pub struct ScaleState {
    /// Maps the visual world into the metric, gravity-aligned world.
    pub alignment: Sim3,
    pub bias: ImuBias,
    /// Velocities in the new world.
    pub velocities: Vec<(FrameId, Vector3<f64>)>,
    pub scale_sigma: f64,
}

impl ScaleState {
    pub fn velocity_of(&self, id: FrameId) -> Option<Vector3<f64>> {
        self.velocities.iter().find(|(f, _)| *f == id).map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone)]
pub enum InitializerStatus {
    Collecting { keyframes: usize },
    Estimated { scale: f64, scale_sigma: f64, consecutive: usize },
    Converged(ScaleState),
    TimedOut,
}

pub struct DelayedInitializer {
    settings: InitializerSettings,
    t_cam_imu: SE3,
    history: VecDeque<InitKeyframe>,
    keyframes_seen: usize,
    attempts: usize,
    consecutive: usize,
    provisional: Option<ProvisionalScaleState>,
    finished: bool,
}

impl DelayedInitializer {
    pub fn new(settings: InitializerSettings, t_cam_imu: SE3) -> Self {
        Self {
            settings,
            t_cam_imu,
            history: VecDeque::new(),
            keyframes_seen: 0,
            attempts: 0,
            consecutive: 0,
            provisional: None,
            finished: false,
        }
    }

    pub fn provisional(&self) -> Option<&ProvisionalScaleState> {
        self.provisional.as_ref()
    }

    pub fn keyframes_seen(&self) -> usize {
        self.keyframes_seen
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.settings.clone(), self.t_cam_imu);
    }

    /// Refreshes stored poses with the latest window optimization.
    pub fn update_poses<F>(&mut self, pose_of: F)
    where
        F: Fn(FrameId) -> Option<SE3>,
    {
        for kf in self.history.iter_mut() {
            if let Some(pose) = pose_of(kf.id) {
                kf.pose = pose;
            }
        }
    }

    pub fn add_keyframe(&mut self, keyframe: InitKeyframe) -> InitializerStatus {
        if self.finished {
            return InitializerStatus::TimedOut;
        }
        self.keyframes_seen += 1;
        if keyframe.preint_from_previous.is_none() && !self.history.is_empty() {
            debug!("[ImuInit] inertial chain broken at {}, restarting history", keyframe.id);
            self.history.clear();
            self.consecutive = 0;
        }
        self.history.push_back(keyframe);
        while self.history.len() > self.settings.max_keyframes {
            self.history.pop_front();
        }

        if self.keyframes_seen > self.settings.timeout_keyframes {
            warn!(
                "[ImuInit] no convergence after {} keyframes, giving up",
                self.keyframes_seen
            );
            self.finished = true;
            self.provisional = None;
            return InitializerStatus::TimedOut;
        }

        let span = match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last.timestamp_s - first.timestamp_s,
            _ => 0.0,
        };
        if self.history.len() < self.settings.min_keyframes || span < self.settings.min_time_span {
            return InitializerStatus::Collecting { keyframes: self.history.len() };
        }

        let Some((ids, estimate, scale_sigma)) = self.estimate(span) else {
            self.consecutive = 0;
            return InitializerStatus::Collecting { keyframes: self.history.len() };
        };
        self.attempts += 1;
        if scale_sigma < self.settings.scale_sigma_threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        let provisional = ProvisionalScaleState::from_estimate(&ids, &estimate, scale_sigma);
        debug!(
            "[ImuInit] attempt {}: scale {:.4} sigma {:.4} ({} in a row)",
            self.attempts, provisional.scale, scale_sigma, self.consecutive
        );

        if self.consecutive >= self.settings.required_consecutive {
            info!(
                "[ImuInit] converged after {} keyframes: scale {:.4} sigma {:.4}",
                self.keyframes_seen, provisional.scale, scale_sigma
            );
            self.finished = true;
            self.provisional = None;
            return InitializerStatus::Converged(provisional.commit());
        }
        let status = InitializerStatus::Estimated {
            scale: provisional.scale,
            scale_sigma,
            consecutive: self.consecutive,
        };
        self.provisional = Some(provisional);
        status
    }

    fn estimate(&self, span: f64) -> Option<(Vec<FrameId>, InertialInitEstimate, f64)> {
        let ids: Vec<FrameId> = self.history.iter().map(|kf| kf.id).collect();
        let preints = self
            .history
            .iter()
            .skip(1)
            .map(|kf| kf.preint_from_previous.clone())
            .collect::<Option<Vec<_>>>()?;
        let scale_prior = self.provisional.as_ref().map(|p| {
            let sigma = self.settings.scale_prior_sigma
                * self.settings.scale_prior_relaxation.powi(self.attempts.saturating_sub(1) as i32);
            (p.scale.ln(), sigma)
        });
        let problem = InertialInitProblem {
            frame_ids: ids.clone(),
            poses: self.history.iter().map(|kf| kf.pose).collect(),
            preints,
            t_cam_imu: self.t_cam_imu,
            scale_prior,
        };

        let initial = initial_alignment(&problem).or_else(|| {
            let previous = self.provisional.as_ref()?;
            Some(InertialInitEstimate {
                log_scale: previous.scale.ln(),
                rwg: previous.rotation_wg,
                bias: previous.bias,
                velocities: ids
                    .iter()
                    .map(|id| {
                        previous
                            .velocities
                            .iter()
                            .find(|(f, _)| f == id)
                            .map_or(Vector3::zeros(), |(_, v)| *v)
                    })
                    .collect(),
            })
        })?;
        let mut config = InertialInitConfig::for_time(span);
        config.max_iterations = self.settings.max_iterations;
        let result = optimize_inertial_init(&problem, initial, &config);
        let scale = result.estimate.scale();
        if !scale.is_finite() || scale <= 0.0 {
            return None;
        }
        Some((ids, result.estimate, result.scale_sigma))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{integrate_batch, ImuNoise};
    use crate::simulation::{CircularTrajectory, ImuSimulator, StaticTrajectory, Trajectory};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn feed<T: Trajectory>(trajectory: &T, true_scale: f64, keyframes: usize) -> (Vec<InitializerStatus>, Sim3) {
        let metric_to_visual = Sim3::new(
            UnitQuaternion::from_euler_angles(-0.4, 0.1, 1.2),
            Vector3::new(0.3, 0.0, -0.1),
            1.0 / true_scale,
        );
        let mut imu = ImuSimulator::ideal(200.0);
        let mut init = DelayedInitializer::new(InitializerSettings::default(), SE3::identity());
        let mut statuses = Vec::new();
        for k in 0..keyframes {
            let t = 0.2 * k as f64;
            let preint = (k > 0).then(|| {
                let t0 = 0.2 * (k - 1) as f64;
                let mut samples = vec![imu.sample(trajectory, t0)];
                samples.extend(imu.samples_between(trajectory, t0, t));
                integrate_batch(&samples, t0, t, ImuBias::zero(), &ImuNoise::default(), 0.05).unwrap()
            });
            let status = init.add_keyframe(InitKeyframe {
                id: FrameId(k as u64 * 3),
                timestamp_s: t,
                pose: metric_to_visual.transform_pose(&trajectory.pose(t)),
                preint_from_previous: preint,
            });
            let done = matches!(status, InitializerStatus::Converged(_) | InitializerStatus::TimedOut);
            statuses.push(status);
            if done {
                break;
            }
        }
        (statuses, metric_to_visual)
    }

    #[test]
    fn converges_to_true_scale_and_gravity() {
        let trajectory = CircularTrajectory::default();
        let (statuses, metric_to_visual) = feed(&trajectory, 3.0, 40);
        let Some(InitializerStatus::Converged(state)) = statuses.last() else {
            panic!("initializer did not converge: {:?}", statuses.last());
        };
        assert!(statuses.len() <= 20);
        assert_relative_eq!(state.alignment.scale, 3.0, max_relative = 0.01);

        // Gravity-aligned: the true world's up axis maps to +z.
        let to_new = state.alignment.compose(&metric_to_visual);
        let up = to_new.rotation * Vector3::z();
        assert!(up.dot(&Vector3::z()) > 0.9995);

        // Velocities are metric in the new world.
        let (id, v) = state.velocities.last().unwrap();
        let t = 0.2 * (id.0 / 3) as f64;
        let expected = to_new.rotation * trajectory.velocity(t);
        assert!((v - expected).norm() < 0.03);
    }

    #[test]
    fn static_camera_times_out() {
        let trajectory = StaticTrajectory { pose: SE3::identity() };
        let (statuses, _) = feed(&trajectory, 1.0, 100);
        assert!(matches!(statuses.last(), Some(InitializerStatus::TimedOut)));
        assert_eq!(statuses.len(), InitializerSettings::default().timeout_keyframes + 1);
        assert!(!statuses.iter().any(|s| matches!(s, InitializerStatus::Converged(_))));
    }

    #[test]
    fn missing_preintegration_restarts_history() {
        let mut init = DelayedInitializer::new(InitializerSettings::default(), SE3::identity());
        for k in 0..4u64 {
            init.add_keyframe(InitKeyframe {
                id: FrameId(k),
                timestamp_s: k as f64,
                pose: SE3::identity(),
                preint_from_previous: None,
            });
        }
        assert_eq!(init.history.len(), 1);
        assert_eq!(init.keyframes_seen(), 4);
    }
}
