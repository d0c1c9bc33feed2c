//! Motion model providing initial pose hypotheses for alignment.

use nalgebra::Vector3;

use crate::geometry::{exp_so3, Sim3, SE3};

/// Scalings of the last inter-frame motion tried in order.
const MOTION_SCALES: [f64; 4] = [1.0, 2.0, 0.5, 0.0];

/// Rotation perturbation (rad) used for recovery hypotheses.
const RECOVERY_ROTATION: f64 = 0.02;

/// Constant velocity motion model.
///
/// Keeps the last tracked pose and the motion between the last two tracked
/// frames, expressed in the earlier frame.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    last_pose: Option<SE3>,
    /// `T_prev_last`.
    last_motion: SE3,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with a newly tracked `T_wc`.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = self.last_pose {
            self.last_motion = prev.inverse().compose(pose);
        }
        self.last_pose = Some(*pose);
    }

    pub fn last_pose(&self) -> Option<SE3> {
        self.last_pose
    }

    pub fn last_motion(&self) -> SE3 {
        self.last_motion
    }

    /// Constant velocity prediction.
    pub fn predict(&self) -> Option<SE3> {
        self.last_pose.map(|last| last.compose(&self.last_motion))
    }

    /// Pose hypotheses for the next frame: scaled copies of the last motion
    /// and, in recovery, small rotations around the constant velocity guess.
    pub fn hypotheses(&self, recovery: bool) -> Vec<SE3> {
        let Some(last) = self.last_pose else {
            return Vec::new();
        };
        let xi = self.last_motion.log();
        let mut out: Vec<SE3> = MOTION_SCALES
            .iter()
            .map(|&f| last.compose(&SE3::exp(&(xi * f))))
            .collect();
        if recovery {
            let base = last.compose(&self.last_motion);
            for axis in 0..3 {
                for sign in [1.0, -1.0] {
                    let mut phi = Vector3::zeros();
                    phi[axis] = sign * RECOVERY_ROTATION;
                    out.push(SE3::new(base.rotation * exp_so3(&phi), base.translation));
                }
            }
        }
        out
    }

    /// Re-express the stored poses after a world change.
    pub fn transform_world(&mut self, sim3: &Sim3) {
        self.last_pose = self.last_pose.map(|p| sim3.transform_pose(&p));
        self.last_motion = sim3.transform_relative(&self.last_motion);
    }

    pub fn reset(&mut self) {
        self.last_pose = None;
        self.last_motion = SE3::identity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_velocity_extrapolates() {
        let mut model = MotionModel::new();
        model.update(&SE3::from_translation(Vector3::new(0.0, 0.0, 0.0)));
        model.update(&SE3::from_translation(Vector3::new(0.1, 0.0, 0.0)));
        let predicted = model.predict().unwrap();
        assert_relative_eq!(predicted.translation, Vector3::new(0.2, 0.0, 0.0), epsilon = 1e-9);

        let hyps = model.hypotheses(false);
        assert_eq!(hyps.len(), 4);
        assert_relative_eq!(hyps[1].translation, Vector3::new(0.3, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(hyps[3].translation, Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-9);
        assert_eq!(model.hypotheses(true).len(), 10);
    }
}
