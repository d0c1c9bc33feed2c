//! Keyframes and their estimated state.

use std::sync::Arc;

use nalgebra::{SVector, Vector3};

use crate::frame::ImagePyramid;
use crate::geometry::{exp_so3, log_so3, SE3};
use crate::imu::ImuBias;

use super::types::{FrameId, PointId};

/// Dimension of a frame's tangent-space increment.
pub const FRAME_DIM: usize = 17;
/// Offsets inside the increment: translation, rotation, affine, velocity,
/// gyro bias, accel bias.
pub const TRANS: usize = 0;
pub const ROT: usize = 3;
pub const AFFINE: usize = 6;
pub const VEL: usize = 8;
pub const BIAS_GYRO: usize = 11;
pub const BIAS_ACCEL: usize = 14;
/// Pose + affine dims touched by photometric residuals.
pub const PHOTO_DIM: usize = 8;

pub type FrameVector = SVector<f64, FRAME_DIM>;

/// Affine brightness parameters: `I ≈ e^{a} · exposure · L + b`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AffineLight {
    pub a: f64,
    pub b: f64,
}

impl AffineLight {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Transfer `I_target ≈ scale · I_host + offset` between two frames.
    pub fn relative(host: &AffineLight, host_exposure: f64, target: &AffineLight, target_exposure: f64) -> (f64, f64) {
        let scale = (target_exposure * target.a.exp()) / (host_exposure * host.a.exp());
        (scale, target.b - scale * host.b)
    }
}

/// Estimated state of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameState {
    /// `T_wc`, camera-to-world.
    pub pose: SE3,
    pub affine: AffineLight,
    /// Body velocity in the world frame.
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
}

impl FrameState {
    pub fn new(pose: SE3) -> Self {
        Self {
            pose,
            affine: AffineLight::default(),
            velocity: Vector3::zeros(),
            bias: ImuBias::zero(),
        }
    }

    /// `self ⊞ delta`: right perturbation of the rotation, additive elsewhere.
    pub fn retract(&self, delta: &FrameVector) -> Self {
        let dt = delta.fixed_rows::<3>(TRANS).into_owned();
        let dphi = delta.fixed_rows::<3>(ROT).into_owned();
        Self {
            pose: SE3 {
                rotation: self.pose.rotation * exp_so3(&dphi),
                translation: self.pose.translation + dt,
            },
            affine: AffineLight {
                a: self.affine.a + delta[AFFINE],
                b: self.affine.b + delta[AFFINE + 1],
            },
            velocity: self.velocity + delta.fixed_rows::<3>(VEL),
            bias: ImuBias {
                gyro: self.bias.gyro + delta.fixed_rows::<3>(BIAS_GYRO),
                accel: self.bias.accel + delta.fixed_rows::<3>(BIAS_ACCEL),
            },
        }
    }

    /// `self ⊟ reference`, inverse of [`FrameState::retract`].
    pub fn local_difference(&self, reference: &FrameState) -> FrameVector {
        let mut d = FrameVector::zeros();
        d.fixed_rows_mut::<3>(TRANS)
            .copy_from(&(self.pose.translation - reference.pose.translation));
        d.fixed_rows_mut::<3>(ROT)
            .copy_from(&log_so3(&(reference.pose.rotation.inverse() * self.pose.rotation)));
        d[AFFINE] = self.affine.a - reference.affine.a;
        d[AFFINE + 1] = self.affine.b - reference.affine.b;
        d.fixed_rows_mut::<3>(VEL).copy_from(&(self.velocity - reference.velocity));
        d.fixed_rows_mut::<3>(BIAS_GYRO).copy_from(&(self.bias.gyro - reference.bias.gyro));
        d.fixed_rows_mut::<3>(BIAS_ACCEL).copy_from(&(self.bias.accel - reference.bias.accel));
        d
    }

    pub fn is_finite(&self) -> bool {
        self.pose.is_finite()
            && self.affine.a.is_finite()
            && self.affine.b.is_finite()
            && self.velocity.iter().all(|v| v.is_finite())
    }
}

/// A frame admitted to the active window.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: FrameId,
    pub timestamp_s: f64,
    pub pyramid: Arc<ImagePyramid>,
    pub state: FrameState,
    /// Linearization point, frozen once the frame is connected to the
    /// marginalization prior.
    pub fej: Option<FrameState>,
    /// Points hosted by this frame, in creation order.
    pub hosted: Vec<PointId>,
    /// Number of points ever activated in this frame.
    pub activated_count: usize,
}

impl KeyFrame {
    pub fn new(id: FrameId, timestamp_s: f64, pyramid: Arc<ImagePyramid>, state: FrameState) -> Self {
        Self {
            id,
            timestamp_s,
            pyramid,
            state,
            fej: None,
            hosted: Vec::new(),
            activated_count: 0,
        }
    }

    /// State at which Jacobians of this frame are evaluated.
    #[inline]
    pub fn linearization_state(&self) -> &FrameState {
        self.fej.as_ref().unwrap_or(&self.state)
    }

    #[inline]
    pub fn exposure(&self) -> f64 {
        self.pyramid.exposure_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn retract_and_difference_are_inverse() {
        let base = FrameState {
            pose: SE3::new(UnitQuaternion::from_euler_angles(0.2, -0.1, 0.4), Vector3::new(1.0, 2.0, 3.0)),
            affine: AffineLight::new(0.1, -3.0),
            velocity: Vector3::new(0.5, 0.0, -0.2),
            bias: ImuBias::zero(),
        };
        let mut delta = FrameVector::zeros();
        for i in 0..FRAME_DIM {
            delta[i] = 0.01 * (i as f64 + 1.0) * if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let moved = base.retract(&delta);
        assert_relative_eq!(moved.local_difference(&base), delta, epsilon = 1e-12);
    }

    #[test]
    fn relative_affine_is_identity_for_equal_frames() {
        let l = AffineLight::new(0.3, 5.0);
        let (scale, offset) = AffineLight::relative(&l, 2.0, &l, 2.0);
        assert_relative_eq!(scale, 1.0, epsilon = 1e-12);
        assert_relative_eq!(offset, 0.0, epsilon = 1e-12);
        // Doubling the exposure doubles the transfer scale.
        let (scale2, _) = AffineLight::relative(&l, 1.0, &l, 2.0);
        assert_relative_eq!(scale2, 2.0, epsilon = 1e-12);
    }
}
