//! Similarity transform used to re-express the world when metric scale and
//! gravity direction become known.
//!
//! A world change `x' = s · R · x + t` maps camera poses, velocities and
//! inverse depths; the estimator applies it once, at the scale commit.

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// 7-DoF similarity: rotation, translation and scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self { rotation, translation, scale }
    }

    /// S⁻¹ = [(1/s) Rᵀ | -(1/s) Rᵀ t].
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Self {
            rotation,
            translation: -(rotation * self.translation) * scale,
            scale,
        }
    }

    /// `self ∘ other`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Re-express a camera-to-world pose in the transformed world.
    ///
    /// The camera frame itself keeps its metric definition, so only the
    /// rotation and the camera centre change.
    pub fn transform_pose(&self, pose_wc: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * pose_wc.rotation,
            translation: self.transform_point(&pose_wc.translation),
        }
    }

    /// Velocities live in the world frame and scale like translations.
    #[inline]
    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * v)
    }

    /// Relative camera motion `T_ab` expressed after the world change.
    pub fn transform_relative(&self, t_ab: &SE3) -> SE3 {
        SE3 {
            rotation: t_ab.rotation,
            translation: t_ab.translation * self.scale,
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
