//! Rigid-body transform used for every pose in the estimator.
//!
//! Poses stored on frames are `T_wc` (camera-to-world): `p_w = R · p_c + t`.

use std::ops::Mul;

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

use super::so3::{skew, exp_so3, log_so3};

/// 6-DoF rigid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self { rotation: UnitQuaternion::identity(), translation }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self ∘ other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    #[inline]
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// SE(3) exponential of `[ρ, φ]` (translation part first).
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let rho = xi.fixed_rows::<3>(0).into_owned();
        let phi = xi.fixed_rows::<3>(3).into_owned();
        Self {
            rotation: exp_so3(&phi),
            translation: left_jacobian(&phi) * rho,
        }
    }

    /// SE(3) logarithm, inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let phi = log_so3(&self.rotation);
        let rho = left_jacobian_inv(&phi) * self.translation;
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&rho);
        xi.fixed_rows_mut::<3>(3).copy_from(&phi);
        xi
    }

    /// Rotation angle (radians) and translation norm of the transform.
    pub fn magnitude(&self) -> (f64, f64) {
        (self.rotation.angle(), self.translation.norm())
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

impl<'a> Mul<&'a SE3> for &'a SE3 {
    type Output = SE3;

    fn mul(self, rhs: &'a SE3) -> SE3 {
        self.compose(rhs)
    }
}

fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < 1e-6 {
        return Matrix3::identity() + 0.5 * k;
    }
    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * k * k
}

fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < 1e-6 {
        return Matrix3::identity() - 0.5 * k + (1.0 / 12.0) * k * k;
    }
    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * k + coeff * k * k
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn exp_log_roundtrip() {
        let t = sample_pose();
        let back = SE3::exp(&t.log());
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-10);
        assert_relative_eq!(back.rotation.angle_to(&t.rotation), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn transform_point_matches_compose() {
        let a = sample_pose();
        let b = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.2, 0.0), Vector3::new(0.0, 1.0, 0.0));
        let p = Vector3::new(0.3, 0.4, 2.0);
        assert_relative_eq!((a * b).transform_point(&p), a.transform_point(&b.transform_point(&p)), epsilon = 1e-12);
    }
}
