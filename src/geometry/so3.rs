//! SO(3) helpers shared by preintegration, the photometric Jacobians and the
//! inertial residuals.
//!
//! Rotations are kept as `UnitQuaternion<f64>` everywhere; the tangent space
//! is the usual axis-angle vector. Jacobians follow the right-perturbation
//! convention `R ⊞ φ = R · Exp(φ)`.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Below this angle the series expansions are used.
const SMALL_ANGLE: f64 = 1e-6;

/// Skew-symmetric matrix `[v]×` with `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from axis-angle to a unit quaternion.
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Logarithm map, returning the axis-angle vector with angle in `[0, π]`.
#[inline]
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Right Jacobian `Jr(φ)` of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * k;
    }
    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * k * k
}

/// Inverse right Jacobian `Jr⁻¹(φ)`.
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * k + (1.0 / 12.0) * k * k;
    }
    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * k + coeff * k * k
}

/// Rotation taking unit vector `from` onto unit vector `to` (shortest arc).
///
/// Falls back to a half-turn about an orthogonal axis for opposite vectors.
pub fn rotation_between(from: &Vector3<f64>, to: &Vector3<f64>) -> UnitQuaternion<f64> {
    match UnitQuaternion::rotation_between(from, to) {
        Some(q) => q,
        None => {
            let axis = if from.x.abs() < 0.9 {
                from.cross(&Vector3::x())
            } else {
                from.cross(&Vector3::y())
            };
            UnitQuaternion::from_scaled_axis(axis.normalize() * std::f64::consts::PI)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vector3::new(0.3, -1.2, 2.0);
        let u = Vector3::new(-0.5, 0.7, 0.1);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
        assert_relative_eq!(skew(&v), -skew(&v).transpose(), epsilon = 1e-12);
    }

    #[test]
    fn exp_log_roundtrip() {
        let phi = Vector3::new(0.4, -0.2, 0.9);
        assert_relative_eq!(log_so3(&exp_so3(&phi)), phi, epsilon = 1e-12);
    }

    #[test]
    fn right_jacobian_times_inverse_is_identity() {
        let phi = Vector3::new(0.1, 0.2, 0.3);
        let product = right_jacobian(&phi) * right_jacobian_inv(&phi);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-10);
        assert_relative_eq!(right_jacobian(&Vector3::zeros()), Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn right_jacobian_first_order() {
        // Exp(φ + δ) ≈ Exp(φ) Exp(Jr(φ) δ)
        let phi = Vector3::new(0.5, -0.3, 0.2);
        let delta = Vector3::new(1e-6, -2e-6, 1.5e-6);
        let lhs = exp_so3(&(phi + delta));
        let rhs = exp_so3(&phi) * exp_so3(&(right_jacobian(&phi) * delta));
        assert_relative_eq!(lhs.angle_to(&rhs), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn rotation_between_handles_opposite_vectors() {
        let a = Vector3::new(0.0, 0.0, 1.0);
        let q = rotation_between(&a, &(-a));
        assert_relative_eq!(q * a, -a, epsilon = 1e-12);
    }
}
