//! IMU factors for the joint visual-inertial window optimization.
//!
//! A preintegrated factor constrains consecutive keyframes `i` and `j`
//! through their body poses `T_wb = T_wc · T_cb`, velocities and biases:
//!
//! ```text
//! r_R  = Log(ΔR(b_i)^T · R_i^T · R_j)
//! r_v  = R_i^T · (v_j - v_i - g·Δt) - Δv(b_i)
//! r_p  = R_i^T · (p_j - p_i - v_i·Δt - ½·g·Δt²) - Δp(b_i)
//! r_bg = (bg_j - bg_i) / (σ_gw √Δt)
//! r_ba = (ba_j - ba_i) / (σ_aw √Δt)
//! ```
//!
//! The 9-dim motion part is whitened with the preintegration information.
//! Jacobians are central differences on the frames' 17-dim tangent space,
//! taken at the linearization states.

use nalgebra::{SMatrix, SVector, Vector3};
use tracing::debug;

use crate::geometry::{log_so3, SE3};
use crate::imu::{ImuError, ImuNoise, PreintegratedImu, GRAVITY};
use crate::window::keyframe::{FrameState, FrameVector, FRAME_DIM};
use crate::window::types::FrameId;

pub const IMU_RESIDUAL_DIM: usize = 15;
const PAIR_DIM: usize = 2 * FRAME_DIM;

pub type ImuResidualVector = SVector<f64, IMU_RESIDUAL_DIM>;
pub type ImuJacobian = SMatrix<f64, IMU_RESIDUAL_DIM, PAIR_DIM>;
pub type PairMatrix = SMatrix<f64, PAIR_DIM, PAIR_DIM>;
pub type PairVector = SVector<f64, PAIR_DIM>;

/// Parameters shared by all IMU factors of a window.
#[derive(Debug, Clone, Copy)]
pub struct ImuFactorContext {
    /// `T_cb`: maps IMU-frame points into the camera frame.
    pub t_cam_imu: SE3,
    pub noise: ImuNoise,
    /// Relative weight of inertial against photometric energy.
    pub weight: f64,
}

/// Unwhitened IMU residual between two states.
#[derive(Debug, Clone)]
pub struct ImuResidual {
    pub rotation: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub position: Vector3<f64>,
    pub bias_gyro: Vector3<f64>,
    pub bias_accel: Vector3<f64>,
}

impl ImuResidual {
    /// Motion part `[r_R, r_v, r_p]`.
    pub fn motion(&self) -> SVector<f64, 9> {
        SVector::<f64, 9>::from_iterator(
            self.rotation
                .iter()
                .chain(self.velocity.iter())
                .chain(self.position.iter())
                .copied(),
        )
    }
}

/// Compute the IMU residual between two frame states.
pub fn compute_imu_residual(
    state_i: &FrameState,
    state_j: &FrameState,
    t_cam_imu: &SE3,
    preint: &PreintegratedImu,
    noise: &ImuNoise,
) -> ImuResidual {
    let dt = preint.dt;
    let body_i = state_i.pose.compose(t_cam_imu);
    let body_j = state_j.pose.compose(t_cam_imu);
    let r_i_inv = body_i.rotation.inverse();

    let delta_r = preint.corrected_rotation(&state_i.bias);
    let rotation = log_so3(&(delta_r.inverse() * r_i_inv * body_j.rotation));

    let velocity = r_i_inv * (state_j.velocity - state_i.velocity - GRAVITY * dt) - preint.corrected_velocity(&state_i.bias);

    let position = r_i_inv
        * (body_j.translation - body_i.translation - state_i.velocity * dt - 0.5 * GRAVITY * dt * dt)
        - preint.corrected_position(&state_i.bias);

    let sqrt_dt = dt.max(1e-6).sqrt();
    let bias_gyro = (state_j.bias.gyro - state_i.bias.gyro) / (noise.gyro_random_walk * sqrt_dt);
    let bias_accel = (state_j.bias.accel - state_i.bias.accel) / (noise.accel_random_walk * sqrt_dt);

    ImuResidual { rotation, velocity, position, bias_gyro, bias_accel }
}

/// Preintegrated constraint between two consecutive keyframes.
#[derive(Debug, Clone)]
pub struct ImuFactor {
    pub from: FrameId,
    pub to: FrameId,
    pub preint: PreintegratedImu,
    /// Transposed Cholesky factor of the motion information.
    whitening: SMatrix<f64, 9, 9>,
}

/// Linearized IMU factor over the stacked `[state_i, state_j]` tangent.
#[derive(Debug, Clone)]
pub struct ImuLinearization {
    pub hessian: PairMatrix,
    pub gradient: PairVector,
    pub energy: f64,
}

impl ImuFactor {
    pub fn new(from: FrameId, to: FrameId, preint: PreintegratedImu) -> Self {
        let whitening = whitening_of(&preint);
        Self { from, to, preint, whitening }
    }

    /// Weighted, whitened residual vector.
    pub fn whitened_residual(
        &self,
        state_i: &FrameState,
        state_j: &FrameState,
        t_cam_imu: &SE3,
        noise: &ImuNoise,
        weight: f64,
    ) -> ImuResidualVector {
        let r = compute_imu_residual(state_i, state_j, t_cam_imu, &self.preint, noise);
        let motion = self.whitening * r.motion();
        let w = weight.sqrt();
        let mut out = ImuResidualVector::zeros();
        out.fixed_rows_mut::<9>(0).copy_from(&(motion * w));
        out.fixed_rows_mut::<3>(9).copy_from(&(r.bias_gyro * w));
        out.fixed_rows_mut::<3>(12).copy_from(&(r.bias_accel * w));
        out
    }

    pub fn energy(&self, state_i: &FrameState, state_j: &FrameState, t_cam_imu: &SE3, noise: &ImuNoise, weight: f64) -> f64 {
        self.whitened_residual(state_i, state_j, t_cam_imu, noise, weight).norm_squared()
    }

    /// Residual at the current states, Jacobian at the linearization states.
    #[allow(clippy::too_many_arguments)]
    pub fn linearize(
        &self,
        current: (&FrameState, &FrameState),
        linearization: (&FrameState, &FrameState),
        t_cam_imu: &SE3,
        noise: &ImuNoise,
        weight: f64,
    ) -> ImuLinearization {
        let r = self.whitened_residual(current.0, current.1, t_cam_imu, noise, weight);
        let (lin_i, lin_j) = linearization;
        let mut jac = ImuJacobian::zeros();
        let eps = 1e-6;
        for k in 0..PAIR_DIM {
            let mut delta = FrameVector::zeros();
            delta[k % FRAME_DIM] = eps;
            let (plus, minus) = if k < FRAME_DIM {
                (
                    self.whitened_residual(&lin_i.retract(&delta), lin_j, t_cam_imu, noise, weight),
                    self.whitened_residual(&lin_i.retract(&(-delta)), lin_j, t_cam_imu, noise, weight),
                )
            } else {
                (
                    self.whitened_residual(lin_i, &lin_j.retract(&delta), t_cam_imu, noise, weight),
                    self.whitened_residual(lin_i, &lin_j.retract(&(-delta)), t_cam_imu, noise, weight),
                )
            };
            jac.set_column(k, &((plus - minus) / (2.0 * eps)));
        }
        ImuLinearization {
            hessian: jac.transpose() * jac,
            gradient: jac.transpose() * r,
            energy: r.norm_squared(),
        }
    }

    /// Re-integrates from raw samples when the bias of the first frame has
    /// moved past `threshold` from the linearization bias.
    pub fn maybe_repropagate(&mut self, state_i: &FrameState, noise: &ImuNoise, threshold: f64) -> Result<bool, ImuError> {
        if !self.preint.needs_repropagation(&state_i.bias, threshold) {
            return Ok(false);
        }
        self.preint = self.preint.repropagate(state_i.bias, noise)?;
        self.whitening = whitening_of(&self.preint);
        debug!("[ImuFactor] repropagated {} -> {}", self.from, self.to);
        Ok(true)
    }

    pub fn touches(&self, frame: FrameId) -> bool {
        self.from == frame || self.to == frame
    }
}

pub(crate) fn whitening_of(preint: &PreintegratedImu) -> SMatrix<f64, 9, 9> {
    let info = preint.information();
    match info.cholesky() {
        Some(chol) => chol.l().transpose(),
        None => {
            let mut diag = SMatrix::<f64, 9, 9>::zeros();
            for i in 0..9 {
                diag[(i, i)] = info[(i, i)].max(0.0).sqrt();
            }
            diag
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{integrate_batch, ImuBias, ImuSample};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn free_fall_preint() -> PreintegratedImu {
        // Stationary IMU: accelerometer reads -g.
        let samples: Vec<_> = (0..=20)
            .map(|i| ImuSample::new(i as f64 * 0.005, -GRAVITY, Vector3::zeros()))
            .collect();
        integrate_batch(&samples, 0.0, 0.1, ImuBias::zero(), &ImuNoise::default(), 0.02).unwrap()
    }

    #[test]
    fn consistent_states_give_zero_residual() {
        let preint = free_fall_preint();
        let pose = SE3::new(UnitQuaternion::from_euler_angles(0.3, 0.1, -0.2), Vector3::new(1.0, 2.0, 3.0));
        let state = FrameState::new(pose);
        let r = compute_imu_residual(&state, &state, &SE3::identity(), &preint, &ImuNoise::default());
        assert_relative_eq!(r.motion().norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn moving_frame_is_penalized_and_gradient_points_back() {
        let preint = free_fall_preint();
        let noise = ImuNoise::default();
        let i = FrameState::new(SE3::identity());
        let mut j = i;
        j.pose.translation.x += 0.01;
        let factor = ImuFactor::new(FrameId(0), FrameId(1), preint);
        let lin = factor.linearize((&i, &j), (&i, &j), &SE3::identity(), &noise, 1.0);
        assert!(lin.energy > 0.0);
        // Gauss-Newton step on j's x translation reduces the error.
        let g = lin.gradient[FRAME_DIM];
        let h = lin.hessian[(FRAME_DIM, FRAME_DIM)];
        assert!(h > 0.0);
        assert_relative_eq!(-g / h, -0.01, epsilon = 1e-5);
    }
}
