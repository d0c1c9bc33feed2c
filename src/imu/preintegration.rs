//! On-manifold IMU preintegration (Forster et al.).
//!
//! Integrates gyro/accelerometer samples between two frame timestamps into a
//! relative motion delta `{ΔR, Δv, Δp}` expressed in the body frame of the
//! first frame, together with its 9×9 covariance and the first-order bias
//! Jacobians used to correct the delta after a bias update.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::geometry::so3::{exp_so3, right_jacobian, skew};

use super::batch::{check_coverage, ImuError};
use super::sample::{ImuBias, ImuNoise, ImuSample};
use super::types::{Matrix6, Matrix9, Matrix9x6};

/// Preintegrated motion between two frames.
#[derive(Debug, Clone)]
pub struct PreintegratedImu {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    /// Integrated duration (s).
    pub dt: f64,
    /// Covariance of `[δθ, δv, δp]`.
    pub covariance: Matrix9,
    pub d_rot_d_bg: Matrix3<f64>,
    pub d_vel_d_bg: Matrix3<f64>,
    pub d_vel_d_ba: Matrix3<f64>,
    pub d_pos_d_bg: Matrix3<f64>,
    pub d_pos_d_ba: Matrix3<f64>,
    /// Bias the delta was integrated with.
    pub bias_lin: ImuBias,
    pub t_start: f64,
    pub t_end: f64,
    /// Raw samples kept for re-integration after a large bias change.
    pub samples: Vec<ImuSample>,
}

impl PreintegratedImu {
    fn empty(bias: ImuBias, t_start: f64) -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            covariance: Matrix9::zeros(),
            d_rot_d_bg: Matrix3::zeros(),
            d_vel_d_bg: Matrix3::zeros(),
            d_vel_d_ba: Matrix3::zeros(),
            d_pos_d_bg: Matrix3::zeros(),
            d_pos_d_ba: Matrix3::zeros(),
            bias_lin: bias,
            t_start,
            t_end: t_start,
            samples: Vec::new(),
        }
    }

    /// Delta rotation corrected to first order for a new gyro bias.
    pub fn corrected_rotation(&self, bias: &ImuBias) -> UnitQuaternion<f64> {
        let dbg = bias.gyro - self.bias_lin.gyro;
        self.delta_rot * exp_so3(&(self.d_rot_d_bg * dbg))
    }

    pub fn corrected_velocity(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias_lin.gyro;
        let dba = bias.accel - self.bias_lin.accel;
        self.delta_vel + self.d_vel_d_bg * dbg + self.d_vel_d_ba * dba
    }

    pub fn corrected_position(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias_lin.gyro;
        let dba = bias.accel - self.bias_lin.accel;
        self.delta_pos + self.d_pos_d_bg * dbg + self.d_pos_d_ba * dba
    }

    /// True when `bias` has moved far enough from the linearization bias that
    /// the first-order correction is no longer trusted. Accelerometer bias is
    /// compared at a tenth of its magnitude.
    pub fn needs_repropagation(&self, bias: &ImuBias, threshold: f64) -> bool {
        let dbg = (bias.gyro - self.bias_lin.gyro).norm();
        let dba = (bias.accel - self.bias_lin.accel).norm();
        dbg > threshold || 0.1 * dba > threshold
    }

    /// Re-integrates the stored raw samples with a new linearization bias.
    pub fn repropagate(&self, bias: ImuBias, noise: &ImuNoise) -> Result<Self, ImuError> {
        integrate_batch(&self.samples, self.t_start, self.t_end, bias, noise, f64::INFINITY)
    }

    /// Information matrix of the 9-dim delta, regularised if near singular.
    pub fn information(&self) -> Matrix9 {
        let mut cov = self.covariance;
        for i in 0..9 {
            cov[(i, i)] += 1e-12;
        }
        cov.try_inverse().unwrap_or_else(|| Matrix9::identity() * 1e6)
    }
}

/// IMU preintegrator: accumulates midpoint steps into a [`PreintegratedImu`].
pub struct Preintegrator {
    pub bias: ImuBias,
    pub noise: ImuNoise,
    state: PreintegratedImu,
}

impl Preintegrator {
    pub fn new(bias: ImuBias, noise: ImuNoise, t_start: f64) -> Self {
        Self {
            bias,
            noise,
            state: PreintegratedImu::empty(bias, t_start),
        }
    }

    /// Integrate one step of length `dt` from raw averaged measurements; the
    /// current bias is removed here.
    pub fn integrate_step(&mut self, gyro_meas: &Vector3<f64>, accel_meas: &Vector3<f64>, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let omega = gyro_meas - self.bias.gyro;
        let acc = accel_meas - self.bias.accel;
        let s = &mut self.state;

        let d_r = s.delta_rot.to_rotation_matrix().into_inner();
        let acc_skew = skew(&acc);
        let step_rot = exp_so3(&(omega * dt));
        let step_rot_t = step_rot.inverse().to_rotation_matrix().into_inner();
        let jr_step = right_jacobian(&(omega * dt));
        let dt2 = dt * dt;

        // Covariance propagation, state order [θ, v, p].
        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&step_rot_t);
        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-d_r * acc_skew * dt));
        a.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * d_r * acc_skew * dt2));
        a.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));

        let mut b = Matrix9x6::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr_step * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(d_r * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * d_r * dt2));

        let gyro_var = self.noise.gyro_noise_density.powi(2) / dt;
        let accel_var = self.noise.accel_noise_density.powi(2) / dt;
        let mut q = Matrix6::zeros();
        for i in 0..3 {
            q[(i, i)] = gyro_var;
            q[(i + 3, i + 3)] = accel_var;
        }
        s.covariance = a * s.covariance * a.transpose() + b * q * b.transpose();

        // Bias Jacobians; position terms use the pre-update velocity terms.
        s.d_pos_d_ba += s.d_vel_d_ba * dt - 0.5 * d_r * dt2;
        s.d_pos_d_bg += s.d_vel_d_bg * dt - 0.5 * d_r * acc_skew * s.d_rot_d_bg * dt2;
        s.d_vel_d_ba -= d_r * dt;
        s.d_vel_d_bg -= d_r * acc_skew * s.d_rot_d_bg * dt;
        s.d_rot_d_bg = step_rot_t * s.d_rot_d_bg - jr_step * dt;

        // Mean propagation.
        let acc_rotated = d_r * acc;
        s.delta_pos += s.delta_vel * dt + 0.5 * acc_rotated * dt2;
        s.delta_vel += acc_rotated * dt;
        s.delta_rot = UnitQuaternion::new_normalize((s.delta_rot * step_rot).into_inner());
        s.dt += dt;
        s.t_end += dt;
    }

    /// Midpoint step between two consecutive samples.
    pub fn integrate(&mut self, prev: &ImuSample, curr: &ImuSample) {
        let dt = curr.timestamp_s - prev.timestamp_s;
        let gyro = 0.5 * (prev.gyro + curr.gyro);
        let accel = 0.5 * (prev.accel + curr.accel);
        self.integrate_step(&gyro, &accel, dt);
    }

    pub fn finish(self) -> PreintegratedImu {
        self.state
    }
}

/// Preintegrates `samples` over `[t_start, t_end]`.
///
/// Samples must be strictly increasing and bracket the interval to within
/// `max_gap`; interval ends that fall between samples are interpolated,
/// ends slightly outside the covered span hold the nearest measurement.
pub fn integrate_batch(
    samples: &[ImuSample],
    t_start: f64,
    t_end: f64,
    bias: ImuBias,
    noise: &ImuNoise,
    max_gap: f64,
) -> Result<PreintegratedImu, ImuError> {
    check_coverage(samples, t_start, t_end, max_gap)?;

    let mut integrator = Preintegrator::new(bias, *noise, t_start);
    let clamped = |t: f64| -> ImuSample {
        let idx = samples.partition_point(|s| s.timestamp_s <= t);
        if idx == 0 {
            ImuSample { timestamp_s: t, ..samples[0] }
        } else if idx >= samples.len() {
            ImuSample { timestamp_s: t, ..samples[samples.len() - 1] }
        } else {
            ImuSample::interpolate(&samples[idx - 1], &samples[idx], t)
        }
    };

    // Knot points: interval ends plus every sample strictly inside.
    let mut knots = Vec::with_capacity(samples.len() + 2);
    knots.push(clamped(t_start));
    knots.extend(
        samples
            .iter()
            .filter(|s| s.timestamp_s > t_start && s.timestamp_s < t_end)
            .copied(),
    );
    knots.push(clamped(t_end));

    for pair in knots.windows(2) {
        integrator.integrate(&pair[0], &pair[1]);
    }

    let first = samples.partition_point(|s| s.timestamp_s <= t_start).saturating_sub(1);
    let last = samples.partition_point(|s| s.timestamp_s < t_end).min(samples.len() - 1);
    let mut state = integrator.finish();
    state.t_start = t_start;
    state.t_end = t_end;
    state.samples = samples[first..=last].to_vec();
    Ok(state)
}
