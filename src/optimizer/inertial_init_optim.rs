//! Scale, gravity and bias estimation from an up-to-scale visual trajectory
//! and the inertial deltas between its keyframes.
//!
//! Two stages:
//! 1. `initial_alignment` solves a linear least-squares problem for
//!    velocities, gravity and scale with zero accelerometer bias, after a
//!    closed-form gyro bias estimate.
//! 2. `optimize_inertial_init` refines everything jointly with
//!    Levenberg-Marquardt on the preintegration residuals.
//!
//! # State Vector
//!
//! - log scale: 1
//! - gravity direction: 2 (rotation of `R_wg` about its own x and y axes)
//! - gyro bias: 3, accel bias: 3 (shared by all keyframes)
//! - velocities: 3 per keyframe, metric, in the visual world orientation
//!
//! Total: 9 + 3n parameters.

use nalgebra::{DMatrix, DVector, SMatrix, UnitQuaternion, Vector3};
use tracing::debug;

use crate::geometry::{exp_so3, log_so3, rotation_between, SE3};
use crate::imu::{ImuBias, PreintegratedImu, GRAVITY_MAGNITUDE};
use crate::window::FrameId;

use super::imu_factors::whitening_of;

/// Configuration for inertial initialization optimization.
#[derive(Clone, Debug)]
pub struct InertialInitConfig {
    /// Maximum number of Levenberg-Marquardt iterations.
    pub max_iterations: usize,
    /// Initial LM damping factor.
    pub initial_lambda: f64,
    /// LM damping increase factor when cost increases.
    pub lambda_increase: f64,
    /// LM damping decrease factor when cost decreases.
    pub lambda_decrease: f64,
    pub min_lambda: f64,
    /// Maximum lambda (triggers early exit).
    pub max_lambda: f64,
    /// Convergence threshold for parameter change.
    pub convergence_threshold: f64,
    /// Prior weight for gyro bias (information matrix diagonal).
    pub prior_gyro: f64,
    /// Prior weight for accel bias (information matrix diagonal).
    pub prior_accel: f64,
}

impl Default for InertialInitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            initial_lambda: 1e-4,
            lambda_increase: 10.0,
            lambda_decrease: 0.1,
            min_lambda: 1e-12,
            max_lambda: 1e8,
            convergence_threshold: 1e-8,
            prior_gyro: 0.0,
            prior_accel: 0.0,
        }
    }
}

impl InertialInitConfig {
    /// Short history (t < 5s): strong bias priors.
    pub fn phase0() -> Self {
        Self {
            prior_gyro: 1e2,
            prior_accel: 1e5,
            ..Self::default()
        }
    }

    /// 5s <= t < 15s: the gyro bias is freed first.
    pub fn phase1() -> Self {
        Self {
            prior_gyro: 1.0,
            prior_accel: 1e5,
            ..Self::default()
        }
    }

    /// t >= 15s: no bias priors.
    pub fn phase2() -> Self {
        Self::default()
    }

    /// Select configuration based on the time spanned by the keyframes.
    pub fn for_time(time_span_seconds: f64) -> Self {
        if time_span_seconds < 5.0 {
            Self::phase0()
        } else if time_span_seconds < 15.0 {
            Self::phase1()
        } else {
            Self::phase2()
        }
    }
}

/// Current values of the initialization unknowns.
#[derive(Clone, Debug)]
pub struct InertialInitEstimate {
    pub log_scale: f64,
    /// Rotation from the gravity-aligned frame into the visual world:
    /// gravity in the visual world is `R_wg · (0, 0, -g)`.
    pub rwg: UnitQuaternion<f64>,
    pub bias: ImuBias,
    pub velocities: Vec<Vector3<f64>>,
}

impl InertialInitEstimate {
    pub fn scale(&self) -> f64 {
        self.log_scale.exp()
    }

    pub fn gravity_world(&self) -> Vector3<f64> {
        self.rwg * Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE)
    }

    fn retract(&self, dx: &DVector<f64>, layout: &StateLayout) -> Self {
        let g = layout.gravity_start();
        let bg = layout.gyro_bias_start();
        let ba = layout.accel_bias_start();
        Self {
            log_scale: self.log_scale + dx[layout.scale_index()],
            rwg: self.rwg * exp_so3(&Vector3::new(dx[g], dx[g + 1], 0.0)),
            bias: ImuBias::new(
                self.bias.gyro + dx.fixed_rows::<3>(bg),
                self.bias.accel + dx.fixed_rows::<3>(ba),
            ),
            velocities: self
                .velocities
                .iter()
                .enumerate()
                .map(|(i, v)| v + dx.fixed_rows::<3>(layout.vel_start(i)))
                .collect(),
        }
    }
}

/// Result of inertial initialization optimization.
#[derive(Clone, Debug)]
pub struct InertialInitOptimResult {
    pub estimate: InertialInitEstimate,
    /// Standard deviation of the log scale from the measurements and bias
    /// priors alone (the scale prior is excluded).
    pub scale_sigma: f64,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Problem data for one initialization attempt.
#[derive(Clone)]
pub struct InertialInitProblem {
    /// Keyframe IDs in temporal order.
    pub frame_ids: Vec<FrameId>,
    /// Up-to-scale visual poses (`T_wc`).
    pub poses: Vec<SE3>,
    /// `preints[i]` integrates from `frame_ids[i]` to `frame_ids[i + 1]`.
    pub preints: Vec<PreintegratedImu>,
    pub t_cam_imu: SE3,
    /// Optional Gaussian prior `(mean, sigma)` on the log scale.
    pub scale_prior: Option<(f64, f64)>,
}

impl InertialInitProblem {
    pub fn num_keyframes(&self) -> usize {
        self.poses.len()
    }

    fn body_rotation(&self, i: usize) -> UnitQuaternion<f64> {
        self.poses[i].rotation * self.t_cam_imu.rotation
    }

    /// Metric body position for a given scale.
    fn body_position(&self, i: usize, scale: f64) -> Vector3<f64> {
        scale * self.poses[i].translation + self.poses[i].rotation * self.t_cam_imu.translation
    }
}

/// State layout for the optimization problem.
struct StateLayout {
    num_keyframes: usize,
}

impl StateLayout {
    fn new(num_keyframes: usize) -> Self {
        Self { num_keyframes }
    }

    fn total_params(&self) -> usize {
        9 + self.num_keyframes * 3
    }

    fn scale_index(&self) -> usize {
        0
    }

    fn gravity_start(&self) -> usize {
        1
    }

    fn gyro_bias_start(&self) -> usize {
        3
    }

    fn accel_bias_start(&self) -> usize {
        6
    }

    fn vel_start(&self, kf_idx: usize) -> usize {
        9 + kf_idx * 3
    }
}

/// Closed-form gyro bias from the relative rotations of consecutive
/// keyframes, linearized around the preintegration bias.
pub fn estimate_gyro_bias(problem: &InertialInitProblem) -> Vector3<f64> {
    let mut h = nalgebra::Matrix3::<f64>::zeros();
    let mut b = Vector3::zeros();
    for (i, preint) in problem.preints.iter().enumerate() {
        let r_ij = problem.body_rotation(i).inverse() * problem.body_rotation(i + 1);
        let r = log_so3(&(preint.delta_rot.inverse() * r_ij));
        let j = preint.d_rot_d_bg;
        h += j.transpose() * j;
        b += j.transpose() * r;
    }
    let base = problem.preints.first().map_or(Vector3::zeros(), |p| p.bias_lin.gyro);
    match h.cholesky() {
        Some(chol) => base + chol.solve(&b),
        None => base,
    }
}

/// Linear alignment of the visual trajectory with the inertial deltas.
///
/// Unknowns `[v_0 .. v_{n-1}, g, s]`; per segment
///
/// ```text
/// v_j - v_i - g·dt                    = R_i Δv
/// s·(c_j - c_i) - v_i·dt - ½·g·dt²    = R_i Δp - (R_wcj - R_wci)·t_cb
/// ```
///
/// Returns `None` when the system is degenerate or the scale is not
/// positive.
pub fn initial_alignment(problem: &InertialInitProblem) -> Option<InertialInitEstimate> {
    let n = problem.num_keyframes();
    if n < 4 || problem.preints.len() + 1 != n {
        return None;
    }
    let gyro = estimate_gyro_bias(problem);
    let bias = ImuBias::new(gyro, Vector3::zeros());

    let dim = 3 * n + 4;
    let g_col = 3 * n;
    let s_col = 3 * n + 3;
    let mut a = DMatrix::<f64>::zeros(6 * (n - 1), dim);
    let mut rhs = DVector::<f64>::zeros(6 * (n - 1));
    let identity = nalgebra::Matrix3::<f64>::identity();
    for (k, preint) in problem.preints.iter().enumerate() {
        let (i, j) = (k, k + 1);
        let dt = preint.dt;
        let r_i = problem.body_rotation(i);
        let row = 6 * k;

        a.fixed_view_mut::<3, 3>(row, 3 * j).copy_from(&identity);
        a.fixed_view_mut::<3, 3>(row, 3 * i).copy_from(&(-identity));
        a.fixed_view_mut::<3, 3>(row, g_col).copy_from(&(-identity * dt));
        rhs.fixed_rows_mut::<3>(row).copy_from(&(r_i * preint.corrected_velocity(&bias)));

        let dc = problem.poses[j].translation - problem.poses[i].translation;
        a.fixed_view_mut::<3, 1>(row + 3, s_col).copy_from(&dc);
        a.fixed_view_mut::<3, 3>(row + 3, 3 * i).copy_from(&(-identity * dt));
        a.fixed_view_mut::<3, 3>(row + 3, g_col).copy_from(&(-identity * 0.5 * dt * dt));
        let lever = (problem.poses[j].rotation_matrix() - problem.poses[i].rotation_matrix()) * problem.t_cam_imu.translation;
        rhs.fixed_rows_mut::<3>(row + 3)
            .copy_from(&(r_i * preint.corrected_position(&bias) - lever));
    }

    let ata = a.transpose() * &a;
    let atb = a.transpose() * &rhs;
    let x = match ata.clone().cholesky() {
        Some(chol) => chol.solve(&atb),
        None => ata.lu().solve(&atb)?,
    };
    let scale = x[s_col];
    let gravity = Vector3::new(x[g_col], x[g_col + 1], x[g_col + 2]);
    if !(scale > 0.0 && scale.is_finite()) || gravity.norm() < 1e-6 {
        debug!("[ImuInit] linear alignment rejected: scale {:.4}, |g| {:.3}", scale, gravity.norm());
        return None;
    }
    let rwg = rotation_between(&Vector3::new(0.0, 0.0, -1.0), &gravity.normalize());
    debug!(
        "[ImuInit] linear alignment: scale {:.4}, |g| {:.3}, gyro bias {:.2e}",
        scale,
        gravity.norm(),
        gyro.norm()
    );
    Some(InertialInitEstimate {
        log_scale: scale.ln(),
        rwg,
        bias,
        velocities: (0..n).map(|i| Vector3::new(x[3 * i], x[3 * i + 1], x[3 * i + 2])).collect(),
    })
}

/// Full inertial initialization optimization.
///
/// Optimizes scale, gravity direction, biases and velocities jointly using
/// Levenberg-Marquardt, starting from `initial`.
pub fn optimize_inertial_init(
    problem: &InertialInitProblem,
    initial: InertialInitEstimate,
    config: &InertialInitConfig,
) -> InertialInitOptimResult {
    let layout = StateLayout::new(problem.num_keyframes());
    let num_params = layout.total_params();
    let whitening: Vec<SMatrix<f64, 9, 9>> = problem.preints.iter().map(whitening_of).collect();
    let bias_center = initial.bias;

    let mut x = initial;
    let initial_cost = compute_residuals(problem, &x, &whitening, &bias_center, config, true).norm_squared();
    let mut current_cost = initial_cost;
    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iter = 0;

    for i in 0..config.max_iterations {
        iter = i + 1;
        let residuals = compute_residuals(problem, &x, &whitening, &bias_center, config, true);
        let jacobian = compute_jacobian(problem, &x, &layout, &whitening, &bias_center, config, true);

        let jtj = jacobian.transpose() * &jacobian;
        let jtr = jacobian.transpose() * &residuals;

        let mut h_lm = jtj.clone();
        for j in 0..num_params {
            h_lm[(j, j)] += lambda * jtj[(j, j)].max(1e-10);
        }
        let dx = match h_lm.lu().solve(&(-&jtr)) {
            Some(d) => d,
            None => {
                lambda *= config.lambda_increase;
                continue;
            }
        };

        let x_new = x.retract(&dx, &layout);
        let new_cost = compute_residuals(problem, &x_new, &whitening, &bias_center, config, true).norm_squared();
        if new_cost.is_finite() && new_cost < current_cost {
            x = x_new;
            current_cost = new_cost;
            lambda = (lambda * config.lambda_decrease).max(config.min_lambda);
            if dx.norm() < config.convergence_threshold {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_increase;
            if lambda > config.max_lambda {
                break;
            }
        }
    }

    let scale_sigma = scale_sigma(problem, &x, &layout, &whitening, &bias_center, config);
    debug!(
        "[ImuInit] optimization: {} iters, cost {:.4} -> {:.4}, scale {:.4} ± {:.4}",
        iter,
        initial_cost,
        current_cost,
        x.scale(),
        scale_sigma
    );

    InertialInitOptimResult {
        estimate: x,
        scale_sigma,
        iterations: iter,
        initial_cost,
        final_cost: current_cost,
        converged,
    }
}

/// Marginal standard deviation of the log scale, without the scale prior.
fn scale_sigma(
    problem: &InertialInitProblem,
    x: &InertialInitEstimate,
    layout: &StateLayout,
    whitening: &[SMatrix<f64, 9, 9>],
    bias_center: &ImuBias,
    config: &InertialInitConfig,
) -> f64 {
    let jacobian = compute_jacobian(problem, x, layout, whitening, bias_center, config, false);
    let h = jacobian.transpose() * &jacobian;
    let Some(chol) = h.cholesky() else {
        return f64::INFINITY;
    };
    let mut e0 = DVector::zeros(layout.total_params());
    e0[layout.scale_index()] = 1.0;
    let variance = chol.solve(&e0)[layout.scale_index()];
    if variance.is_finite() && variance > 0.0 {
        variance.sqrt()
    } else {
        f64::INFINITY
    }
}

/// Whitened residuals: 9 per segment, 6 for the bias priors, plus one for
/// the scale prior when requested.
fn compute_residuals(
    problem: &InertialInitProblem,
    x: &InertialInitEstimate,
    whitening: &[SMatrix<f64, 9, 9>],
    bias_center: &ImuBias,
    config: &InertialInitConfig,
    with_scale_prior: bool,
) -> DVector<f64> {
    let segments = problem.preints.len();
    let prior_rows = if with_scale_prior && problem.scale_prior.is_some() { 1 } else { 0 };
    let mut r = DVector::zeros(9 * segments + 6 + prior_rows);
    let scale = x.scale();
    let gravity = x.gravity_world();

    for (k, preint) in problem.preints.iter().enumerate() {
        let (i, j) = (k, k + 1);
        let dt = preint.dt;
        let r_i = problem.body_rotation(i);
        let r_i_inv = r_i.inverse();
        let p_i = problem.body_position(i, scale);
        let p_j = problem.body_position(j, scale);
        let (v_i, v_j) = (x.velocities[i], x.velocities[j]);

        let r_rot = log_so3(&(preint.corrected_rotation(&x.bias).inverse() * r_i_inv * problem.body_rotation(j)));
        let r_vel = r_i_inv * (v_j - v_i - gravity * dt) - preint.corrected_velocity(&x.bias);
        let r_pos = r_i_inv * (p_j - p_i - v_i * dt - 0.5 * gravity * dt * dt) - preint.corrected_position(&x.bias);

        let mut motion = nalgebra::SVector::<f64, 9>::zeros();
        motion.fixed_rows_mut::<3>(0).copy_from(&r_rot);
        motion.fixed_rows_mut::<3>(3).copy_from(&r_vel);
        motion.fixed_rows_mut::<3>(6).copy_from(&r_pos);
        r.fixed_rows_mut::<9>(9 * k).copy_from(&(whitening[k] * motion));
    }

    let row = 9 * segments;
    r.fixed_rows_mut::<3>(row)
        .copy_from(&((x.bias.gyro - bias_center.gyro) * config.prior_gyro.sqrt()));
    r.fixed_rows_mut::<3>(row + 3)
        .copy_from(&((x.bias.accel - bias_center.accel) * config.prior_accel.sqrt()));
    if prior_rows == 1 {
        if let Some((mean, sigma)) = problem.scale_prior {
            r[row + 6] = (x.log_scale - mean) / sigma.max(1e-9);
        }
    }
    r
}

/// Central-difference Jacobian of `compute_residuals` on the tangent space.
fn compute_jacobian(
    problem: &InertialInitProblem,
    x: &InertialInitEstimate,
    layout: &StateLayout,
    whitening: &[SMatrix<f64, 9, 9>],
    bias_center: &ImuBias,
    config: &InertialInitConfig,
    with_scale_prior: bool,
) -> DMatrix<f64> {
    const EPS: f64 = 1e-6;
    let num_params = layout.total_params();
    let rows = compute_residuals(problem, x, whitening, bias_center, config, with_scale_prior).len();
    let mut jacobian = DMatrix::zeros(rows, num_params);
    let mut dx = DVector::zeros(num_params);
    for c in 0..num_params {
        dx[c] = EPS;
        let plus = compute_residuals(problem, &x.retract(&dx, layout), whitening, bias_center, config, with_scale_prior);
        dx[c] = -EPS;
        let minus = compute_residuals(problem, &x.retract(&dx, layout), whitening, bias_center, config, with_scale_prior);
        dx[c] = 0.0;
        jacobian.set_column(c, &((plus - minus) / (2.0 * EPS)));
    }
    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sim3;
    use crate::imu::{integrate_batch, ImuNoise};
    use crate::simulation::{CircularTrajectory, ImuSimulator, Trajectory};
    use approx::assert_relative_eq;

    /// Circle trajectory seen through an arbitrary up-to-scale visual world.
    fn circle_problem(true_scale: f64, keyframes: usize) -> (InertialInitProblem, Sim3) {
        let trajectory = CircularTrajectory::default();
        let mut imu = ImuSimulator::ideal(200.0);
        let metric_to_visual = Sim3::new(
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.7),
            Vector3::new(0.1, -0.4, 0.2),
            1.0 / true_scale,
        );
        let times: Vec<f64> = (0..keyframes).map(|k| 0.25 * k as f64).collect();
        let poses = times
            .iter()
            .map(|&t| metric_to_visual.transform_pose(&trajectory.pose(t)))
            .collect();
        let preints = times
            .windows(2)
            .map(|w| {
                let mut samples = vec![imu.sample(&trajectory, w[0])];
                samples.extend(imu.samples_between(&trajectory, w[0], w[1]));
                integrate_batch(&samples, w[0], w[1], ImuBias::zero(), &ImuNoise::default(), 0.05).unwrap()
            })
            .collect();
        let problem = InertialInitProblem {
            frame_ids: (0..keyframes as u64).map(FrameId).collect(),
            poses,
            preints,
            t_cam_imu: SE3::identity(),
            scale_prior: None,
        };
        (problem, metric_to_visual)
    }

    #[test]
    fn test_config_phases() {
        assert_eq!(InertialInitConfig::for_time(1.0).prior_accel, 1e5);
        assert_eq!(InertialInitConfig::for_time(10.0).prior_gyro, 1.0);
        assert_eq!(InertialInitConfig::for_time(20.0).prior_gyro, 0.0);
    }

    #[test]
    fn test_state_layout() {
        let layout = StateLayout::new(4);
        assert_eq!(layout.total_params(), 21);
        assert_eq!(layout.vel_start(0), 9);
        assert_eq!(layout.vel_start(3), 18);
    }

    #[test]
    fn linear_alignment_recovers_scale_and_gravity() {
        let (problem, metric_to_visual) = circle_problem(2.5, 10);
        let estimate = initial_alignment(&problem).unwrap();
        assert_relative_eq!(estimate.scale(), 2.5, max_relative = 0.05);
        let expected = metric_to_visual.rotation * Vector3::new(0.0, 0.0, -1.0);
        assert!(estimate.gravity_world().normalize().dot(&expected) > 0.999);
    }

    #[test]
    fn refinement_tightens_scale() {
        let (problem, metric_to_visual) = circle_problem(0.4, 12);
        let initial = initial_alignment(&problem).unwrap();
        let result = optimize_inertial_init(&problem, initial, &InertialInitConfig::phase0());
        assert!(result.final_cost <= result.initial_cost);
        assert_relative_eq!(result.estimate.scale(), 0.4, max_relative = 0.01);
        assert!(result.scale_sigma < 0.02);
        // Metric velocity of the first keyframe, rotated into the visual world.
        let v0 = metric_to_visual.rotation * CircularTrajectory::default().velocity(0.0);
        assert!((result.estimate.velocities[0] - v0).norm() < 0.02);
    }

    #[test]
    fn degenerate_problem_is_rejected() {
        let (mut problem, _) = circle_problem(1.0, 3);
        assert!(initial_alignment(&problem).is_none());
        problem.preints.clear();
        assert!(initial_alignment(&problem).is_none());
    }
}
