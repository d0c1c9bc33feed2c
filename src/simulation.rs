//! Synthetic data: a textured box room rendered through a pinhole camera,
//! analytic camera trajectories, and IMU measurements derived from them.

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::frame::{CameraModel, ImageAndExposure};
use crate::geometry::SE3;
use crate::imu::{ImuNoise, ImuSample, GRAVITY};

/// Axis-aligned room seen from the inside.
#[derive(Debug, Clone, Copy)]
pub struct BoxRoom {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Default for BoxRoom {
    fn default() -> Self {
        Self {
            min: Vector3::new(-2.0, -2.0, -2.0),
            max: Vector3::new(2.0, 2.0, 4.0),
        }
    }
}

impl BoxRoom {
    /// Wall texture: a sum of plane waves, smooth at the scale of a pixel.
    pub fn texture(&self, p: &Vector3<f64>) -> f32 {
        let v = 128.0
            + 30.0 * (3.1 * p.x + 1.3 * p.y).sin()
            + 30.0 * (2.3 * p.y - 1.7 * p.z).sin()
            + 25.0 * (2.9 * p.z + 0.9 * p.x).sin()
            + 15.0 * (7.3 * p.x + 5.1 * p.y + 3.7 * p.z).sin();
        v.clamp(0.0, 255.0) as f32
    }

    /// Distance along `dir` from an interior `origin` to the first wall.
    pub fn intersect(&self, origin: &Vector3<f64>, dir: &Vector3<f64>) -> Option<f64> {
        let mut t_hit = f64::INFINITY;
        for axis in 0..3 {
            let d = dir[axis];
            if d.abs() < 1e-12 {
                continue;
            }
            let wall = if d > 0.0 { self.max[axis] } else { self.min[axis] };
            let t = (wall - origin[axis]) / d;
            if t > 0.0 {
                t_hit = t_hit.min(t);
            }
        }
        t_hit.is_finite().then_some(t_hit)
    }

    /// Renders the room from camera pose `pose_wc`.
    pub fn render(&self, camera: &CameraModel, pose_wc: &SE3, timestamp_s: f64) -> ImageAndExposure {
        let r = pose_wc.rotation_matrix();
        let mut data = Vec::with_capacity(camera.width * camera.height);
        for v in 0..camera.height {
            for u in 0..camera.width {
                let dir = r * camera.unproject(u as f64, v as f64);
                let value = self
                    .intersect(&pose_wc.translation, &dir)
                    .map(|t| self.texture(&(pose_wc.translation + dir * t)))
                    .unwrap_or(0.0);
                data.push(value);
            }
        }
        ImageAndExposure {
            width: camera.width,
            height: camera.height,
            intensities: data,
            timestamp_s,
            exposure_time: 1.0,
        }
    }

    /// Ground-truth depth (camera z) of pixel `(u, v)`.
    pub fn depth(&self, camera: &CameraModel, pose_wc: &SE3, u: f64, v: f64) -> Option<f64> {
        let dir = pose_wc.rotation_matrix() * camera.unproject(u, v);
        self.intersect(&pose_wc.translation, &dir)
    }
}

/// Continuous camera trajectory; poses are `T_wc`.
pub trait Trajectory: Send + Sync {
    fn pose(&self, t: f64) -> SE3;
    fn velocity(&self, t: f64) -> Vector3<f64>;
    fn acceleration(&self, t: f64) -> Vector3<f64>;
    /// Angular velocity expressed in the world frame.
    fn angular_velocity(&self, t: f64) -> Vector3<f64>;
}

/// Camera that never moves.
#[derive(Debug, Clone, Copy)]
pub struct StaticTrajectory {
    pub pose: SE3,
}

impl Trajectory for StaticTrajectory {
    fn pose(&self, _t: f64) -> SE3 {
        self.pose
    }
    fn velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn acceleration(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn angular_velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Horizontal circle with a gently oscillating yaw:
/// `p(t) = (r cos ωt, r sin ωt, h)`, `R(t) = Rz(A sin ωt) · R₀`.
#[derive(Debug, Clone, Copy)]
pub struct CircularTrajectory {
    pub radius: f64,
    pub omega: f64,
    pub height: f64,
    pub yaw_amplitude: f64,
    pub base_rotation: UnitQuaternion<f64>,
}

impl Default for CircularTrajectory {
    fn default() -> Self {
        Self {
            radius: 0.5,
            omega: 1.0,
            height: 0.0,
            yaw_amplitude: 0.1,
            // Looking towards the far wall (+z), slightly tilted.
            base_rotation: UnitQuaternion::from_euler_angles(0.05, -0.05, 0.0),
        }
    }
}

impl Trajectory for CircularTrajectory {
    fn pose(&self, t: f64) -> SE3 {
        let yaw = self.yaw_amplitude * (self.omega * t).sin();
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw) * self.base_rotation;
        let (s, c) = (self.omega * t).sin_cos();
        SE3::new(rotation, Vector3::new(self.radius * c, self.radius * s, self.height))
    }

    fn velocity(&self, t: f64) -> Vector3<f64> {
        let (s, c) = (self.omega * t).sin_cos();
        Vector3::new(-self.radius * self.omega * s, self.radius * self.omega * c, 0.0)
    }

    fn acceleration(&self, t: f64) -> Vector3<f64> {
        let (s, c) = (self.omega * t).sin_cos();
        let w2 = self.omega * self.omega;
        Vector3::new(-self.radius * w2 * c, -self.radius * w2 * s, 0.0)
    }

    fn angular_velocity(&self, t: f64) -> Vector3<f64> {
        let yaw_rate = self.yaw_amplitude * self.omega * (self.omega * t).cos();
        Vector3::new(0.0, 0.0, yaw_rate)
    }
}

/// Generates IMU samples from a trajectory; the IMU frame coincides with
/// the camera frame.
pub struct ImuSimulator {
    pub rate_hz: f64,
    noise: Option<(ImuNoise, StdRng)>,
}

impl ImuSimulator {
    /// Noise-free measurements.
    pub fn ideal(rate_hz: f64) -> Self {
        Self { rate_hz, noise: None }
    }

    /// White measurement noise drawn from `noise` with a fixed seed.
    pub fn noisy(rate_hz: f64, noise: ImuNoise, seed: u64) -> Self {
        Self { rate_hz, noise: Some((noise, StdRng::seed_from_u64(seed))) }
    }

    pub fn sample(&mut self, trajectory: &dyn Trajectory, t: f64) -> ImuSample {
        let pose = trajectory.pose(t);
        let r_bw = pose.rotation.inverse();
        let mut gyro = r_bw * trajectory.angular_velocity(t);
        let mut accel = r_bw * (trajectory.acceleration(t) - GRAVITY);
        if let Some((noise, rng)) = self.noise.as_mut() {
            let sqrt_rate = self.rate_hz.sqrt();
            let g = Normal::new(0.0, noise.gyro_noise_density * sqrt_rate).ok();
            let a = Normal::new(0.0, noise.accel_noise_density * sqrt_rate).ok();
            if let (Some(g), Some(a)) = (g, a) {
                gyro += Vector3::new(g.sample(rng), g.sample(rng), g.sample(rng));
                accel += Vector3::new(a.sample(rng), a.sample(rng), a.sample(rng));
            }
        }
        ImuSample::new(t, accel, gyro)
    }

    /// Samples on the global rate grid within `(t0, t1]`.
    pub fn samples_between(&mut self, trajectory: &dyn Trajectory, t0: f64, t1: f64) -> Vec<ImuSample> {
        let first = (t0 * self.rate_hz).floor() as i64 + 1;
        let last = (t1 * self.rate_hz + 1e-9).floor() as i64;
        (first..=last)
            .map(|k| self.sample(trajectory, k as f64 / self.rate_hz))
            .collect()
    }
}

/// One synthetic input frame.
pub struct SyntheticFrame {
    pub id: u64,
    pub image: ImageAndExposure,
    /// Samples since the previous frame (`None` for the first frame).
    pub imu: Option<Vec<ImuSample>>,
    pub ground_truth: SE3,
}

/// Renders a sequence of frames and IMU batches along a trajectory.
pub struct SyntheticSequence {
    pub room: BoxRoom,
    pub camera: CameraModel,
    pub frame_rate: f64,
    trajectory: Box<dyn Trajectory>,
    imu: ImuSimulator,
}

impl SyntheticSequence {
    pub fn new(camera: CameraModel, frame_rate: f64, trajectory: Box<dyn Trajectory>, imu: ImuSimulator) -> Self {
        Self { room: BoxRoom::default(), camera, frame_rate, trajectory, imu }
    }

    /// The camera used by the tests and the demo binary.
    pub fn default_camera() -> CameraModel {
        CameraModel::new(120.0, 120.0, 80.0, 60.0, 160, 120)
    }

    pub fn trajectory(&self) -> &dyn Trajectory {
        self.trajectory.as_ref()
    }

    pub fn timestamp(&self, index: u64) -> f64 {
        index as f64 / self.frame_rate
    }

    pub fn frame(&mut self, index: u64) -> SyntheticFrame {
        let t = self.timestamp(index);
        let pose = self.trajectory.pose(t);
        let image = self.room.render(&self.camera, &pose, t);
        let imu = if index > 0 {
            let t_prev = self.timestamp(index - 1);
            // Include the sample at the previous frame time so the batch
            // brackets the whole interval.
            let mut batch = vec![self.imu.sample(self.trajectory.as_ref(), t_prev)];
            batch.extend(self.imu.samples_between(self.trajectory.as_ref(), t_prev, t));
            batch.dedup_by(|b, a| (b.timestamp_s - a.timestamp_s).abs() < 1e-9);
            Some(batch)
        } else {
            None
        };
        SyntheticFrame { id: index, image, imu, ground_truth: pose }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{integrate_batch, ImuBias};
    use approx::assert_relative_eq;

    #[test]
    fn rendered_room_has_texture_everywhere() {
        let cam = SyntheticSequence::default_camera();
        let room = BoxRoom::default();
        let img = room.render(&cam, &CircularTrajectory::default().pose(0.0), 0.0);
        assert!(img.intensities.iter().all(|v| *v > 0.0 && *v < 255.0));
        let mean = img.intensities.iter().sum::<f32>() / img.intensities.len() as f32;
        let var = img.intensities.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / img.intensities.len() as f32;
        assert!(var.sqrt() > 10.0);
    }

    #[test]
    fn depth_matches_far_wall_for_forward_camera() {
        let cam = SyntheticSequence::default_camera();
        let room = BoxRoom::default();
        let depth = room.depth(&cam, &SE3::identity(), cam.cx, cam.cy).unwrap();
        assert_relative_eq!(depth, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn simulated_imu_preintegrates_to_trajectory_motion() {
        let traj = CircularTrajectory::default();
        let mut imu = ImuSimulator::ideal(400.0);
        let mut samples = vec![imu.sample(&traj, 0.0)];
        samples.extend(imu.samples_between(&traj, 0.0, 0.5));
        let pre = integrate_batch(&samples, 0.0, 0.5, ImuBias::zero(), &ImuNoise::default(), 0.01).unwrap();

        let (p0, p1) = (traj.pose(0.0), traj.pose(0.5));
        let v0 = traj.velocity(0.0);
        let dt = 0.5;
        let expected_dp = p0.rotation.inverse() * (p1.translation - p0.translation - v0 * dt - 0.5 * GRAVITY * dt * dt);
        let expected_dr = p0.rotation.inverse() * p1.rotation;
        assert_relative_eq!(pre.delta_pos, expected_dp, epsilon = 2e-3);
        assert!((pre.delta_rot.inverse() * expected_dr).angle() < 1e-4);
    }
}
