use nalgebra::Vector3;
use serde::Deserialize;

/// Gravity magnitude (m/s²).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Gravity vector in the metric, gravity-aligned world (m/s²).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE);

/// Continuous-time IMU noise model.
///
/// Densities are per √Hz; the discrete covariance of one integration step
/// of length `dt` is `density² / dt`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    pub gyro_noise_density: f64,
    pub accel_noise_density: f64,
    pub gyro_random_walk: f64,
    pub accel_random_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // EuRoC-style ADIS16448 values
        Self {
            gyro_noise_density: 1.7e-4,
            accel_noise_density: 2.0e-3,
            gyro_random_walk: 1.9393e-5,
            accel_random_walk: 3.0e-3,
        }
    }
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }

    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { gyro, accel }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Single IMU measurement in the body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { timestamp_s, accel, gyro }
    }

    /// Linear interpolation between two samples at time `t`.
    pub fn interpolate(a: &ImuSample, b: &ImuSample, t: f64) -> ImuSample {
        let span = b.timestamp_s - a.timestamp_s;
        if span <= 0.0 {
            return ImuSample { timestamp_s: t, ..*a };
        }
        let alpha = ((t - a.timestamp_s) / span).clamp(0.0, 1.0);
        ImuSample {
            timestamp_s: t,
            accel: a.accel + (b.accel - a.accel) * alpha,
            gyro: a.gyro + (b.gyro - a.gyro) * alpha,
        }
    }
}
