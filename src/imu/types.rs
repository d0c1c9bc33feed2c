//! Fixed-size matrix aliases for preintegration.
//!
//! The preintegrated delta lives in `[δθ, δv, δp]` (9 dims); its noise input
//! is `[gyro, accel]` (6 dims).

use nalgebra::SMatrix;

pub type Matrix9 = SMatrix<f64, 9, 9>;
pub type Matrix9x6 = SMatrix<f64, 9, 6>;
pub type Matrix6 = SMatrix<f64, 6, 6>;
