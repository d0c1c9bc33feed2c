//! Nonlinear least squares over the active window.
//!
//! - Photometric residual linearization
//! - Windowed Gauss-Newton/LM with Schur elimination of point depths
//! - Inertial factors between consecutive keyframes
//! - Marginalization into a Gaussian prior
//! - Inertial initialization (scale, gravity, bias, velocities)

pub mod bundle;
pub mod imu_factors;
pub mod inertial_init_optim;
pub mod marginalization;
pub mod photometric;

pub use bundle::{BundleProblem, BundleReport, BundleSolver, SolverError, SolverSettings};
pub use imu_factors::{ImuFactor, ImuFactorContext};
pub use marginalization::{MarginalizationPrior, MarginalizationReport, Marginalizer};
