//! Geometry utilities: rigid and similarity transforms, SO(3) helpers.

pub mod se3;
pub mod sim3;
pub mod so3;

pub use se3::SE3;
pub use sim3::Sim3;
pub use so3::{exp_so3, log_so3, right_jacobian, right_jacobian_inv, rotation_between, skew};
