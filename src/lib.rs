pub mod frame;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod local_mapping;
pub mod optimizer;
pub mod simulation;
pub mod system;
pub mod tracking;
pub mod window;
