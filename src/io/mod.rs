//! File output.

pub mod trajectory_writer;

pub use trajectory_writer::{load_tum_trajectory, TrajectoryKind, TrajectoryWriter, TumEntry};
