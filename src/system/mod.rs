//! System orchestration and thread management.
//!
//! This module contains the top-level `VioSystem` that runs tracking on
//! the caller's thread and coordinates the mapping thread, along with
//! settings, shared state, inter-thread messages and the output boundary.

pub mod messages;
pub mod output;
pub mod settings;
pub mod shared_state;
mod vio_system;

pub use messages::{InitialMap, MappingCommand, TrackedFrame};
pub use output::{MapPointUpdate, OutputSink, OutputSinks, PoseUpdate, TrajectoryRecorder};
pub use settings::{ImuSettings, PipelineSettings, VioSettings, WindowSettings};
pub use shared_state::{SharedState, WorldAlignment};
pub use vio_system::VioSystem;
