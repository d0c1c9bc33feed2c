//! Mapping thread: window maintenance, optimization and the delayed
//! scale/gravity initializer.

pub mod imu_init;
pub mod local_mapper;

pub use imu_init::{DelayedInitializer, InitializerSettings, InitializerStatus, ScaleState};
pub use local_mapper::{LocalMapper, MappingOutcome};
