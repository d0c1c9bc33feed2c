//! Inertial measurement handling: samples, batch validation and
//! preintegration.

pub mod batch;
pub mod preintegration;
pub mod sample;
pub mod state;
pub mod types;

pub use batch::{BatchStatus, EffectiveBatch, ImuBatchBuffer, ImuError};
pub use preintegration::{integrate_batch, PreintegratedImu, Preintegrator};
pub use sample::{ImuBias, ImuNoise, ImuSample, GRAVITY, GRAVITY_MAGNITUDE};
pub use state::ImuInitState;
