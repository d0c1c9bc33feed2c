//! Active window: keyframes, hosted points and their lifecycle.

pub mod activation;
pub mod immature;
pub mod keyframe;
pub mod point;
pub mod selection;
pub mod types;
#[allow(clippy::module_inception)]
pub mod window;

pub use activation::{ActivationParams, ActivationReport, PointActivator};
pub use immature::{trace_point, TraceOutcome, TraceSettings};
pub use keyframe::{AffineLight, FrameState, FrameVector, KeyFrame, FRAME_DIM, PHOTO_DIM};
pub use point::{Point, PointStatus, Residual, ResidualState, PATTERN, PATTERN_LEN};
pub use selection::{frames_to_flag, select_frame_to_drop, DropPolicy};
pub use types::{FrameId, PointId};
pub use window::ActiveWindow;
