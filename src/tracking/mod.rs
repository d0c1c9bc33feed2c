//! Tracking front-end: bootstrap, direct frame-to-keyframe alignment and the
//! keyframe decision.

pub mod bootstrap;
pub mod coarse_tracker;
pub mod keyframe_decision;
pub mod motion_model;
pub mod result;
pub mod state;
pub mod tracker;

pub use bootstrap::{BootstrapResult, BootstrapSettings, BootstrapStatus, VisualBootstrap};
pub use coarse_tracker::{CoarseTracker, TrackerSettings, TrackingReference};
pub use keyframe_decision::KeyFrameDecision;
pub use motion_model::MotionModel;
pub use result::{CoarseEstimate, FlowIndicators, TrackingFailure, TrackingMetrics, TrackingResult};
pub use state::TrackingState;
pub use tracker::{Tracker, TrackerOutput};
