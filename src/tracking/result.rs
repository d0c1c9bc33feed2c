//! Per-frame tracking results and diagnostics.

use thiserror::Error;

use crate::geometry::SE3;
use crate::window::{AffineLight, FrameId};

use super::TrackingState;

/// Why the coarse tracker rejected a frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingFailure {
    /// Too few reference points reprojected with an acceptable residual.
    #[error("only {valid_fraction:.2} of the reference points stayed valid")]
    LostCandidate { valid_fraction: f64 },
    /// The photometric error blew up or became non-finite.
    #[error("photometric error diverged (rmse {rmse:.2})")]
    Diverged { rmse: f64 },
    /// No keyframe snapshot to track against.
    #[error("no tracking reference available")]
    NoReference,
}

/// Image-motion indicators used by the keyframe policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowIndicators {
    /// RMS pixel shift caused by translation alone.
    pub flow_t: f64,
    /// RMS pixel shift caused by the full relative motion.
    pub flow_rt: f64,
    /// `|ln a|` of the brightness transfer from the reference.
    pub brightness: f64,
    /// Fraction of reference points that reprojected with an inlier residual.
    pub valid_fraction: f64,
}

/// Output of a successful alignment.
#[derive(Debug, Clone)]
pub struct CoarseEstimate {
    /// `T_wc` of the new frame.
    pub pose: SE3,
    pub affine: AffineLight,
    pub rmse: f64,
    pub indicators: FlowIndicators,
    /// Index of the motion hypothesis that won.
    pub hypothesis: usize,
}

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: FrameId,
    pub state: TrackingState,
    pub pose: Option<SE3>,
    pub reference_kf: Option<FrameId>,
    pub metrics: TrackingMetrics,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub rmse: f64,
    pub valid_fraction: f64,
    pub flow_t: f64,
    pub flow_rt: f64,
    pub hypotheses_tried: usize,
    pub total_ms: f64,
}
