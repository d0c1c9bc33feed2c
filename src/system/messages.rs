//! Inter-thread message types.
//!
//! Sent from the tracking front-end to the mapping thread over a bounded
//! FIFO channel, in strictly increasing frame-id order.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::frame::ImagePyramid;
use crate::geometry::SE3;
use crate::imu::ImuSample;
use crate::tracking::bootstrap::BootstrapResult;
use crate::tracking::result::FlowIndicators;
use crate::window::{AffineLight, FrameId};

/// A frame tracked against the latest keyframe.
///
/// Contains all the data the mapping thread needs to:
/// 1. refine immature points by epipolar search,
/// 2. decide whether the frame becomes a keyframe,
/// 3. extend keyframe-to-keyframe preintegration.
#[derive(Debug, Clone)]
pub struct TrackedFrame {
    pub id: FrameId,
    pub timestamp_s: f64,
    pub pyramid: Arc<ImagePyramid>,

    /// Pose estimate from tracking (`T_wc`).
    pub pose: SE3,
    pub affine: AffineLight,
    pub indicators: FlowIndicators,

    /// Inertial samples since the previous forwarded frame, sorted.
    pub imu_samples: Vec<ImuSample>,

    /// False when this frame's own batch was malformed or missing.
    pub imu_valid: bool,

    /// World epoch the pose is expressed in.
    pub world_epoch: u64,

    /// Diagnostic only; never used in estimation.
    pub ground_truth: Option<SE3>,
}

/// The two keyframes produced by the monocular bootstrap.
#[derive(Debug, Clone)]
pub struct InitialMap {
    pub bootstrap: BootstrapResult,
    /// The frame that completed the bootstrap, carrying the samples since
    /// the first frame.
    pub second: TrackedFrame,
}

pub enum MappingCommand {
    Frame(Box<TrackedFrame>),
    InitialMap(Box<InitialMap>),
    /// Acknowledged once every earlier message has been handled and the
    /// sinks have been drained.
    Drain(Sender<()>),
    Shutdown,
}

impl MappingCommand {
    pub fn frame_id(&self) -> Option<FrameId> {
        match self {
            MappingCommand::Frame(f) => Some(f.id),
            MappingCommand::InitialMap(m) => Some(m.second.id),
            MappingCommand::Drain(_) | MappingCommand::Shutdown => None,
        }
    }
}
