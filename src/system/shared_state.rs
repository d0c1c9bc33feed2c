//! State shared between the tracking front-end and the mapping thread.
//!
//! The mapping thread owns the window; everything the tracker may read is
//! published here as immutable snapshots or small value objects behind
//! `parking_lot` locks. Status signals are plain atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::geometry::Sim3;
use crate::imu::{ImuInitState, ImuSample};
use crate::tracking::coarse_tracker::TrackingReference;
use crate::window::FrameId;

/// Definition of the world frame poses are expressed in. The epoch is
/// bumped when the scale/gravity estimate is committed; `from_previous`
/// maps the previous world into the current one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldAlignment {
    pub epoch: u64,
    pub from_previous: Sim3,
    pub scale_corrected: bool,
}

impl Default for WorldAlignment {
    fn default() -> Self {
        Self {
            epoch: 0,
            from_previous: Sim3::identity(),
            scale_corrected: false,
        }
    }
}

/// Shared state accessible by both the tracker and the mapping thread.
pub struct SharedState {
    /// Latest keyframe snapshot. Written by mapping, read by tracking.
    tracking_reference: RwLock<Option<Arc<TrackingReference>>>,

    world: RwLock<WorldAlignment>,

    imu_init_state: RwLock<ImuInitState>,

    /// Inertial samples of frames dropped by the backlog policy, tagged by
    /// the id of the dropped frame.
    imu_carry: Mutex<Vec<(FrameId, Vec<ImuSample>)>>,

    /// Terminal tracking loss.
    lost: AtomicBool,

    /// Scale initialization gave up; recoverable by a reset.
    init_failed: AtomicBool,

    /// Request the mapping thread to finish and exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(imu_enabled: bool) -> Arc<Self> {
        let state = Self::default();
        if !imu_enabled {
            *state.imu_init_state.write() = ImuInitState::Disabled;
        }
        Arc::new(state)
    }

    pub fn tracking_reference(&self) -> Option<Arc<TrackingReference>> {
        self.tracking_reference.read().clone()
    }

    pub fn set_tracking_reference(&self, reference: Arc<TrackingReference>) {
        *self.tracking_reference.write() = Some(reference);
    }

    pub fn world(&self) -> WorldAlignment {
        *self.world.read()
    }

    /// Publishes a new world definition, returning its epoch.
    pub fn commit_world(&self, from_previous: Sim3) -> u64 {
        let mut world = self.world.write();
        world.epoch += 1;
        world.from_previous = from_previous;
        world.scale_corrected = true;
        world.epoch
    }

    pub fn imu_init_state(&self) -> ImuInitState {
        *self.imu_init_state.read()
    }

    pub fn set_imu_init_state(&self, state: ImuInitState) {
        *self.imu_init_state.write() = state;
    }

    pub fn push_imu_carry(&self, frame: FrameId, samples: Vec<ImuSample>) {
        if !samples.is_empty() {
            self.imu_carry.lock().push((frame, samples));
        }
    }

    /// Removes and returns the carried samples of frames before `frame`.
    pub fn take_imu_carry_before(&self, frame: FrameId) -> Vec<ImuSample> {
        let mut carry = self.imu_carry.lock();
        let mut out = Vec::new();
        carry.retain(|(id, samples)| {
            if *id < frame {
                out.extend_from_slice(samples);
                false
            } else {
                true
            }
        });
        out
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn set_lost(&self, value: bool) {
        self.lost.store(value, Ordering::SeqCst);
    }

    pub fn init_failed(&self) -> bool {
        self.init_failed.load(Ordering::SeqCst)
    }

    pub fn set_init_failed(&self, value: bool) {
        self.init_failed.store(value, Ordering::SeqCst);
    }

    /// Request shutdown of the mapping thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            tracking_reference: RwLock::new(None),
            world: RwLock::new(WorldAlignment::default()),
            imu_init_state: RwLock::new(ImuInitState::default()),
            imu_carry: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}
