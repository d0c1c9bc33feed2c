//! Output boundary: collaborators registered with the system receive pose
//! and map point updates after every accepted window optimization.

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::geometry::SE3;
use crate::window::{FrameId, PointId, PointStatus};

/// One trajectory entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseUpdate {
    pub frame_id: FrameId,
    pub timestamp_s: f64,
    /// `T_wc`.
    pub pose: SE3,
    pub is_keyframe: bool,
    /// True once the world is metric and gravity aligned.
    pub scale_corrected: bool,
}

/// One active map point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPointUpdate {
    pub point_id: PointId,
    pub host: FrameId,
    pub position: Vector3<f64>,
    pub status: PointStatus,
}

/// Receiver of estimator output. Called from the mapping thread.
pub trait OutputSink: Send {
    fn publish_poses(&mut self, poses: &[PoseUpdate]);

    fn publish_points(&mut self, _points: &[MapPointUpdate]) {}

    /// The estimator restarted; earlier output belongs to another run.
    fn reset(&mut self) {}

    /// Deliver everything buffered so far.
    fn drain(&mut self) {}
}

/// Fan-out over every registered sink. Cloning shares the list.
#[derive(Clone, Default)]
pub struct OutputSinks {
    sinks: Arc<Mutex<Vec<Box<dyn OutputSink>>>>,
}

impl OutputSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Box<dyn OutputSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn publish_poses(&self, poses: &[PoseUpdate]) {
        if poses.is_empty() {
            return;
        }
        for sink in self.sinks.lock().iter_mut() {
            sink.publish_poses(poses);
        }
    }

    pub fn publish_points(&self, points: &[MapPointUpdate]) {
        for sink in self.sinks.lock().iter_mut() {
            sink.publish_points(points);
        }
    }

    pub fn reset(&self) {
        for sink in self.sinks.lock().iter_mut() {
            sink.reset();
        }
    }

    pub fn drain(&self) {
        for sink in self.sinks.lock().iter_mut() {
            sink.drain();
        }
    }
}

/// Sink that keeps the latest pose of every frame in memory. Clones share
/// the same storage, so one clone can be registered and another inspected.
#[derive(Clone, Default)]
pub struct TrajectoryRecorder {
    inner: Arc<Mutex<RecorderState>>,
}

#[derive(Default)]
struct RecorderState {
    poses: Vec<PoseUpdate>,
    points: usize,
    resets: usize,
    drains: usize,
}

impl TrajectoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest pose per frame, ordered by frame id.
    pub fn poses(&self) -> Vec<PoseUpdate> {
        self.inner.lock().poses.clone()
    }

    pub fn keyframe_poses(&self) -> Vec<PoseUpdate> {
        self.inner.lock().poses.iter().filter(|p| p.is_keyframe).copied().collect()
    }

    /// Size of the latest published point set.
    pub fn point_count(&self) -> usize {
        self.inner.lock().points
    }

    pub fn resets(&self) -> usize {
        self.inner.lock().resets
    }

    pub fn drains(&self) -> usize {
        self.inner.lock().drains
    }
}

impl OutputSink for TrajectoryRecorder {
    fn publish_poses(&mut self, poses: &[PoseUpdate]) {
        let mut state = self.inner.lock();
        for update in poses {
            match state.poses.binary_search_by(|p| p.frame_id.cmp(&update.frame_id)) {
                Ok(i) => {
                    // A keyframe stays a keyframe once published as one.
                    let was_keyframe = state.poses[i].is_keyframe;
                    state.poses[i] = PoseUpdate { is_keyframe: was_keyframe || update.is_keyframe, ..*update };
                }
                Err(i) => state.poses.insert(i, *update),
            }
        }
    }

    fn publish_points(&mut self, points: &[MapPointUpdate]) {
        self.inner.lock().points = points.len();
    }

    fn reset(&mut self) {
        let mut state = self.inner.lock();
        state.poses.clear();
        state.points = 0;
        state.resets += 1;
    }

    fn drain(&mut self) {
        self.inner.lock().drains += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: u64, x: f64, is_keyframe: bool) -> PoseUpdate {
        PoseUpdate {
            frame_id: FrameId(id),
            timestamp_s: id as f64 * 0.05,
            pose: SE3::from_translation(Vector3::new(x, 0.0, 0.0)),
            is_keyframe,
            scale_corrected: false,
        }
    }

    #[test]
    fn recorder_keeps_latest_pose_per_frame() {
        let recorder = TrajectoryRecorder::new();
        let sinks = OutputSinks::new();
        sinks.register(Box::new(recorder.clone()));

        sinks.publish_poses(&[update(2, 0.0, true), update(0, 0.0, true)]);
        sinks.publish_poses(&[update(1, 0.5, false), update(2, 1.0, false)]);
        let poses = recorder.poses();
        let ids: Vec<u64> = poses.iter().map(|p| p.frame_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(poses[2].pose.translation.x, 1.0);
        assert!(poses[2].is_keyframe);
        assert_eq!(recorder.keyframe_poses().len(), 2);
    }

    #[test]
    fn reset_and_drain_reach_every_sink() {
        let a = TrajectoryRecorder::new();
        let b = TrajectoryRecorder::new();
        let sinks = OutputSinks::new();
        sinks.register(Box::new(a.clone()));
        sinks.register(Box::new(b.clone()));
        sinks.publish_poses(&[update(0, 0.0, true)]);
        sinks.reset();
        sinks.drain();
        for r in [&a, &b] {
            assert!(r.poses().is_empty());
            assert_eq!(r.resets(), 1);
            assert_eq!(r.drains(), 1);
        }
    }
}
