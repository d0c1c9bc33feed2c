//! Tracking front-end: runs on the caller's thread, once per input frame.
//!
//! - builds the image pyramid and the frame's effective inertial batch
//! - bootstraps the first two keyframes from monocular motion
//! - aligns every later frame to the newest keyframe snapshot
//! - hands tracked frames to the mapping thread
//!
//! The tracker never touches the window. It only reads the immutable
//! [`TrackingReference`] and the world alignment from [`SharedState`].

use std::sync::Arc;
use std::time::Instant;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::frame::{CameraModel, ImageAndExposure, ImagePyramid, PixelSelector};
use crate::geometry::SE3;
use crate::imu::{integrate_batch, BatchStatus, ImuBatchBuffer, ImuSample, GRAVITY};
use crate::system::messages::{InitialMap, TrackedFrame};
use crate::system::settings::VioSettings;
use crate::system::shared_state::SharedState;
use crate::window::{AffineLight, FrameId};

use super::bootstrap::{BootstrapStatus, VisualBootstrap};
use super::coarse_tracker::{CoarseTracker, TrackingReference};
use super::motion_model::MotionModel;
use super::result::{FlowIndicators, TrackingFailure, TrackingMetrics, TrackingResult};
use super::TrackingState;

/// What the tracker hands to the mapping thread for one frame.
#[derive(Debug)]
pub enum TrackerOutput {
    /// Nothing to map (bootstrap in progress, failed or lost frame).
    Nothing,
    Frame(Box<TrackedFrame>),
    InitialMap(Box<InitialMap>),
}

/// Main tracking structure.
pub struct Tracker {
    settings: VioSettings,
    coarse: CoarseTracker,
    bootstrap: VisualBootstrap,
    motion: MotionModel,
    imu_buffer: ImuBatchBuffer,

    /// Shared snapshot, world alignment and flags.
    shared: Arc<SharedState>,

    /// Keyframe snapshot currently tracked against.
    reference: Option<Arc<TrackingReference>>,

    /// Tracking state machine.
    pub state: TrackingState,

    /// Number of consecutive failed frames.
    lost_frames: usize,

    last_id: Option<FrameId>,
    last_timestamp: Option<f64>,
    last_affine: AffineLight,
    last_rmse: Option<f64>,

    /// Body velocity in the world frame, known once inertial.
    velocity: Option<Vector3<f64>>,

    /// Samples not yet forwarded to the mapping thread.
    pending_imu: Vec<ImuSample>,

    world_epoch: u64,
}

impl Tracker {
    pub fn new(camera: CameraModel, settings: &VioSettings, shared: Arc<SharedState>) -> Self {
        let bootstrap = VisualBootstrap::new(
            camera,
            settings.bootstrap.clone(),
            PixelSelector::new(settings.selector.clone()),
        );
        Self {
            settings: settings.clone(),
            coarse: CoarseTracker::new(settings.tracker.clone()),
            bootstrap,
            motion: MotionModel::new(),
            imu_buffer: ImuBatchBuffer::new(settings.imu.max_sample_gap, settings.imu.max_carried_samples),
            shared,
            reference: None,
            state: TrackingState::NotInitialized,
            lost_frames: 0,
            last_id: None,
            last_timestamp: None,
            last_affine: AffineLight::default(),
            last_rmse: None,
            velocity: None,
            pending_imu: Vec::new(),
            world_epoch: 0,
        }
    }

    pub fn reference_keyframe(&self) -> Option<FrameId> {
        self.reference.as_ref().map(|r| r.keyframe_id)
    }

    /// Process one frame and return what should be sent to mapping.
    pub fn process_frame(
        &mut self,
        id: FrameId,
        image: &ImageAndExposure,
        imu: Option<&[ImuSample]>,
        ground_truth: Option<SE3>,
    ) -> (TrackingResult, TrackerOutput) {
        if let Some(last) = self.last_id {
            assert!(id > last, "frame ids must be strictly increasing ({} after {})", id, last);
        }
        let t_start = Instant::now();
        let timestamp = image.timestamp_s;
        let pyramid = Arc::new(ImagePyramid::build(image, self.settings.tracker.pyramid_levels));

        let batch = self.imu_buffer.prepare(imu, self.last_timestamp, timestamp);
        let imu_valid = batch.status == BatchStatus::Valid;
        if let BatchStatus::Malformed(err) = &batch.status {
            debug!("[Tracker] frame {} image-only: {}", id, err);
        }
        let frame_samples = batch.samples;
        self.pending_imu.extend_from_slice(&frame_samples);
        self.pending_imu.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        self.pending_imu.dedup_by(|b, a| (b.timestamp_s - a.timestamp_s).abs() < 1e-9);

        self.sync_world();
        self.refresh_reference();

        let mut metrics = TrackingMetrics::default();
        let output = match self.state {
            TrackingState::NotInitialized | TrackingState::Initializing => {
                self.process_bootstrap(id, timestamp, &pyramid, imu_valid, ground_truth)
            }
            TrackingState::Ok | TrackingState::RecentlyLost => {
                let prediction = if imu_valid {
                    self.predict_with_imu(&frame_samples, timestamp)
                } else {
                    None
                };
                match self.track(&pyramid, prediction.map(|p| p.0), &mut metrics) {
                    Ok((pose, affine, indicators)) => {
                        self.update_state(true);
                        self.update_velocity(&pose, prediction.map(|p| p.1), timestamp);
                        self.motion.update(&pose);
                        self.last_affine = affine;
                        let frame = TrackedFrame {
                            id,
                            timestamp_s: timestamp,
                            pyramid: pyramid.clone(),
                            pose,
                            affine,
                            indicators,
                            imu_samples: std::mem::take(&mut self.pending_imu),
                            imu_valid,
                            world_epoch: self.world_epoch,
                            ground_truth,
                        };
                        TrackerOutput::Frame(Box::new(frame))
                    }
                    Err(err) => {
                        self.update_state(false);
                        warn!("[Tracker] frame {} failed ({} in a row): {}", id, self.lost_frames, err);
                        self.velocity = None;
                        TrackerOutput::Nothing
                    }
                }
            }
            TrackingState::Lost => TrackerOutput::Nothing,
        };

        self.last_id = Some(id);
        self.last_timestamp = Some(timestamp);
        metrics.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        let pose = match &output {
            TrackerOutput::Frame(f) => Some(f.pose),
            TrackerOutput::InitialMap(m) => Some(m.second.pose),
            TrackerOutput::Nothing => None,
        };
        let result = TrackingResult {
            frame_id: id,
            state: self.state,
            pose,
            reference_kf: self.reference_keyframe(),
            metrics,
        };
        (result, output)
    }

    fn process_bootstrap(
        &mut self,
        id: FrameId,
        timestamp: f64,
        pyramid: &Arc<ImagePyramid>,
        imu_valid: bool,
        ground_truth: Option<SE3>,
    ) -> TrackerOutput {
        match self.bootstrap.add_frame(id, timestamp, pyramid) {
            BootstrapStatus::Started | BootstrapStatus::Restarted => {
                self.state = TrackingState::Initializing;
                // Keyframe-to-keyframe integration starts at the first frame.
                self.pending_imu.retain(|s| s.timestamp_s >= timestamp - self.settings.imu.max_sample_gap);
                TrackerOutput::Nothing
            }
            BootstrapStatus::Tracking { flow_px, rmse } => {
                debug!("[Tracker] bootstrap frame {}: flow {:.2}px rmse {:.2}", id, flow_px, rmse);
                TrackerOutput::Nothing
            }
            BootstrapStatus::Ready(result) => {
                info!(
                    "[Tracker] initial map from frames {} and {} with {} points",
                    result.first_id,
                    id,
                    result.points.len()
                );
                self.state = TrackingState::Ok;
                self.lost_frames = 0;
                self.motion.reset();
                self.motion.update(&result.pose);
                self.last_affine = result.affine;
                self.last_rmse = Some(result.rmse);
                let second = TrackedFrame {
                    id,
                    timestamp_s: timestamp,
                    pyramid: pyramid.clone(),
                    pose: result.pose,
                    affine: result.affine,
                    indicators: FlowIndicators::default(),
                    imu_samples: std::mem::take(&mut self.pending_imu),
                    imu_valid,
                    world_epoch: self.world_epoch,
                    ground_truth,
                };
                TrackerOutput::InitialMap(Box::new(InitialMap { bootstrap: result, second }))
            }
        }
    }

    fn track(
        &mut self,
        pyramid: &ImagePyramid,
        imu_prediction: Option<SE3>,
        metrics: &mut TrackingMetrics,
    ) -> Result<(SE3, AffineLight, FlowIndicators), TrackingFailure> {
        let reference = self.reference.clone().ok_or(TrackingFailure::NoReference)?;
        let recovery = self.state == TrackingState::RecentlyLost;
        let mut hypotheses: Vec<SE3> = imu_prediction.into_iter().collect();
        hypotheses.extend(self.motion.hypotheses(recovery));
        if hypotheses.is_empty() {
            hypotheses.push(*reference.pose());
        }
        metrics.hypotheses_tried = hypotheses.len();

        let estimate = self.coarse.track_hypotheses(
            &reference,
            pyramid,
            &hypotheses,
            &self.last_affine,
            self.last_rmse,
            recovery,
        )?;
        metrics.rmse = estimate.rmse;
        metrics.valid_fraction = estimate.indicators.valid_fraction;
        metrics.flow_t = estimate.indicators.flow_t;
        metrics.flow_rt = estimate.indicators.flow_rt;
        self.last_rmse = Some(estimate.rmse);
        Ok((estimate.pose, estimate.affine, estimate.indicators))
    }

    /// Propagates the last pose with this frame's samples once the world is
    /// metric. Returns the predicted `T_wc` and body velocity.
    fn predict_with_imu(&self, samples: &[ImuSample], timestamp: f64) -> Option<(SE3, Vector3<f64>)> {
        if !self.shared.imu_init_state().is_initialized() {
            return None;
        }
        let (t_prev, last_pose, velocity, reference) =
            (self.last_timestamp?, self.motion.last_pose()?, self.velocity?, self.reference.as_ref()?);
        let imu = &self.settings.imu;
        let preint = integrate_batch(samples, t_prev, timestamp, reference.state.bias, &imu.noise, imu.max_sample_gap).ok()?;
        let t_cam_imu = imu.t_cam_imu();
        let body = last_pose.compose(&t_cam_imu);
        let dt = preint.dt;
        let bias = &reference.state.bias;
        let rotation = body.rotation * preint.corrected_rotation(bias);
        let new_velocity = velocity + GRAVITY * dt + body.rotation * preint.corrected_velocity(bias);
        let translation =
            body.translation + velocity * dt + 0.5 * GRAVITY * dt * dt + body.rotation * preint.corrected_position(bias);
        let pose = SE3::new(rotation, translation).compose(&t_cam_imu.inverse());
        Some((pose, new_velocity))
    }

    /// Blends the inertial prediction with the tracked displacement.
    fn update_velocity(&mut self, pose: &SE3, predicted: Option<Vector3<f64>>, timestamp: f64) {
        if !self.shared.imu_init_state().is_initialized() {
            self.velocity = None;
            return;
        }
        let finite_difference = match (self.motion.last_pose(), self.last_timestamp) {
            (Some(last), Some(t_prev)) if timestamp > t_prev => {
                let t_cam_imu = self.settings.imu.t_cam_imu();
                let p_prev = last.compose(&t_cam_imu).translation;
                let p_cur = pose.compose(&t_cam_imu).translation;
                Some((p_cur - p_prev) / (timestamp - t_prev))
            }
            _ => None,
        };
        self.velocity = match (predicted, finite_difference) {
            (Some(p), Some(f)) => Some(0.5 * (p + f)),
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        };
    }

    /// Re-expresses tracker state after the mapping thread committed a new
    /// world alignment.
    fn sync_world(&mut self) {
        let world = self.shared.world();
        if world.epoch == self.world_epoch {
            return;
        }
        info!(
            "[Tracker] world epoch {} -> {} (scale {:.4})",
            self.world_epoch, world.epoch, world.from_previous.scale
        );
        self.motion.transform_world(&world.from_previous);
        if let Some(reference) = &self.reference {
            if reference.world_epoch != world.epoch {
                self.reference = Some(Arc::new(reference.transformed(&world.from_previous, world.epoch)));
            }
        }
        self.velocity = None;
        self.world_epoch = world.epoch;
    }

    /// Switches to a newer keyframe snapshot if the mapper published one.
    pub fn refresh_reference(&mut self) {
        let Some(latest) = self.shared.tracking_reference() else {
            return;
        };
        let newer = self.reference.as_ref().map_or(true, |cur| {
            latest.keyframe_id > cur.keyframe_id
                || (latest.keyframe_id == cur.keyframe_id && latest.world_epoch > cur.world_epoch)
        });
        if !newer {
            return;
        }
        let latest = if latest.world_epoch < self.world_epoch {
            Arc::new(latest.transformed(&self.shared.world().from_previous, self.world_epoch))
        } else {
            latest
        };
        if self.velocity.is_none() && self.shared.imu_init_state().is_initialized() {
            self.velocity = Some(latest.state.velocity);
        }
        debug!(
            "[Tracker] reference keyframe {} with {} points",
            latest.keyframe_id,
            latest.point_count()
        );
        self.reference = Some(latest);
    }

    /// Update the tracking state from the outcome of the last frame.
    fn update_state(&mut self, tracking_good: bool) {
        let max_lost = self.settings.tracker.max_lost_frames;
        self.state = match self.state {
            TrackingState::Ok | TrackingState::RecentlyLost if tracking_good => {
                self.lost_frames = 0;
                TrackingState::Ok
            }
            TrackingState::Ok | TrackingState::RecentlyLost => {
                self.lost_frames += 1;
                if self.lost_frames >= max_lost {
                    warn!("[Tracker] lost after {} consecutive failures", self.lost_frames);
                    self.shared.set_lost(true);
                    TrackingState::Lost
                } else {
                    TrackingState::RecentlyLost
                }
            }
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{CircularTrajectory, ImuSimulator, SyntheticSequence};

    #[test]
    fn bootstrap_produces_initial_map() {
        let camera = SyntheticSequence::default_camera();
        let mut seq = SyntheticSequence::new(camera, 20.0, Box::new(CircularTrajectory::default()), ImuSimulator::ideal(200.0));
        let shared = SharedState::new(true);
        let mut tracker = Tracker::new(camera, &VioSettings::default(), shared);

        let mut initial = None;
        for i in 0..40u64 {
            let frame = seq.frame(i);
            let (result, output) = tracker.process_frame(FrameId(i), &frame.image, frame.imu.as_deref(), None);
            if let TrackerOutput::InitialMap(map) = output {
                assert_eq!(result.state, TrackingState::Ok);
                initial = Some(map);
                break;
            }
            assert_eq!(result.state, TrackingState::Initializing);
        }
        let map = initial.expect("no initial map");
        assert_eq!(map.bootstrap.first_id, FrameId(0));
        // Samples cover the interval between the two keyframes.
        let first = map.second.imu_samples.first().unwrap().timestamp_s;
        let last = map.second.imu_samples.last().unwrap().timestamp_s;
        assert!(first <= map.bootstrap.first_timestamp_s + 1e-9);
        assert!(last >= map.second.timestamp_s - 1e-9);
    }

    #[test]
    fn without_reference_tracking_fails_until_lost() {
        let camera = SyntheticSequence::default_camera();
        let mut seq = SyntheticSequence::new(camera, 20.0, Box::new(CircularTrajectory::default()), ImuSimulator::ideal(200.0));
        let shared = SharedState::new(false);
        let mut tracker = Tracker::new(camera, &VioSettings::default(), shared.clone());
        tracker.state = TrackingState::Ok;
        tracker.motion.update(&SE3::identity());

        let max_lost = VioSettings::default().tracker.max_lost_frames;
        for i in 0..max_lost as u64 {
            let frame = seq.frame(i);
            let (_, output) = tracker.process_frame(FrameId(i), &frame.image, None, None);
            assert!(matches!(output, TrackerOutput::Nothing));
        }
        assert_eq!(tracker.state, TrackingState::Lost);
        assert!(shared.is_lost());
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn duplicate_ids_panic() {
        let camera = SyntheticSequence::default_camera();
        let mut seq = SyntheticSequence::new(camera, 20.0, Box::new(CircularTrajectory::default()), ImuSimulator::ideal(200.0));
        let mut tracker = Tracker::new(camera, &VioSettings::default(), SharedState::new(false));
        let frame = seq.frame(0);
        tracker.process_frame(FrameId(3), &frame.image, None, None);
        tracker.process_frame(FrameId(3), &frame.image, None, None);
    }
}
