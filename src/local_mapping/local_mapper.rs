//! Local Mapper - the mapping thread.
//!
//! Owns the active window, the marginalization prior, the IMU factors and
//! the delayed initializer. For every tracked frame:
//! 1. Traces immature points in the frame
//! 2. Decides whether the frame becomes a keyframe
//! 3. Inserts the keyframe and connects active points to it
//! 4. Activates points and optimizes the window
//! 5. Feeds the scale/gravity initializer and commits its result
//! 6. Folds stale points and surplus keyframes into the prior
//! 7. Seeds new immature points
//! 8. Publishes the tracking snapshot and the output updates

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::{Vector2, Vector3};
use tracing::{debug, info, warn};

use crate::frame::{CameraModel, ImagePyramid, PixelSelector};
use crate::geometry::SE3;
use crate::imu::{integrate_batch, ImuInitState, ImuSample, PreintegratedImu, GRAVITY};
use crate::optimizer::bundle::{BundleProblem, BundleReport, BundleSolver, SolverError};
use crate::optimizer::imu_factors::{ImuFactor, ImuFactorContext};
use crate::optimizer::marginalization::{MarginalizationPrior, Marginalizer};
use crate::optimizer::photometric::FrameView;
use crate::system::messages::{InitialMap, MappingCommand, TrackedFrame};
use crate::system::output::{MapPointUpdate, OutputSinks, PoseUpdate};
use crate::system::settings::VioSettings;
use crate::system::shared_state::SharedState;
use crate::tracking::coarse_tracker::TrackingReference;
use crate::tracking::keyframe_decision::KeyFrameDecision;
use crate::window::{
    frames_to_flag, select_frame_to_drop, trace_point, ActivationParams, ActiveWindow, DropPolicy, FrameId, FrameState,
    KeyFrame, Point, PointActivator, PointStatus, Residual, ResidualState, TraceOutcome,
};

use super::imu_init::{DelayedInitializer, InitKeyframe, InitializerStatus, ScaleState};

/// Timeout for receiving messages. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Gradient weighting constant of the point patterns.
const GRAD_WEIGHT_C: f64 = 50.0;

/// Solver failures within this many keyframes count as a failed
/// initialization rather than tracking loss.
const EARLY_KEYFRAMES: usize = 5;

/// Pixels this close to the border do not receive new residuals.
const RESIDUAL_MARGIN: f64 = 3.0;

/// What one message did to the estimator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingOutcome {
    pub frame: Option<FrameId>,
    pub keyframe_created: bool,
    pub window_size: usize,
    pub marginalized: Vec<FrameId>,
    pub scale_committed: bool,
    pub bundle: Option<BundleReport>,
}

/// Local Mapping thread state.
pub struct LocalMapper {
    camera: CameraModel,
    settings: VioSettings,
    shared: Arc<SharedState>,
    sinks: OutputSinks,

    window: ActiveWindow,
    prior: MarginalizationPrior,
    imu_factors: Vec<ImuFactor>,
    /// Present when inertial fusion is enabled.
    imu_context: Option<ImuFactorContext>,
    /// Raw samples from the newest keyframe onwards, sorted.
    imu_samples: Vec<ImuSample>,
    initializer: Option<DelayedInitializer>,

    solver: BundleSolver,
    marginalizer: Marginalizer,
    activator: PointActivator,
    selector: PixelSelector,
    decision: KeyFrameDecision,

    world_epoch: u64,
    keyframes_created: usize,
}

impl LocalMapper {
    pub fn new(camera: CameraModel, settings: &VioSettings, shared: Arc<SharedState>, sinks: OutputSinks) -> Self {
        let imu_context = settings.imu.enabled.then(|| ImuFactorContext {
            t_cam_imu: settings.imu.t_cam_imu(),
            noise: settings.imu.noise,
            weight: settings.imu.factor_weight,
        });
        let initializer = settings
            .imu
            .enabled
            .then(|| DelayedInitializer::new(settings.initializer.clone(), settings.imu.t_cam_imu()));
        Self {
            camera,
            settings: settings.clone(),
            world_epoch: shared.world().epoch,
            shared,
            sinks,
            window: ActiveWindow::new(settings.window.capacity),
            prior: MarginalizationPrior::new(),
            imu_factors: Vec::new(),
            imu_context,
            imu_samples: Vec::new(),
            initializer,
            solver: BundleSolver::new(settings.solver.clone()),
            marginalizer: Marginalizer::new(settings.solver.huber_k, settings.solver.min_idepth_hessian),
            activator: PointActivator::new(),
            selector: PixelSelector::new(settings.selector.clone()),
            decision: KeyFrameDecision::new(&settings.window),
            keyframes_created: 0,
        }
    }

    pub fn window(&self) -> &ActiveWindow {
        &self.window
    }

    pub fn prior(&self) -> &MarginalizationPrior {
        &self.prior
    }

    pub fn imu_factors(&self) -> &[ImuFactor] {
        &self.imu_factors
    }

    pub fn keyframes_created(&self) -> usize {
        self.keyframes_created
    }

    /// Main thread loop: receive messages and process them.
    ///
    /// Runs until a shutdown command arrives, shutdown is requested with an
    /// empty queue, or the channel is closed.
    pub fn run(&mut self, receiver: Receiver<MappingCommand>) {
        info!("[LocalMapper] started");
        loop {
            if self.shared.is_shutdown_requested() && receiver.is_empty() {
                break;
            }
            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(MappingCommand::Shutdown) => break,
                Ok(command) => {
                    self.handle_message(command);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.sinks.drain();
        info!("[LocalMapper] stopped after {} keyframes", self.keyframes_created);
    }

    /// Processes one command synchronously.
    pub fn handle_message(&mut self, command: MappingCommand) -> MappingOutcome {
        match command {
            MappingCommand::Frame(frame) => self.handle_frame(*frame),
            MappingCommand::InitialMap(map) => self.handle_initial_map(*map),
            MappingCommand::Drain(ack) => {
                self.sinks.drain();
                // The feeder may have given up waiting.
                let _ = ack.send(());
                MappingOutcome::default()
            }
            MappingCommand::Shutdown => MappingOutcome::default(),
        }
    }

    fn inertial_committed(&self) -> bool {
        self.shared.imu_init_state().is_initialized()
    }

    fn image_size(&self) -> f64 {
        (self.camera.width + self.camera.height) as f64
    }

    // ------------------------------------------------------------------
    // Initial map
    // ------------------------------------------------------------------

    fn handle_initial_map(&mut self, map: InitialMap) -> MappingOutcome {
        let InitialMap { bootstrap, second } = map;
        let mut outcome = MappingOutcome { frame: Some(second.id), ..Default::default() };
        if !self.window.is_empty() {
            warn!("[LocalMapper] initial map received with a populated window, ignored");
            return outcome;
        }
        self.ingest_imu(second.id, &second.imu_samples);

        let first_id = bootstrap.first_id;
        let first_state = FrameState::new(SE3::identity());
        self.window.insert_frame(KeyFrame::new(
            first_id,
            bootstrap.first_timestamp_s,
            bootstrap.first_pyramid.clone(),
            first_state,
        ));

        let preint = self.preintegrate(bootstrap.first_timestamp_s, second.timestamp_s, &first_state);
        let second_state = FrameState {
            affine: second.affine,
            ..FrameState::new(bootstrap.pose)
        };
        self.window
            .insert_frame(KeyFrame::new(second.id, second.timestamp_s, second.pyramid.clone(), second_state));
        if let Some(p) = &preint {
            self.imu_factors.push(ImuFactor::new(first_id, second.id, p.clone()));
        }
        self.prune_imu(second.timestamp_s);
        self.keyframes_created = 2;
        self.decision.reset();

        let anchor_weight = self.settings.window.anchor_weight;
        if let Some(kf) = self.window.frame_mut(first_id) {
            self.prior.add_anchor(kf, anchor_weight);
        }

        let level0 = bootstrap.first_pyramid.level(0);
        let mut created = 0;
        for &(u, v, idepth) in &bootstrap.points {
            let id = self.window.allocate_point_id();
            let Some(mut point) = Point::new_immature(id, first_id, level0, u, v, GRAD_WEIGHT_C) else {
                continue;
            };
            point.idepth = idepth;
            point.idepth_min = 0.5 * idepth;
            point.idepth_max = 2.0 * idepth;
            point.set_status(PointStatus::Active);
            point.residuals.push(Residual::new(second.id));
            if self.window.add_point(point) {
                created += 1;
            }
        }
        if let Some(kf) = self.window.frame_mut(first_id) {
            kf.activated_count = created;
        }
        info!(
            "[LocalMapper] initial map: keyframes {} and {}, {} active points",
            first_id, second.id, created
        );

        match self.optimize() {
            Ok(report) => outcome.bundle = Some(report),
            Err(SolverError::Empty) => {}
            Err(err) => {
                self.handle_solver_error(err);
                outcome.window_size = self.window.len();
                return outcome;
            }
        }

        self.feed_initializer(first_id, bootstrap.first_timestamp_s, None);
        outcome.scale_committed = self.feed_initializer(second.id, second.timestamp_s, preint);

        self.seed_points(second.id);
        self.publish_snapshot();
        self.publish_window(None);
        outcome.keyframe_created = true;
        outcome.window_size = self.window.len();
        outcome
    }

    // ------------------------------------------------------------------
    // Tracked frames
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, mut frame: TrackedFrame) -> MappingOutcome {
        let mut outcome = MappingOutcome { frame: Some(frame.id), ..Default::default() };
        if frame.world_epoch < self.world_epoch {
            let world = self.shared.world();
            frame.pose = world.from_previous.transform_pose(&frame.pose);
            frame.world_epoch = self.world_epoch;
        }
        self.ingest_imu(frame.id, &frame.imu_samples);

        let Some(newest) = self.window.newest() else {
            warn!("[LocalMapper] frame {} arrived before the initial map, ignored", frame.id);
            return outcome;
        };
        if frame.id <= newest.id {
            warn!("[LocalMapper] frame {} is not newer than keyframe {}, ignored", frame.id, newest.id);
            return outcome;
        }

        let state = FrameState {
            affine: frame.affine,
            ..FrameState::new(frame.pose)
        };
        self.trace_immature(&state, &frame.pyramid);

        if !self.decision.should_create_keyframe(&frame.indicators, self.image_size()) {
            let update = PoseUpdate {
                frame_id: frame.id,
                timestamp_s: frame.timestamp_s,
                pose: frame.pose,
                is_keyframe: false,
                scale_corrected: self.shared.world().scale_corrected,
            };
            self.sinks.publish_poses(&[update]);
            outcome.window_size = self.window.len();
            return outcome;
        }
        self.create_keyframe(frame, outcome)
    }

    fn create_keyframe(&mut self, frame: TrackedFrame, mut outcome: MappingOutcome) -> MappingOutcome {
        let Some(prev) = self.window.newest() else {
            return outcome;
        };
        let (prev_id, prev_ts, prev_state) = (prev.id, prev.timestamp_s, prev.state);
        let preint = self.preintegrate(prev_ts, frame.timestamp_s, &prev_state);

        let mut state = FrameState {
            affine: frame.affine,
            velocity: prev_state.velocity,
            bias: prev_state.bias,
            ..FrameState::new(frame.pose)
        };
        if self.inertial_committed() {
            state.velocity = match (&preint, &self.imu_context) {
                (Some(p), Some(ctx)) => {
                    let body_i = prev_state.pose.compose(&ctx.t_cam_imu);
                    prev_state.velocity + GRAVITY * p.dt + body_i.rotation * p.corrected_velocity(&prev_state.bias)
                }
                _ => {
                    let dt = (frame.timestamp_s - prev_ts).max(1e-6);
                    (frame.pose.translation - prev_state.pose.translation) / dt
                }
            };
        }

        self.window
            .insert_frame(KeyFrame::new(frame.id, frame.timestamp_s, frame.pyramid.clone(), state));
        self.keyframes_created += 1;
        if let Some(p) = &preint {
            self.imu_factors.push(ImuFactor::new(prev_id, frame.id, p.clone()));
        }
        self.prune_imu(frame.timestamp_s);

        let connected = self.connect_active_points(frame.id);
        let params = self.activation_params();
        let activation = self.activator.activate(&mut self.window, &self.camera, &params);
        debug!(
            "[LocalMapper] keyframe {}: {} residuals added, {} points activated",
            frame.id, connected, activation.activated
        );

        match self.optimize() {
            Ok(report) => outcome.bundle = Some(report),
            Err(SolverError::Empty) => debug!("[LocalMapper] nothing to optimize at {}", frame.id),
            Err(err) => {
                self.handle_solver_error(err);
                outcome.window_size = self.window.len();
                return outcome;
            }
        }

        outcome.scale_committed = self.feed_initializer(frame.id, frame.timestamp_s, preint);
        self.fold_stale_points(frame.id);
        outcome.marginalized = self.marginalize_frames();
        self.seed_points(frame.id);
        self.publish_snapshot();
        self.publish_window(Some(&frame));

        outcome.keyframe_created = true;
        outcome.window_size = self.window.len();
        outcome
    }

    // ------------------------------------------------------------------
    // Inertial bookkeeping
    // ------------------------------------------------------------------

    /// Adds the frame's samples and those carried from dropped frames.
    fn ingest_imu(&mut self, frame: FrameId, samples: &[ImuSample]) {
        let carried = self.shared.take_imu_carry_before(frame);
        if self.imu_context.is_none() {
            return;
        }
        self.imu_samples.extend(carried);
        self.imu_samples.extend_from_slice(samples);
        self.imu_samples.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        self.imu_samples.dedup_by(|b, a| (b.timestamp_s - a.timestamp_s).abs() < 1e-9);
    }

    fn preintegrate(&self, t_start: f64, t_end: f64, from: &FrameState) -> Option<PreintegratedImu> {
        let ctx = self.imu_context.as_ref()?;
        match integrate_batch(&self.imu_samples, t_start, t_end, from.bias, &ctx.noise, self.settings.imu.max_sample_gap) {
            Ok(p) => Some(p),
            Err(err) => {
                debug!("[LocalMapper] no inertial factor for [{:.3}, {:.3}]: {}", t_start, t_end, err);
                None
            }
        }
    }

    /// Drops samples before the newest keyframe, keeping one at or before
    /// it so the next interval stays bracketed.
    fn prune_imu(&mut self, t_keyframe: f64) {
        let keep_from = self
            .imu_samples
            .partition_point(|s| s.timestamp_s <= t_keyframe)
            .saturating_sub(1);
        self.imu_samples.drain(..keep_from);
    }

    /// Replaces the two factors around `frame` with one spanning its
    /// neighbours, re-integrated from their raw samples.
    fn merge_imu_factors_around(&mut self, frame: FrameId) {
        let before = self.imu_factors.iter().position(|f| f.to == frame).map(|i| self.imu_factors[i].clone());
        let after = self.imu_factors.iter().position(|f| f.from == frame).map(|i| self.imu_factors[i].clone());
        self.imu_factors.retain(|f| !f.touches(frame));
        let (Some(before), Some(after), Some(ctx)) = (before, after, self.imu_context.as_ref()) else {
            return;
        };
        let mut samples = before.preint.samples.clone();
        samples.extend_from_slice(&after.preint.samples);
        samples.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        samples.dedup_by(|b, a| (b.timestamp_s - a.timestamp_s).abs() < 1e-9);
        match integrate_batch(
            &samples,
            before.preint.t_start,
            after.preint.t_end,
            before.preint.bias_lin,
            &ctx.noise,
            self.settings.imu.max_sample_gap,
        ) {
            Ok(preint) => {
                self.imu_factors.push(ImuFactor::new(before.from, after.to, preint));
                self.imu_factors.sort_by_key(|f| f.from);
            }
            Err(err) => warn!("[LocalMapper] merging factors around {} failed: {}", frame, err),
        }
    }

    /// Returns true when the scale was committed.
    fn feed_initializer(&mut self, id: FrameId, timestamp_s: f64, preint: Option<PreintegratedImu>) -> bool {
        let Some(pose) = self.window.frame(id).map(|f| f.state.pose) else {
            return false;
        };
        let status = {
            let Some(initializer) = self.initializer.as_mut() else {
                return false;
            };
            let window = &self.window;
            initializer.update_poses(|f| window.frame(f).map(|kf| kf.state.pose));
            initializer.add_keyframe(InitKeyframe {
                id,
                timestamp_s,
                pose,
                preint_from_previous: preint,
            })
        };
        match status {
            InitializerStatus::Converged(state) => {
                self.initializer = None;
                self.commit_scale(state);
                true
            }
            InitializerStatus::TimedOut => {
                self.initializer = None;
                self.shared.set_imu_init_state(ImuInitState::Failed);
                self.shared.set_init_failed(true);
                false
            }
            InitializerStatus::Collecting { .. } | InitializerStatus::Estimated { .. } => false,
        }
    }

    /// Moves the live window into the metric, gravity-aligned world. This is
    /// the only place the world definition changes.
    fn commit_scale(&mut self, state: ScaleState) {
        let sim3 = state.alignment;
        let scale = sim3.scale;
        for kf in self.window.frames_mut() {
            let velocity = state.velocity_of(kf.id).unwrap_or_else(|| {
                warn!("[LocalMapper] no initial velocity for {}", kf.id);
                Vector3::zeros()
            });
            kf.state.pose = sim3.transform_pose(&kf.state.pose);
            kf.state.velocity = velocity;
            kf.state.bias = state.bias;
            if let Some(fej) = kf.fej.as_mut() {
                fej.pose = sim3.transform_pose(&fej.pose);
                fej.velocity = velocity;
                fej.bias = state.bias;
            }
        }
        for point in self.window.points_mut() {
            point.idepth /= scale;
            point.idepth_min /= scale;
            if point.idepth_max.is_finite() {
                point.idepth_max /= scale;
            }
            point.idepth_hessian *= scale * scale;
        }
        self.prior.transform_world(&sim3);
        self.world_epoch = self.shared.commit_world(sim3);
        self.shared.set_imu_init_state(ImuInitState::Initialized);
        info!(
            "[LocalMapper] scale committed: s = {:.4} (sigma {:.4}), world epoch {}",
            scale, state.scale_sigma, self.world_epoch
        );
    }

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    fn activation_params(&self) -> ActivationParams {
        let w = &self.settings.window;
        let s = &self.settings.solver;
        ActivationParams {
            target_active: w.target_active_points,
            min_quality: w.activation_min_quality,
            max_interval_px: w.activation_max_interval_px,
            huber_k: s.huber_k,
            outlier_energy: s.outlier_energy(),
            min_idepth_hessian: s.min_idepth_hessian,
            gn_iterations: 3,
        }
    }

    fn trace_immature(&mut self, state: &FrameState, pyramid: &ImagePyramid) {
        let target = FrameView::current(state, pyramid);
        let max_failures = self.settings.trace.max_failures;
        let mut dropped = 0;
        for id in self.window.point_ids_with_status(PointStatus::Immature) {
            let Some(mut point) = self.window.point(id).cloned() else { continue };
            let Some(host) = self.window.frame(point.host) else { continue };
            let outcome = trace_point(
                &mut point,
                &FrameView::of(host),
                &target,
                &self.camera,
                &self.settings.trace,
                self.settings.solver.huber_k,
            );
            if outcome == TraceOutcome::OutOfBounds || point.trace_failures > max_failures {
                if let Some(p) = self.window.point_mut(id) {
                    p.set_status(PointStatus::Marginalized);
                }
                self.window.remove_point(id);
                dropped += 1;
            } else if let Some(p) = self.window.point_mut(id) {
                *p = point;
            }
        }
        if dropped > 0 {
            debug!("[LocalMapper] {} immature points dropped while tracing", dropped);
        }
    }

    /// Gives every active point that projects into `keyframe` a residual
    /// there. Returns the number of residuals added.
    fn connect_active_points(&mut self, keyframe: FrameId) -> usize {
        let Some(target_pose) = self.window.frame(keyframe).map(|f| f.state.pose) else {
            return 0;
        };
        let visible: Vec<_> = self
            .window
            .points()
            .filter(|p| p.is_active() && p.host != keyframe && !p.has_residual_to(keyframe))
            .filter(|p| {
                self.window
                    .frame(p.host)
                    .and_then(|h| reproject(&self.camera, &h.state.pose, &target_pose, p.u, p.v, p.idepth))
                    .is_some_and(|(uv, _)| self.camera.in_bounds(&uv, RESIDUAL_MARGIN))
            })
            .map(|p| p.id)
            .collect();
        for id in &visible {
            if let Some(p) = self.window.point_mut(*id) {
                p.residuals.push(Residual::new(keyframe));
            }
        }
        visible.len()
    }

    /// Folds active points that no longer observe the newest keyframe.
    /// Outliers stay until their host is marginalized.
    fn fold_stale_points(&mut self, newest: FrameId) {
        let stale: Vec<_> = self
            .window
            .points()
            .filter(|p| p.is_active() && p.host != newest)
            .filter(|p| {
                !p.residuals
                    .iter()
                    .any(|r| r.target == newest && r.state == ResidualState::Inlier)
            })
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return;
        }
        let (folded, dropped) = self
            .marginalizer
            .marginalize_points(&mut self.window, &mut self.prior, &stale, &self.camera);
        debug!("[LocalMapper] {} stale points folded, {} dropped", folded, dropped);
    }

    fn seed_points(&mut self, keyframe: FrameId) {
        let Some(pyramid) = self.window.frame(keyframe).map(|f| f.pyramid.clone()) else {
            return;
        };
        let candidates = self
            .selector
            .select(&pyramid, 0, self.settings.window.immature_points_per_keyframe);
        let level0 = pyramid.level(0);
        let mut seeded = 0;
        for c in candidates {
            let id = self.window.allocate_point_id();
            if let Some(point) = Point::new_immature(id, keyframe, level0, c.x as f64, c.y as f64, GRAD_WEIGHT_C) {
                if self.window.add_point(point) {
                    seeded += 1;
                }
            }
        }
        debug!("[LocalMapper] {} immature points seeded in {}", seeded, keyframe);
    }

    // ------------------------------------------------------------------
    // Optimization and marginalization
    // ------------------------------------------------------------------

    fn optimize(&mut self) -> Result<BundleReport, SolverError> {
        let imu = if self.inertial_committed() { self.imu_context.as_ref() } else { None };
        let factors: &mut [ImuFactor] = if imu.is_some() { &mut self.imu_factors } else { &mut [] };
        self.solver.solve(BundleProblem {
            window: &mut self.window,
            prior: &self.prior,
            imu_factors: factors,
            camera: &self.camera,
            imu,
            repropagation_threshold: self.settings.imu.repropagation_threshold,
        })
    }

    fn handle_solver_error(&self, err: SolverError) {
        let initializing =
            self.keyframes_created <= EARLY_KEYFRAMES || self.shared.imu_init_state() == ImuInitState::NotInitialized;
        if initializing {
            warn!("[LocalMapper] optimization failed during initialization: {}", err);
            self.shared.set_init_failed(true);
        } else {
            warn!("[LocalMapper] optimization failed: {}", err);
            self.shared.set_lost(true);
        }
    }

    /// Removes flagged frames, then the least useful frames until the
    /// window fits its capacity.
    fn marginalize_frames(&mut self) -> Vec<FrameId> {
        let policy = DropPolicy {
            min_points_remaining: self.settings.window.min_points_remaining,
            max_affine_change: self.settings.window.max_affine_change,
        };
        let mut removed = Vec::new();
        for id in frames_to_flag(&self.window, &policy) {
            self.marginalize_frame(id);
            removed.push(id);
        }
        while self.window.len() > self.window.capacity() {
            let Some(id) = select_frame_to_drop(self.window.frames()) else { break };
            self.marginalize_frame(id);
            removed.push(id);
        }
        removed
    }

    fn marginalize_frame(&mut self, frame: FrameId) {
        let committed = self.inertial_committed();
        if !committed {
            self.merge_imu_factors_around(frame);
        }
        let imu = if committed { self.imu_context.as_ref() } else { None };
        let report = self.marginalizer.marginalize_frame(
            &mut self.window,
            &mut self.prior,
            &mut self.imu_factors,
            frame,
            &self.camera,
            imu,
        );
        debug!(
            "[LocalMapper] marginalized {}: {} points folded, {} inertial factors folded",
            frame, report.points_folded, report.imu_factors_folded
        );
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    /// Publishes the newest keyframe with the active points projected into
    /// it as the tracker's next reference.
    fn publish_snapshot(&self) {
        let Some(newest) = self.window.newest() else { return };
        let observations: Vec<(f64, f64, f64)> = self
            .window
            .points()
            .filter(|p| p.is_active())
            .filter_map(|p| {
                let host = self.window.frame(p.host)?;
                let (uv, idepth) = reproject(&self.camera, &host.state.pose, &newest.state.pose, p.u, p.v, p.idepth)?;
                self.camera.in_bounds(&uv, 0.0).then_some((uv.x, uv.y, idepth))
            })
            .collect();
        let reference = TrackingReference::new(
            newest.id,
            newest.timestamp_s,
            newest.state,
            newest.pyramid.clone(),
            &self.camera,
            &observations,
            self.world_epoch,
        );
        debug!(
            "[LocalMapper] snapshot of {} with {} points",
            newest.id,
            reference.point_count()
        );
        self.shared.set_tracking_reference(Arc::new(reference));
    }

    fn publish_window(&self, frame: Option<&TrackedFrame>) {
        let scale_corrected = self.shared.world().scale_corrected;
        let mut poses: Vec<PoseUpdate> = self
            .window
            .frames()
            .iter()
            .map(|kf| PoseUpdate {
                frame_id: kf.id,
                timestamp_s: kf.timestamp_s,
                pose: kf.state.pose,
                is_keyframe: true,
                scale_corrected,
            })
            .collect();
        if let Some(f) = frame {
            if self.window.frame(f.id).is_none() {
                poses.push(PoseUpdate {
                    frame_id: f.id,
                    timestamp_s: f.timestamp_s,
                    pose: f.pose,
                    is_keyframe: false,
                    scale_corrected,
                });
            }
        }
        self.sinks.publish_poses(&poses);

        let points: Vec<MapPointUpdate> = self
            .window
            .points()
            .filter(|p| p.is_active())
            .filter_map(|p| {
                let host = self.window.frame(p.host)?;
                let position = host
                    .state
                    .pose
                    .transform_point(&(self.camera.unproject(p.u, p.v) / p.idepth.max(1e-9)));
                Some(MapPointUpdate { point_id: p.id, host: p.host, position, status: p.status })
            })
            .collect();
        self.sinks.publish_points(&points);
    }
}

/// Pixel position and inverse depth in `target` of a point hosted at
/// `(u, v)` with inverse depth `idepth`.
fn reproject(
    camera: &CameraModel,
    host_pose: &SE3,
    target_pose: &SE3,
    u: f64,
    v: f64,
    idepth: f64,
) -> Option<(Vector2<f64>, f64)> {
    if idepth <= 0.0 || !idepth.is_finite() {
        return None;
    }
    let p_world = host_pose.transform_point(&(camera.unproject(u, v) / idepth));
    let p_target = target_pose.inverse().transform_point(&p_world);
    if p_target.z <= 1e-6 {
        return None;
    }
    let uv = camera.project(&p_target)?;
    Some((uv, 1.0 / p_target.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuBias, ImuNoise};
    use crate::simulation::{CircularTrajectory, ImuSimulator, SyntheticSequence};
    use crate::system::output::TrajectoryRecorder;
    use crate::tracking::{Tracker, TrackerOutput};

    fn sequence() -> SyntheticSequence {
        SyntheticSequence::new(
            SyntheticSequence::default_camera(),
            20.0,
            Box::new(CircularTrajectory::default()),
            ImuSimulator::ideal(200.0),
        )
    }

    /// Tracker and mapper run in lock-step on the caller's thread.
    struct Harness {
        seq: SyntheticSequence,
        shared: Arc<SharedState>,
        tracker: Tracker,
        mapper: LocalMapper,
        recorder: TrajectoryRecorder,
        next: u64,
    }

    impl Harness {
        fn new() -> Self {
            let seq = sequence();
            let settings = VioSettings::default();
            let shared = SharedState::new(true);
            let recorder = TrajectoryRecorder::new();
            let sinks = OutputSinks::new();
            sinks.register(Box::new(recorder.clone()));
            let tracker = Tracker::new(seq.camera, &settings, shared.clone());
            let mapper = LocalMapper::new(seq.camera, &settings, shared.clone(), sinks);
            Self { seq, shared, tracker, mapper, recorder, next: 0 }
        }

        fn advance(&mut self, frames: u64, check: impl Fn(&LocalMapper, &MappingOutcome)) {
            for _ in 0..frames {
                let i = self.next;
                self.next += 1;
                let frame = self.seq.frame(i);
                let (_, output) =
                    self.tracker
                        .process_frame(FrameId(i), &frame.image, frame.imu.as_deref(), Some(frame.ground_truth));
                let command = match output {
                    TrackerOutput::Nothing => continue,
                    TrackerOutput::Frame(f) => MappingCommand::Frame(f),
                    TrackerOutput::InitialMap(m) => MappingCommand::InitialMap(m),
                };
                let outcome = self.mapper.handle_message(command);
                check(&self.mapper, &outcome);
                self.tracker.refresh_reference();
            }
        }
    }

    fn drive(frames: u64, check: impl Fn(&LocalMapper, &MappingOutcome)) -> (LocalMapper, TrajectoryRecorder) {
        let mut harness = Harness::new();
        harness.advance(frames, check);
        (harness.mapper, harness.recorder)
    }

    #[test]
    fn initial_map_creates_two_keyframes_and_a_snapshot() {
        let mut seq = sequence();
        let settings = VioSettings::default();
        let shared = SharedState::new(true);
        let mut tracker = Tracker::new(seq.camera, &settings, shared.clone());
        let mut mapper = LocalMapper::new(seq.camera, &settings, shared.clone(), OutputSinks::new());

        let mut outcome = None;
        for i in 0..40 {
            let frame = seq.frame(i);
            if let (_, TrackerOutput::InitialMap(map)) = tracker.process_frame(FrameId(i), &frame.image, frame.imu.as_deref(), None) {
                outcome = Some(mapper.handle_message(MappingCommand::InitialMap(map)));
                break;
            }
        }
        let outcome = outcome.expect("bootstrap did not finish");
        assert!(outcome.keyframe_created);
        assert_eq!(outcome.window_size, 2);
        assert!(mapper.window().count_with_status(PointStatus::Active) > 50);
        assert!(mapper.window().count_with_status(PointStatus::Immature) > 0);
        assert_eq!(mapper.imu_factors().len(), 1);
        assert!(!mapper.prior().is_empty());
        let reference = shared.tracking_reference().expect("no snapshot");
        assert_eq!(Some(reference.keyframe_id), mapper.window().newest().map(|k| k.id));
        assert!(reference.point_count() > 50);
    }

    #[test]
    fn window_respects_capacity_and_order() {
        let capacity = VioSettings::default().window.capacity;
        let (mapper, recorder) = drive(120, |mapper, outcome| {
            assert!(mapper.window().len() <= capacity);
            assert!(mapper.window().ids_strictly_increasing());
            assert!(outcome.window_size <= capacity);
        });
        assert!(mapper.keyframes_created() > capacity);
        let poses = recorder.poses();
        assert!(poses.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
        assert!(recorder.point_count() > 0);
    }

    #[test]
    fn frames_before_initial_map_are_ignored() {
        let mut seq = sequence();
        let settings = VioSettings::default();
        let mut mapper = LocalMapper::new(seq.camera, &settings, SharedState::new(true), OutputSinks::new());
        let frame = seq.frame(0);
        let tracked = TrackedFrame {
            id: FrameId(0),
            timestamp_s: 0.0,
            pyramid: Arc::new(ImagePyramid::build(&frame.image, 4)),
            pose: SE3::identity(),
            affine: Default::default(),
            indicators: Default::default(),
            imu_samples: Vec::new(),
            imu_valid: false,
            world_epoch: 0,
            ground_truth: None,
        };
        let outcome = mapper.handle_message(MappingCommand::Frame(Box::new(tracked)));
        assert!(!outcome.keyframe_created);
        assert!(mapper.window().is_empty());
    }

    #[test]
    fn merged_factor_spans_both_intervals() {
        let seq = sequence();
        let settings = VioSettings::default();
        let mut mapper = LocalMapper::new(seq.camera, &settings, SharedState::new(true), OutputSinks::new());
        let trajectory = CircularTrajectory::default();
        let mut imu = ImuSimulator::ideal(200.0);
        let noise = ImuNoise::default();
        let times = [0.0, 0.3, 0.55, 0.9];
        for (k, w) in times.windows(2).enumerate() {
            let mut samples = vec![imu.sample(&trajectory, w[0])];
            samples.extend(imu.samples_between(&trajectory, w[0], w[1]));
            let preint = integrate_batch(&samples, w[0], w[1], ImuBias::zero(), &noise, 0.05).unwrap();
            mapper.imu_factors.push(ImuFactor::new(FrameId(k as u64), FrameId(k as u64 + 1), preint));
        }

        mapper.merge_imu_factors_around(FrameId(1));
        let spans: Vec<(u64, u64)> = mapper.imu_factors().iter().map(|f| (f.from.0, f.to.0)).collect();
        assert_eq!(spans, vec![(0, 2), (2, 3)]);
        let merged = &mapper.imu_factors()[0].preint;
        assert!((merged.dt - 0.55).abs() < 1e-9);

        // Same delta as integrating the whole interval at once.
        let mut samples = vec![imu.sample(&trajectory, 0.0)];
        samples.extend(imu.samples_between(&trajectory, 0.0, 0.55));
        let direct = integrate_batch(&samples, 0.0, 0.55, ImuBias::zero(), &noise, 0.05).unwrap();
        assert!((merged.delta_pos - direct.delta_pos).norm() < 1e-9);
        assert!(merged.delta_rot.angle_to(&direct.delta_rot) < 1e-9);

        // The last frame has no successor: its factor is simply dropped.
        mapper.merge_imu_factors_around(FrameId(3));
        assert_eq!(mapper.imu_factors().len(), 1);
    }

    #[test]
    fn outlier_points_stay_until_host_leaves() {
        let (mut mapper, _) = drive(60, |_, _| {});
        let ids = mapper.window().frame_ids();
        assert!(ids.len() >= 3);
        let newest = ids[ids.len() - 1];
        let host = ids[ids.len() - 2];
        let point = mapper
            .window()
            .points()
            .find(|p| p.is_active() && p.host == host)
            .map(|p| p.id)
            .expect("no active point in the second newest keyframe");
        assert!(mapper.window.point_mut(point).unwrap().set_status(PointStatus::Outlier));

        mapper.fold_stale_points(newest);
        assert_eq!(mapper.window().point(point).map(|p| p.status), Some(PointStatus::Outlier));

        // Leaves together with its host.
        mapper.marginalize_frame(host);
        assert!(mapper.window().point(point).is_none());
    }

    #[test]
    fn tracking_continues_after_a_mid_window_drop() {
        let capacity = VioSettings::default().window.capacity;
        let mut harness = Harness::new();
        harness.advance(60, |_, _| {});
        let ids = harness.mapper.window().frame_ids();
        assert!(ids.len() >= 4);
        let dropped = ids[ids.len() / 2];
        assert!(dropped != ids[0] && dropped != ids[ids.len() - 1]);

        harness.mapper.marginalize_frame(dropped);
        {
            let window = harness.mapper.window();
            assert!(window.frame(dropped).is_none());
            assert!(window.ids_strictly_increasing());
            assert!(window.points().all(|p| p.host != dropped && !p.has_residual_to(dropped)));
            assert!(harness.mapper.imu_factors().iter().all(|f| !f.touches(dropped)));
        }
        harness.tracker.refresh_reference();

        harness.advance(10, |mapper, outcome| {
            let window = mapper.window();
            assert!(window.len() <= capacity);
            assert!(window.ids_strictly_increasing());
            assert!(window.frame(dropped).is_none());
            assert!(!outcome.marginalized.contains(&dropped));
        });
        assert!(!harness.shared.is_lost());
        let poses = harness.recorder.poses();
        assert!(poses.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
        assert!(poses.iter().any(|p| p.frame_id >= FrameId(65)));
    }

    #[test]
    fn scale_commit_lands_inside_the_keyframe_step() {
        let mut harness = Harness::new();
        let committed = std::cell::Cell::new(false);
        for _ in 0..40 {
            harness.advance(10, |mapper, outcome| {
                if outcome.scale_committed {
                    assert!(!committed.get());
                    assert_eq!(mapper.shared.imu_init_state(), ImuInitState::Initialized);
                    assert_eq!(mapper.shared.world().epoch, mapper.world_epoch);
                    let reference = mapper.shared.tracking_reference().expect("no snapshot");
                    assert_eq!(reference.world_epoch, mapper.world_epoch);
                    committed.set(true);
                }
            });
            if committed.get() {
                break;
            }
        }
        assert!(committed.get(), "scale never committed");
    }
}
