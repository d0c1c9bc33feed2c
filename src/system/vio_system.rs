//! VIO System - main entry point and thread orchestration.
//!
//! The `VioSystem` is the top-level struct that users interact with. It
//! owns the shared state, runs tracking on the caller's thread and spawns
//! the mapping thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::frame::{CameraModel, ImageAndExposure};
use crate::geometry::SE3;
use crate::imu::{ImuInitState, ImuSample};
use crate::local_mapping::LocalMapper;
use crate::tracking::{Tracker, TrackerOutput, TrackingState};
use crate::window::FrameId;

use super::messages::MappingCommand;
use super::output::{OutputSink, OutputSinks};
use super::settings::VioSettings;
use super::shared_state::SharedState;

/// Main VIO system orchestrating tracking and mapping.
pub struct VioSystem {
    camera: CameraModel,
    settings: VioSettings,

    /// Shared state (snapshot, world alignment, flags).
    shared: Arc<SharedState>,

    /// The tracker runs in the caller's thread.
    tracker: Tracker,

    /// Registered output collaborators; survive resets.
    sinks: OutputSinks,

    /// Tracking -> mapping queue.
    sender: Sender<MappingCommand>,

    /// Second handle on the queue, used to evict the oldest frame when the
    /// mapping thread falls behind.
    backlog: Receiver<MappingCommand>,

    /// Handle to the mapping thread.
    mapping_handle: Option<JoinHandle<()>>,

    frames_dropped: usize,
}

impl VioSystem {
    /// Create a new system and spawn the mapping thread.
    pub fn new(camera: CameraModel, settings: VioSettings) -> Result<Self> {
        settings.validate().context("invalid settings")?;
        let sinks = OutputSinks::new();
        let shared = SharedState::new(settings.imu.enabled);
        let (sender, receiver) = bounded::<MappingCommand>(settings.pipeline.queue_capacity);
        let mapping_handle = Self::spawn_mapping(camera, &settings, shared.clone(), sinks.clone(), receiver.clone())?;
        let tracker = Tracker::new(camera, &settings, shared.clone());
        info!(
            "[VioSystem] started ({}x{}, inertial {})",
            camera.width,
            camera.height,
            if settings.imu.enabled { "on" } else { "off" }
        );
        Ok(Self {
            camera,
            settings,
            shared,
            tracker,
            sinks,
            sender,
            backlog: receiver,
            mapping_handle: Some(mapping_handle),
            frames_dropped: 0,
        })
    }

    fn spawn_mapping(
        camera: CameraModel,
        settings: &VioSettings,
        shared: Arc<SharedState>,
        sinks: OutputSinks,
        receiver: Receiver<MappingCommand>,
    ) -> Result<JoinHandle<()>> {
        let mut mapper = LocalMapper::new(camera, settings, shared, sinks);
        thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || mapper.run(receiver))
            .context("spawning the mapping thread")
    }

    /// Registers an output collaborator. It receives updates from the next
    /// accepted optimization on.
    pub fn register_sink(&self, sink: Box<dyn OutputSink>) {
        self.sinks.register(sink);
    }

    /// Process one frame.
    ///
    /// Tracking runs synchronously; the tracked frame is queued for the
    /// mapping thread. Frame ids must be strictly increasing.
    pub fn add_active_frame(
        &mut self,
        image: &ImageAndExposure,
        id: FrameId,
        imu: Option<&[ImuSample]>,
        ground_truth: Option<SE3>,
    ) -> Result<()> {
        if self.mapping_handle.is_none() {
            bail!("system has been shut down");
        }
        if self.shared.is_lost() {
            debug!("[VioSystem] lost, frame {} ignored", id);
            return Ok(());
        }
        let (result, output) = self.tracker.process_frame(id, image, imu, ground_truth);
        debug!(
            "[VioSystem] frame {}: {:?} rmse {:.2} ({:.1} ms)",
            id, result.state, result.metrics.rmse, result.metrics.total_ms
        );
        match output {
            TrackerOutput::Nothing => Ok(()),
            TrackerOutput::Frame(frame) => self.enqueue(MappingCommand::Frame(frame)),
            TrackerOutput::InitialMap(map) => {
                self.sender
                    .send(MappingCommand::InitialMap(map))
                    .map_err(|_| anyhow!("mapping thread is gone"))?;
                // Tracking cannot continue without the first snapshot.
                self.block_until_mapping_finished()?;
                self.tracker.refresh_reference();
                Ok(())
            }
        }
    }

    /// Queues a frame, evicting the oldest queued frame when the mapping
    /// thread does not make room in time.
    fn enqueue(&mut self, mut command: MappingCommand) -> Result<()> {
        let timeout = Duration::from_millis(self.settings.pipeline.send_timeout_ms);
        loop {
            match self.sender.send_timeout(command, timeout) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Disconnected(_)) => bail!("mapping thread is gone"),
                Err(SendTimeoutError::Timeout(back)) => {
                    command = back;
                    match self.backlog.try_recv() {
                        Ok(MappingCommand::Frame(old)) => {
                            self.frames_dropped += 1;
                            warn!(
                                "[VioSystem] mapping backlog, dropped frame {} ({} so far)",
                                old.id, self.frames_dropped
                            );
                            self.shared.push_imu_carry(old.id, old.imu_samples);
                        }
                        Ok(other) => {
                            // Control messages are always awaited before the
                            // next frame, so only frames can be queued here.
                            warn!("[VioSystem] unexpected control message in backlog, re-queued");
                            self.sender.send(other).map_err(|_| anyhow!("mapping thread is gone"))?;
                        }
                        // The mapper took one meanwhile.
                        Err(_) => {}
                    }
                }
            }
        }
    }

    /// Blocks until the mapping thread has processed everything queued so
    /// far and every sink has been drained.
    pub fn block_until_mapping_finished(&self) -> Result<()> {
        if self.mapping_handle.is_none() {
            return Ok(());
        }
        let (ack_tx, ack_rx) = bounded(1);
        self.sender
            .send(MappingCommand::Drain(ack_tx))
            .map_err(|_| anyhow!("mapping thread is gone"))?;
        ack_rx.recv().context("mapping thread exited before draining")
    }

    /// Discards the whole estimator state and starts over. Registered sinks
    /// are kept and told to reset.
    pub fn reset(&mut self) -> Result<()> {
        info!("[VioSystem] reset");
        self.stop_mapping();
        self.shared = SharedState::new(self.settings.imu.enabled);
        let (sender, receiver) = bounded::<MappingCommand>(self.settings.pipeline.queue_capacity);
        self.sinks.reset();
        self.mapping_handle = Some(Self::spawn_mapping(
            self.camera,
            &self.settings,
            self.shared.clone(),
            self.sinks.clone(),
            receiver.clone(),
        )?);
        self.sender = sender;
        self.backlog = receiver;
        self.tracker = Tracker::new(self.camera, &self.settings, self.shared.clone());
        self.frames_dropped = 0;
        Ok(())
    }

    /// Drains the queue and stops the mapping thread. Further frames are
    /// rejected.
    pub fn shutdown(&mut self) {
        if self.mapping_handle.is_none() {
            return;
        }
        self.stop_mapping();
        info!("[VioSystem] shut down ({} frames dropped)", self.frames_dropped);
    }

    fn stop_mapping(&mut self) {
        self.shared.request_shutdown();
        // Wakes the mapper if it is idle; the queue ahead is still processed.
        let _ = self.sender.send(MappingCommand::Shutdown);
        if let Some(handle) = self.mapping_handle.take() {
            if handle.join().is_err() {
                warn!("[VioSystem] mapping thread panicked");
            }
        }
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    pub fn init_failed(&self) -> bool {
        self.shared.init_failed()
    }

    pub fn imu_init_state(&self) -> ImuInitState {
        self.shared.imu_init_state()
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state
    }

    pub fn frames_dropped(&self) -> usize {
        self.frames_dropped
    }

    pub fn settings(&self) -> &VioSettings {
        &self.settings
    }
}

impl Drop for VioSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
