//! Configuration consumed by the estimator.
//!
//! Every group deserializes with defaults for missing fields, so a YAML
//! file only needs the values it overrides.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::Deserialize;

use crate::frame::PixelSelectorSettings;
use crate::geometry::SE3;
use crate::imu::ImuNoise;
use crate::local_mapping::imu_init::InitializerSettings;
use crate::optimizer::bundle::SolverSettings;
use crate::tracking::bootstrap::BootstrapSettings;
use crate::tracking::coarse_tracker::TrackerSettings;
use crate::window::TraceSettings;

/// Active window and keyframe policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// Maximum number of keyframes in the window.
    pub capacity: usize,
    pub min_frames_between_keyframes: usize,
    /// A keyframe is forced after this many frames.
    pub max_frames_between_keyframes: usize,
    pub target_active_points: usize,
    pub immature_points_per_keyframe: usize,
    /// Translational flow threshold as a fraction of `width + height`.
    pub max_flow_t: f64,
    /// Full flow threshold as a fraction of `width + height`.
    pub max_flow_rt: f64,
    /// Threshold on `|ln a|` of the brightness transfer.
    pub max_brightness_change: f64,
    /// Fraction of reference points lost that forces a keyframe.
    pub max_lost_fraction: f64,
    /// Frames keeping fewer active points than this fraction are dropped.
    pub min_points_remaining: f64,
    /// Frames whose brightness changed more than this (`|ln a|`) are dropped.
    pub max_affine_change: f64,
    /// Activation requires at least this trace quality.
    pub activation_min_quality: f64,
    /// Activation requires a last trace interval shorter than this (px).
    pub activation_max_interval_px: f64,
    /// Weight of the gauge anchor on the first keyframe.
    pub anchor_weight: f64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            capacity: 7,
            min_frames_between_keyframes: 1,
            max_frames_between_keyframes: 10,
            target_active_points: 300,
            immature_points_per_keyframe: 400,
            max_flow_t: 0.02,
            max_flow_rt: 0.04,
            max_brightness_change: 0.5,
            max_lost_fraction: 0.5,
            min_points_remaining: 0.05,
            max_affine_change: 0.7,
            activation_min_quality: 1.5,
            activation_max_interval_px: 8.0,
            anchor_weight: 1e8,
        }
    }
}

/// Inertial fusion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImuSettings {
    /// When false the system runs image-only with unobservable scale.
    pub enabled: bool,
    pub noise: ImuNoise,
    /// Camera-from-IMU rotation as `[w, x, y, z]`.
    pub cam_from_imu_rotation: [f64; 4],
    /// Camera-from-IMU translation (m).
    pub cam_from_imu_translation: [f64; 3],
    /// Bias change that triggers re-integration of a factor.
    pub repropagation_threshold: f64,
    /// Largest tolerated spacing between samples (s).
    pub max_sample_gap: f64,
    /// Samples kept from malformed batches.
    pub max_carried_samples: usize,
    /// Weight of inertial residuals relative to photometric ones.
    pub factor_weight: f64,
}

impl Default for ImuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            noise: ImuNoise::default(),
            cam_from_imu_rotation: [1.0, 0.0, 0.0, 0.0],
            cam_from_imu_translation: [0.0; 3],
            repropagation_threshold: 0.01,
            max_sample_gap: 0.05,
            max_carried_samples: 4000,
            factor_weight: 1.0,
        }
    }
}

impl ImuSettings {
    /// `T_cam_imu`.
    pub fn t_cam_imu(&self) -> SE3 {
        let [w, x, y, z] = self.cam_from_imu_rotation;
        let [tx, ty, tz] = self.cam_from_imu_translation;
        SE3::new(UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)), Vector3::new(tx, ty, tz))
    }
}

/// Hand-off between the tracking and mapping threads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Frames queued for the mapping thread before backpressure.
    pub queue_capacity: usize,
    /// How long a full queue may block the caller before the oldest queued
    /// frame is dropped.
    pub send_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            send_timeout_ms: 50,
        }
    }
}

/// All settings of the estimator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VioSettings {
    pub window: WindowSettings,
    pub selector: PixelSelectorSettings,
    pub tracker: TrackerSettings,
    pub bootstrap: BootstrapSettings,
    pub trace: TraceSettings,
    pub solver: SolverSettings,
    pub imu: ImuSettings,
    pub initializer: InitializerSettings,
    pub pipeline: PipelineSettings,
}

impl VioSettings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: VioSettings = serde_yaml::from_str(yaml).context("parsing settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.window;
        ensure!(w.capacity >= 3, "window.capacity must be at least 3, got {}", w.capacity);
        ensure!(
            w.max_frames_between_keyframes >= 1 && w.min_frames_between_keyframes <= w.max_frames_between_keyframes,
            "keyframe spacing bounds are inconsistent ({}..{})",
            w.min_frames_between_keyframes,
            w.max_frames_between_keyframes
        );
        ensure!(w.target_active_points > 0, "window.target_active_points must be positive");
        ensure!(self.tracker.pyramid_levels >= 1, "tracker.pyramid_levels must be at least 1");
        ensure!(
            !self.tracker.iterations_per_level.is_empty(),
            "tracker.iterations_per_level must not be empty"
        );
        ensure!(
            (0.0..=1.0).contains(&self.tracker.min_valid_fraction),
            "tracker.min_valid_fraction must be in [0, 1]"
        );
        ensure!(self.tracker.max_lost_frames >= 1, "tracker.max_lost_frames must be at least 1");
        ensure!(self.solver.huber_k > 0.0, "solver.huber_k must be positive");
        ensure!(self.imu.max_sample_gap > 0.0, "imu.max_sample_gap must be positive");
        ensure!(self.pipeline.queue_capacity >= 1, "pipeline.queue_capacity must be at least 1");
        ensure!(
            self.initializer.timeout_keyframes > self.initializer.min_keyframes,
            "initializer.timeout_keyframes must exceed initializer.min_keyframes"
        );
        let q = self.imu.cam_from_imu_rotation;
        let norm = q.iter().map(|v| v * v).sum::<f64>().sqrt();
        ensure!((norm - 1.0).abs() < 1e-3, "imu.cam_from_imu_rotation must be a unit quaternion");
        Ok(())
    }
}
