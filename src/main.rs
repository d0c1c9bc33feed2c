use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_vio::imu::ImuNoise;
use rust_vio::io::{TrajectoryKind, TrajectoryWriter};
use rust_vio::simulation::{CircularTrajectory, ImuSimulator, SyntheticSequence, Trajectory};
use rust_vio::system::{TrajectoryRecorder, VioSettings, VioSystem};
use rust_vio::window::FrameId;

/// Usage: `rust_vio [frames] [settings.yaml] [trajectory.txt] [last_frame.png]`
///
/// Runs the estimator on a rendered circular flight through a textured
/// room and writes the estimated trajectory in TUM format.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let frames: u64 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("invalid frame count {n:?}"))?,
        None => 400,
    };
    let settings = match args.next() {
        Some(path) if path != "-" => VioSettings::from_yaml_file(&path)?,
        _ => VioSettings::default(),
    };
    let output = PathBuf::from(args.next().unwrap_or_else(|| "trajectory.txt".to_string()));
    let snapshot = args.next().map(PathBuf::from);

    let mut sequence = SyntheticSequence::new(
        SyntheticSequence::default_camera(),
        20.0,
        Box::new(CircularTrajectory::default()),
        ImuSimulator::noisy(200.0, ImuNoise::default(), 7),
    );

    let mut system = VioSystem::new(sequence.camera, settings)?;
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));
    system.register_sink(Box::new(TrajectoryWriter::new(&output, TrajectoryKind::AllFrames)));
    let keyframe_path = output.with_extension("keyframes.txt");
    system.register_sink(Box::new(TrajectoryWriter::new(&keyframe_path, TrajectoryKind::KeyframesOnly)));

    let mut resets = 0;
    let mut last_image = None;
    for i in 0..frames {
        let frame = sequence.frame(i);
        system.add_active_frame(&frame.image, FrameId(i), frame.imu.as_deref(), Some(frame.ground_truth))?;
        last_image = Some(frame.image);

        if system.init_failed() {
            resets += 1;
            warn!("Initialization failed at frame {}, resetting ({} so far)", i, resets);
            system.reset()?;
        }
        if system.is_lost() {
            warn!("Tracking lost at frame {}, stopping", i);
            break;
        }
        if i % 100 == 0 {
            info!(
                "Frame {}/{}: tracking {:?}, inertial {:?}",
                i,
                frames,
                system.tracking_state(),
                system.imu_init_state()
            );
        }
    }

    system.block_until_mapping_finished()?;

    let poses = recorder.poses();
    let truth = sequence.trajectory();
    if let (Some(first), Some(last)) = (poses.first(), poses.last()) {
        let est = (last.pose.translation - first.pose.translation).norm();
        let gt = (truth.pose(last.timestamp_s).translation - truth.pose(first.timestamp_s).translation).norm();
        info!(
            "{} poses ({} keyframes), scale corrected: {}, start-to-end distance {:.3} m (ground truth {:.3} m)",
            poses.len(),
            recorder.keyframe_poses().len(),
            last.scale_corrected,
            est,
            gt
        );
    }

    if let (Some(path), Some(image)) = (snapshot, last_image) {
        image
            .to_gray_image()
            .save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        info!("Last frame saved to {}", path.display());
    }

    system.shutdown();
    info!(
        "Done. Trajectory in {} and {}",
        output.display(),
        keyframe_path.display()
    );
    Ok(())
}
