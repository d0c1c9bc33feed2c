//! End-to-end runs of the threaded pipeline on rendered sequences.

use std::sync::Arc;

use parking_lot::Mutex;

use rust_vio::geometry::SE3;
use rust_vio::imu::ImuInitState;
use rust_vio::simulation::{CircularTrajectory, ImuSimulator, StaticTrajectory, SyntheticSequence, Trajectory};
use rust_vio::system::{OutputSink, PoseUpdate, TrajectoryRecorder, VioSettings, VioSystem};
use rust_vio::window::FrameId;

fn circle(imu: ImuSimulator) -> SyntheticSequence {
    SyntheticSequence::new(
        SyntheticSequence::default_camera(),
        20.0,
        Box::new(CircularTrajectory::default()),
        imu,
    )
}

/// Checks every published window snapshot.
#[derive(Clone, Default)]
struct WindowMonitor {
    inner: Arc<Mutex<MonitorState>>,
}

#[derive(Default)]
struct MonitorState {
    max_keyframes: usize,
    publications: usize,
    out_of_order: usize,
}

impl OutputSink for WindowMonitor {
    fn publish_poses(&mut self, poses: &[PoseUpdate]) {
        let mut state = self.inner.lock();
        let keyframes: Vec<FrameId> = poses.iter().filter(|p| p.is_keyframe).map(|p| p.frame_id).collect();
        state.max_keyframes = state.max_keyframes.max(keyframes.len());
        if keyframes.windows(2).any(|w| w[0] >= w[1]) {
            state.out_of_order += 1;
        }
        state.publications += 1;
    }
}

fn run(system: &mut VioSystem, sequence: &mut SyntheticSequence, frames: std::ops::Range<u64>) {
    for i in frames {
        let frame = sequence.frame(i);
        system
            .add_active_frame(&frame.image, FrameId(i), frame.imu.as_deref(), Some(frame.ground_truth))
            .unwrap();
    }
    system.block_until_mapping_finished().unwrap();
}

#[test]
fn window_stays_bounded_and_ordered() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let settings = VioSettings::default();
    let capacity = settings.window.capacity;
    let mut system = VioSystem::new(sequence.camera, settings).unwrap();
    let monitor = WindowMonitor::default();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(monitor.clone()));
    system.register_sink(Box::new(recorder.clone()));

    run(&mut system, &mut sequence, 0..120);

    assert!(!system.is_lost());
    let state = monitor.inner.lock();
    assert!(state.publications > 0);
    assert!(state.max_keyframes <= capacity);
    assert_eq!(state.out_of_order, 0);
    let poses = recorder.poses();
    assert!(poses.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
    assert!(recorder.keyframe_poses().len() > capacity);
    assert!(recorder.drains() >= 1);
}

#[test]
fn inertial_gaps_do_not_stop_tracking() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut system = VioSystem::new(sequence.camera, VioSettings::default()).unwrap();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));

    for i in 0..80u64 {
        let frame = sequence.frame(i);
        let imu = match i {
            // Missing batches.
            30..=32 => None,
            // A batch that stops short of the frame.
            40 => frame.imu.map(|mut s| {
                s.truncate(2);
                s
            }),
            // Timestamps out of order.
            50 => frame.imu.map(|mut s| {
                s.reverse();
                s
            }),
            _ => frame.imu,
        };
        system
            .add_active_frame(&frame.image, FrameId(i), imu.as_deref(), None)
            .unwrap();
    }
    system.block_until_mapping_finished().unwrap();

    assert!(!system.is_lost());
    let poses = recorder.poses();
    assert!(poses.iter().any(|p| p.frame_id > FrameId(55)));
}

#[test]
fn image_only_mode_tracks_without_scale() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut settings = VioSettings::default();
    settings.imu.enabled = false;
    let capacity = settings.window.capacity;
    let mut system = VioSystem::new(sequence.camera, settings).unwrap();
    let monitor = WindowMonitor::default();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(monitor.clone()));
    system.register_sink(Box::new(recorder.clone()));

    for i in 0..120u64 {
        let frame = sequence.frame(i);
        system.add_active_frame(&frame.image, FrameId(i), None, None).unwrap();
    }
    system.block_until_mapping_finished().unwrap();

    assert!(!system.is_lost());
    assert_eq!(system.imu_init_state(), ImuInitState::Disabled);
    let state = monitor.inner.lock();
    assert!(state.max_keyframes <= capacity);
    assert_eq!(state.out_of_order, 0);
    assert!(recorder.keyframe_poses().len() > capacity);
    assert!(recorder.poses().iter().all(|p| !p.scale_corrected));
    assert!(recorder.poses().iter().any(|p| p.frame_id > FrameId(100)));
}

#[test]
fn static_camera_never_bootstraps() {
    let pose = SE3::new(
        nalgebra::UnitQuaternion::from_euler_angles(0.05, -0.05, 0.0),
        nalgebra::Vector3::new(0.3, 0.1, 0.0),
    );
    let mut sequence = SyntheticSequence::new(
        SyntheticSequence::default_camera(),
        20.0,
        Box::new(StaticTrajectory { pose }),
        ImuSimulator::ideal(200.0),
    );
    let mut system = VioSystem::new(sequence.camera, VioSettings::default()).unwrap();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));

    run(&mut system, &mut sequence, 0..40);

    assert!(!system.is_lost());
    assert!(recorder.keyframe_poses().is_empty());
    assert_eq!(system.imu_init_state(), ImuInitState::NotInitialized);
}

#[test]
fn scale_is_recovered_on_a_circle() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut system = VioSystem::new(sequence.camera, VioSettings::default()).unwrap();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));

    let mut committed_at = None;
    for i in 0..400u64 {
        let frame = sequence.frame(i);
        system
            .add_active_frame(&frame.image, FrameId(i), frame.imu.as_deref(), None)
            .unwrap();
        if system.imu_init_state() == ImuInitState::Initialized {
            committed_at = Some(i);
            break;
        }
        assert!(!system.init_failed(), "initialization failed at frame {i}");
    }
    let committed_at = committed_at.expect("scale never committed");
    run(&mut system, &mut sequence, committed_at + 1..committed_at + 41);

    assert!(!system.is_lost());
    let keyframes: Vec<PoseUpdate> = recorder
        .keyframe_poses()
        .into_iter()
        .filter(|p| p.scale_corrected)
        .collect();
    assert!(keyframes.len() >= 3);
    let truth = sequence.trajectory();
    let (first, last) = (keyframes[0], keyframes[keyframes.len() - 1]);
    let estimated = (last.pose.translation - first.pose.translation).norm();
    let expected = (truth.pose(last.timestamp_s).translation - truth.pose(first.timestamp_s).translation).norm();
    assert!(expected > 0.1);
    let ratio = estimated / expected;
    assert!((0.8..1.25).contains(&ratio), "metric scale off: ratio {ratio:.3}");
}

#[test]
fn reset_keeps_sinks() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut system = VioSystem::new(sequence.camera, VioSettings::default()).unwrap();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));

    run(&mut system, &mut sequence, 0..40);
    assert!(!recorder.poses().is_empty());

    system.reset().unwrap();
    assert_eq!(recorder.resets(), 1);
    assert!(recorder.poses().is_empty());
    assert!(!system.init_failed());

    run(&mut system, &mut sequence, 40..80);
    let poses = recorder.poses();
    assert!(!poses.is_empty());
    assert!(poses.iter().all(|p| p.frame_id >= FrameId(40)));
}

#[test]
fn backlog_drops_frames_in_order() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut settings = VioSettings::default();
    settings.pipeline.queue_capacity = 1;
    settings.pipeline.send_timeout_ms = 0;
    let mut system = VioSystem::new(sequence.camera, settings).unwrap();
    let recorder = TrajectoryRecorder::new();
    system.register_sink(Box::new(recorder.clone()));

    run(&mut system, &mut sequence, 0..100);

    assert!(!system.is_lost());
    let poses = recorder.poses();
    assert!(poses.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
    assert!(poses.len() + system.frames_dropped() <= 100);
}

#[test]
#[should_panic(expected = "strictly increasing")]
fn repeated_frame_id_is_a_programming_error() {
    let mut sequence = circle(ImuSimulator::ideal(200.0));
    let mut system = VioSystem::new(sequence.camera, VioSettings::default()).unwrap();
    let frame = sequence.frame(0);
    system.add_active_frame(&frame.image, FrameId(5), None, None).unwrap();
    system.add_active_frame(&frame.image, FrameId(5), None, None).unwrap();
}
