//! Choosing which keyframe leaves the window.

use super::keyframe::KeyFrame;
use super::types::FrameId;
use super::window::ActiveWindow;

/// Frames younger than this (counted from the newest end) are never dropped.
pub const PROTECTED_NEWEST: usize = 2;

/// Metres of baseline one radian of relative rotation counts as.
pub const ROTATION_WEIGHT: f64 = 0.5;

/// Thresholds for dropping a frame before the window is full.
#[derive(Debug, Clone, Copy)]
pub struct DropPolicy {
    /// A frame keeping fewer than this fraction of the points it ever
    /// activated carries little information.
    pub min_points_remaining: f64,
    /// Frames whose relative log-exposure gain to the newest frame exceeds
    /// this are poorly comparable.
    pub max_affine_change: f64,
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self { min_points_remaining: 0.05, max_affine_change: 0.7 }
    }
}

/// Frames that should leave immediately, regardless of capacity: almost no
/// active points left, or a large brightness change to the newest frame.
pub fn frames_to_flag(window: &ActiveWindow, policy: &DropPolicy) -> Vec<FrameId> {
    let frames = window.frames();
    if frames.len() <= PROTECTED_NEWEST + 1 {
        return Vec::new();
    }
    let Some(newest) = frames.last() else {
        return Vec::new();
    };
    let mut flagged = Vec::new();
    for frame in &frames[..frames.len() - PROTECTED_NEWEST] {
        // Never leave fewer than PROTECTED_NEWEST + 1 frames.
        if frames.len() - flagged.len() <= PROTECTED_NEWEST + 1 {
            break;
        }
        let active = window.active_hosted(frame.id);
        let starved = frame.activated_count > 0
            && (active as f64) < policy.min_points_remaining * frame.activated_count as f64;
        let (scale, _) = super::keyframe::AffineLight::relative(
            &frame.state.affine,
            frame.exposure(),
            &newest.state.affine,
            newest.exposure(),
        );
        let dark = scale.ln().abs() > policy.max_affine_change;
        if starved || dark {
            flagged.push(frame.id);
        }
    }
    flagged
}

/// Picks the frame to drop from a full window.
///
/// Scores each candidate by how redundant it is with the rest of the window
/// and how far it is from the newest frame:
/// `score(i) = sqrt(d(i, newest)) · Σ_j 1 / (d(i, j) + ε)`. The largest score
/// loses. The newest [`PROTECTED_NEWEST`] frames are never candidates.
///
/// `d` is the relative baseline plus [`ROTATION_WEIGHT`] times the relative
/// rotation angle, so a frame that turned in place still counts as a
/// distinct view.
pub fn select_frame_to_drop(frames: &[KeyFrame]) -> Option<FrameId> {
    if frames.len() <= PROTECTED_NEWEST {
        return None;
    }
    let newest = frames.last()?;
    let candidates = &frames[..frames.len() - PROTECTED_NEWEST];
    let mut best: Option<(FrameId, f64)> = None;
    for frame in candidates {
        let to_newest = distance(frame, newest);
        let mut redundancy = 0.0;
        for other in &frames[..frames.len() - 1] {
            if other.id == frame.id {
                continue;
            }
            redundancy += 1.0 / (distance(frame, other) + 1e-5);
        }
        let score = to_newest.sqrt() * redundancy;
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((frame.id, score));
        }
    }
    best.map(|(id, _)| id)
}

fn distance(a: &KeyFrame, b: &KeyFrame) -> f64 {
    let rel = a.state.pose.inverse().compose(&b.state.pose);
    rel.translation.norm() + ROTATION_WEIGHT * rel.rotation.angle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::frame::{ImageAndExposure, ImagePyramid};
    use crate::geometry::SE3;
    use crate::window::keyframe::FrameState;

    fn keyframe(id: u64, x: f64) -> KeyFrame {
        let img = ImageAndExposure::new(32, 32, vec![100.0; 1024], 0.0).unwrap();
        KeyFrame::new(
            FrameId(id),
            id as f64,
            Arc::new(ImagePyramid::build(&img, 1)),
            FrameState::new(SE3::from_translation(Vector3::new(x, 0.0, 0.0))),
        )
    }

    #[test]
    fn never_drops_the_newest_two() {
        let frames: Vec<_> = (0..4).map(|i| keyframe(i, i as f64)).collect();
        let chosen = select_frame_to_drop(&frames).unwrap();
        assert!(chosen < FrameId(2));
        assert!(select_frame_to_drop(&frames[..2]).is_none());
    }

    #[test]
    fn prefers_near_duplicate_view() {
        // Frame 1 nearly coincides with frame 0; one of them is redundant.
        let xs = [0.0, 0.01, 1.0, 2.0, 3.0, 4.0];
        let frames: Vec<_> = xs.iter().enumerate().map(|(i, x)| keyframe(i as u64, *x)).collect();
        let chosen = select_frame_to_drop(&frames).unwrap();
        assert!(chosen == FrameId(0) || chosen == FrameId(1));
    }

    #[test]
    fn rotation_in_place_is_a_distinct_view() {
        let a = keyframe(0, 0.0);
        let mut turned = keyframe(1, 0.0);
        turned.state.pose.rotation = UnitQuaternion::from_euler_angles(0.0, 0.6, 0.0);
        assert_relative_eq!(distance(&a, &turned), ROTATION_WEIGHT * 0.6, epsilon = 1e-9);
        assert_relative_eq!(distance(&a, &keyframe(2, 0.5)), 0.5, epsilon = 1e-9);

        // Co-located but turned away: the unturned near-duplicate goes.
        let mut frames = vec![keyframe(0, 0.0), turned, keyframe(2, 0.01)];
        frames.extend((3..6).map(|i| keyframe(i, i as f64)));
        frames[1].state.pose.translation.x = 0.01;
        let chosen = select_frame_to_drop(&frames).unwrap();
        assert!(chosen == FrameId(0) || chosen == FrameId(2));
    }

    #[test]
    fn flags_dark_frames() {
        let mut window = ActiveWindow::new(6);
        for i in 0..5 {
            let mut kf = keyframe(i, i as f64);
            if i == 1 {
                kf.state.affine.a = 2.0;
            }
            window.insert_frame(kf);
        }
        assert_eq!(frames_to_flag(&window, &DropPolicy::default()), vec![FrameId(1)]);
    }
}
