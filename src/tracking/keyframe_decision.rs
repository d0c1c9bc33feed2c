//! Keyframe admission policy.
//!
//! A tracked frame becomes a keyframe when the image has moved enough
//! relative to the reference keyframe: the weighted sum of translational
//! flow, full flow and brightness change exceeds one, or too many reference
//! points were lost. The decision is bounded by a minimum and a maximum
//! number of frames between keyframes.

use crate::system::settings::WindowSettings;

use super::result::FlowIndicators;

pub struct KeyFrameDecision {
    /// Minimum frames between keyframes.
    min_frames: usize,
    /// A keyframe is forced after this many frames.
    max_frames: usize,
    /// Flow thresholds as fractions of `width + height`.
    max_flow_t: f64,
    max_flow_rt: f64,
    max_brightness_change: f64,
    max_lost_fraction: f64,
    /// Frame counter since last keyframe.
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new(settings: &WindowSettings) -> Self {
        Self {
            min_frames: settings.min_frames_between_keyframes,
            max_frames: settings.max_frames_between_keyframes.max(1),
            max_flow_t: settings.max_flow_t,
            max_flow_rt: settings.max_flow_rt,
            max_brightness_change: settings.max_brightness_change,
            max_lost_fraction: settings.max_lost_fraction,
            frames_since_kf: 0,
        }
    }

    /// Motion score; values above one ask for a keyframe.
    pub fn score(&self, indicators: &FlowIndicators, image_size: f64) -> f64 {
        indicators.flow_t / image_size / self.max_flow_t
            + indicators.flow_rt / image_size / self.max_flow_rt
            + indicators.brightness / self.max_brightness_change
    }

    /// Decide whether the frame described by `indicators` becomes a
    /// keyframe. `image_size` is `width + height` of the finest level.
    pub fn should_create_keyframe(&mut self, indicators: &FlowIndicators, image_size: f64) -> bool {
        self.frames_since_kf += 1;

        if self.frames_since_kf >= self.max_frames {
            self.frames_since_kf = 0;
            return true;
        }

        if self.frames_since_kf < self.min_frames {
            return false;
        }

        let lost = 1.0 - indicators.valid_fraction > self.max_lost_fraction;
        if lost || self.score(indicators, image_size) > 1.0 {
            self.frames_since_kf = 0;
            return true;
        }

        false
    }

    /// Reset after keyframe creation outside the policy.
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators(flow_t: f64) -> FlowIndicators {
        FlowIndicators {
            flow_t,
            flow_rt: flow_t,
            brightness: 0.0,
            valid_fraction: 1.0,
        }
    }

    #[test]
    fn respects_spacing_bounds() {
        let settings = WindowSettings {
            min_frames_between_keyframes: 2,
            max_frames_between_keyframes: 5,
            ..WindowSettings::default()
        };
        let mut decision = KeyFrameDecision::new(&settings);
        // Large flow is ignored on the first frame after a keyframe.
        assert!(!decision.should_create_keyframe(&indicators(100.0), 280.0));
        assert!(decision.should_create_keyframe(&indicators(100.0), 280.0));

        // Without motion, a keyframe is forced after max_frames.
        let forced = (0..5).filter(|_| decision.should_create_keyframe(&indicators(0.0), 280.0)).count();
        assert_eq!(forced, 1);
    }

    #[test]
    fn lost_points_trigger_keyframe() {
        let mut decision = KeyFrameDecision::new(&WindowSettings::default());
        let mut ind = indicators(0.0);
        ind.valid_fraction = 0.3;
        assert!(decision.should_create_keyframe(&ind, 280.0));
    }
}
