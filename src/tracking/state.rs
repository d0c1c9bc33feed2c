//! Tracking state machine.

/// State of the tracking front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Waiting for the first frame.
    #[default]
    NotInitialized,
    /// Monocular bootstrap in progress; no map yet.
    Initializing,
    /// Tracking against the latest keyframe snapshot.
    Ok,
    /// The last frame(s) failed; recovery hypotheses are tried.
    RecentlyLost,
    /// Too many consecutive failures. Terminal for this run.
    Lost,
}

impl TrackingState {
    pub fn is_tracking(self) -> bool {
        matches!(self, TrackingState::Ok | TrackingState::RecentlyLost)
    }
}
