//! Lifecycle of the inertial part of the estimator.

/// Where the estimator stands with respect to inertial fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImuInitState {
    /// Inertial fusion disabled by configuration; scale stays unobservable.
    Disabled,
    /// Visual-only operation while the delayed initializer gathers keyframes.
    #[default]
    NotInitialized,
    /// Scale and gravity committed; joint visual-inertial operation.
    Initialized,
    /// Initializer timed out; visual-only fallback until reset.
    Failed,
}

impl ImuInitState {
    pub fn is_initialized(self) -> bool {
        matches!(self, ImuInitState::Initialized)
    }
}
