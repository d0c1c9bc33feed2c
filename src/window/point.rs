//! Points hosted by keyframes and their status lifecycle.

use crate::frame::PyramidLevel;

use super::types::{FrameId, PointId};

/// Residual pattern: pixel offsets around the host pixel.
pub const PATTERN: [(i32, i32); PATTERN_LEN] = [
    (0, -2),
    (-1, -1),
    (1, -1),
    (-2, 0),
    (0, 0),
    (2, 0),
    (-1, 1),
    (0, 2),
];
pub const PATTERN_LEN: usize = 8;

/// Lifecycle of a point.
///
/// ```text
/// Immature ──► Active ──► Outlier
///    │            └─────► Marginalized
///    └──────────────────► Marginalized
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointStatus {
    /// Inverse depth only known as a 1-D search interval.
    Immature,
    /// Contributes residuals to the joint optimization.
    Active,
    /// Rejected; kept until its host leaves the window.
    Outlier,
    /// Folded into the prior or dropped.
    Marginalized,
}

impl PointStatus {
    pub fn can_transition_to(self, next: PointStatus) -> bool {
        use PointStatus::*;
        matches!(
            (self, next),
            (Immature, Active) | (Immature, Marginalized) | (Active, Outlier) | (Active, Marginalized)
        )
    }
}

/// Quality of a residual after the last linearization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualState {
    Inlier,
    Outlier,
    /// Projection left the target image.
    OutOfBounds,
}

/// One observation of a point in a non-host window frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residual {
    pub target: FrameId,
    pub state: ResidualState,
    pub energy: f64,
}

impl Residual {
    pub fn new(target: FrameId) -> Self {
        Self { target, state: ResidualState::Inlier, energy: 0.0 }
    }
}

/// A point anchored to its host frame.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: PointId,
    pub host: FrameId,
    /// Host pixel at level 0.
    pub u: f64,
    pub v: f64,
    /// Host intensities over the pattern.
    pub colors: [f32; PATTERN_LEN],
    /// Gradient-dependent weights `c² / (c² + |∇I|²)` over the pattern.
    pub weights: [f32; PATTERN_LEN],
    pub idepth: f64,
    /// Inverse-depth information from the last solve (0 when unknown).
    pub idepth_hessian: f64,
    /// Search interval of an immature point; `idepth_max` is infinite until
    /// the first successful trace.
    pub idepth_min: f64,
    pub idepth_max: f64,
    /// Ratio second-best / best matching energy of the last trace.
    pub quality: f64,
    /// Pixel length of the uncertainty interval after the last trace.
    pub trace_interval_px: f64,
    pub trace_failures: u32,
    pub status: PointStatus,
    pub residuals: Vec<Residual>,
}

impl Point {
    /// Samples the pattern around `(u, v)` on the host level-0 image; `None`
    /// if any pattern pixel lacks a gradient.
    pub fn new_immature(id: PointId, host: FrameId, level0: &PyramidLevel, u: f64, v: f64, grad_weight_c: f64) -> Option<Self> {
        let mut colors = [0.0f32; PATTERN_LEN];
        let mut weights = [0.0f32; PATTERN_LEN];
        let c2 = grad_weight_c * grad_weight_c;
        for (k, (dx, dy)) in PATTERN.iter().enumerate() {
            let [i, gx, gy] = level0.interpolate(u + *dx as f64, v + *dy as f64)?;
            colors[k] = i as f32;
            weights[k] = (c2 / (c2 + gx * gx + gy * gy)) as f32;
        }
        Some(Self {
            id,
            host,
            u,
            v,
            colors,
            weights,
            idepth: 1.0,
            idepth_hessian: 0.0,
            idepth_min: 0.0,
            idepth_max: f64::INFINITY,
            quality: 0.0,
            trace_interval_px: f64::INFINITY,
            trace_failures: 0,
            status: PointStatus::Immature,
            residuals: Vec::new(),
        })
    }

    /// Applies a status change if the lifecycle allows it.
    pub fn set_status(&mut self, next: PointStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == PointStatus::Active
    }

    /// Standard deviation of the inverse depth, infinite when unconstrained.
    pub fn idepth_sigma(&self) -> f64 {
        if self.idepth_hessian > 0.0 {
            1.0 / self.idepth_hessian.sqrt()
        } else {
            f64::INFINITY
        }
    }

    pub fn inlier_residuals(&self) -> impl Iterator<Item = &Residual> {
        self.residuals.iter().filter(|r| r.state == ResidualState::Inlier)
    }

    pub fn has_residual_to(&self, target: FrameId) -> bool {
        self.residuals.iter().any(|r| r.target == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ImageAndExposure, ImagePyramid};
    use PointStatus::*;

    #[test]
    fn only_lifecycle_transitions_are_reachable() {
        let all = [Immature, Active, Outlier, Marginalized];
        let allowed = [(Immature, Active), (Immature, Marginalized), (Active, Outlier), (Active, Marginalized)];
        for from in all {
            for to in all {
                assert_eq!(from.can_transition_to(to), allowed.contains(&(from, to)), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn set_status_refuses_illegal_moves() {
        let img = ImageAndExposure::new(32, 32, (0..1024).map(|i| (i % 32) as f32 * 3.0).collect(), 0.0).unwrap();
        let pyr = ImagePyramid::build(&img, 1);
        let mut p = Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 10.0, 10.0, 50.0).unwrap();
        assert!(!p.set_status(Outlier));
        assert!(p.set_status(Active));
        assert!(!p.set_status(Immature));
        assert!(p.set_status(Outlier));
        assert!(!p.set_status(Marginalized));
        assert_eq!(p.status, Outlier);
    }

    #[test]
    fn pattern_near_border_is_rejected() {
        let img = ImageAndExposure::new(32, 32, vec![10.0; 1024], 0.0).unwrap();
        let pyr = ImagePyramid::build(&img, 1);
        assert!(Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 2.0, 10.0, 50.0).is_none());
        assert!(Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 3.0, 10.0, 50.0).is_some());
    }
}
