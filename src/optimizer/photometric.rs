//! Photometric residuals between a host keyframe and a target frame.
//!
//! A point hosted at pixel `(u, v)` with inverse depth `ρ` is warped into
//! the target at the pattern centre; the pattern offsets are then applied in
//! target pixel space. Per pattern pixel:
//!
//! ```text
//! r = I_t(π(p_t) + o_k) - a_ht · (c_k - b_h) - b_t
//! a_ht = (t_t e^{a_t}) / (t_h e^{a_h})
//! ```
//!
//! Geometric Jacobians are evaluated at the frames' linearization states so
//! that frames connected to the marginalization prior keep consistent
//! Jacobians; image gradients and residuals use the current estimate.

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, SVector, Vector2, Vector3};

use crate::frame::{CameraModel, ImagePyramid};
use crate::geometry::skew;
use crate::window::keyframe::{AffineLight, FrameState, KeyFrame, PHOTO_DIM};
use crate::window::point::{Point, PATTERN, PATTERN_LEN};

/// 8-dim pose + affine block of one frame.
pub type PhotoVector = SVector<f64, PHOTO_DIM>;
pub type PatternJacobian = SMatrix<f64, PATTERN_LEN, PHOTO_DIM>;

/// Border kept free around a projected pattern centre.
const PROJECTION_MARGIN: f64 = 3.0;

/// Read-only view of a frame taking part in a residual.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub state: &'a FrameState,
    pub linearization: &'a FrameState,
    pub pyramid: &'a ImagePyramid,
}

impl<'a> FrameView<'a> {
    pub fn of(keyframe: &'a KeyFrame) -> Self {
        Self {
            state: &keyframe.state,
            linearization: keyframe.linearization_state(),
            pyramid: &keyframe.pyramid,
        }
    }

    /// View whose Jacobians are taken at the current state.
    pub fn current(state: &'a FrameState, pyramid: &'a ImagePyramid) -> Self {
        Self { state, linearization: state, pyramid }
    }

    #[inline]
    pub fn exposure(&self) -> f64 {
        self.pyramid.exposure_time
    }
}

/// Huber cost `ρ(r)`, equal to `r²` inside `[-k, k]`.
#[inline]
pub fn huber_energy(r: f64, k: f64) -> f64 {
    let a = r.abs();
    if a <= k {
        r * r
    } else {
        k * (2.0 * a - k)
    }
}

/// IRLS weight making `w r²` match [`huber_energy`] to first order.
#[inline]
pub fn huber_weight(r: f64, k: f64) -> f64 {
    let a = r.abs();
    if a <= k {
        1.0
    } else {
        k / a
    }
}

/// Adds an 8×8 pose-affine block into a dense frame system.
#[inline]
pub fn add_block(target: &mut DMatrix<f64>, row: usize, col: usize, block: &SMatrix<f64, PHOTO_DIM, PHOTO_DIM>) {
    let mut view = target.fixed_view_mut::<PHOTO_DIM, PHOTO_DIM>(row, col);
    view += block;
}

#[inline]
pub fn add_rows(target: &mut DVector<f64>, row: usize, rows: &PhotoVector) {
    let mut view = target.fixed_rows_mut::<PHOTO_DIM>(row);
    view += rows;
}

/// Linearized residual block of one point in one target.
#[derive(Debug, Clone)]
pub struct ResidualLinearization {
    pub residuals: SVector<f64, PATTERN_LEN>,
    /// Combined robust and gradient weights.
    pub weights: SVector<f64, PATTERN_LEN>,
    pub j_host: PatternJacobian,
    pub j_target: PatternJacobian,
    pub j_idepth: SVector<f64, PATTERN_LEN>,
    pub energy: f64,
    /// Projected pattern centre in the target (level 0).
    pub center: Vector2<f64>,
}

/// Normal-equation blocks of one residual, host first.
#[derive(Debug, Clone)]
pub struct NormalBlocks {
    pub host_host: SMatrix<f64, PHOTO_DIM, PHOTO_DIM>,
    pub host_target: SMatrix<f64, PHOTO_DIM, PHOTO_DIM>,
    pub target_target: SMatrix<f64, PHOTO_DIM, PHOTO_DIM>,
    pub b_host: PhotoVector,
    pub b_target: PhotoVector,
    /// Frame-to-inverse-depth coupling.
    pub host_idepth: PhotoVector,
    pub target_idepth: PhotoVector,
    pub idepth_idepth: f64,
    pub b_idepth: f64,
}

impl ResidualLinearization {
    pub fn normal_blocks(&self) -> NormalBlocks {
        let w = SMatrix::<f64, PATTERN_LEN, PATTERN_LEN>::from_diagonal(&self.weights);
        let wr = w * self.residuals;
        let wj = w * self.j_idepth;
        let jh_t = self.j_host.transpose();
        let jt_t = self.j_target.transpose();
        let (idepth_idepth, b_idepth) = self.idepth_terms();
        NormalBlocks {
            host_host: jh_t * w * self.j_host,
            host_target: jh_t * w * self.j_target,
            target_target: jt_t * w * self.j_target,
            b_host: jh_t * wr,
            b_target: jt_t * wr,
            host_idepth: jh_t * wj,
            target_idepth: jt_t * wj,
            idepth_idepth,
            b_idepth,
        }
    }

    /// `(h_ρρ, b_ρ)` contributions of this block.
    pub fn idepth_terms(&self) -> (f64, f64) {
        let mut h = 0.0;
        let mut b = 0.0;
        for k in 0..PATTERN_LEN {
            let w = self.weights[k];
            h += w * self.j_idepth[k] * self.j_idepth[k];
            b += w * self.j_idepth[k] * self.residuals[k];
        }
        (h, b)
    }
}

struct Warp {
    center: Vector2<f64>,
    p_target: Vector3<f64>,
}

fn warp(point: &Point, idepth: f64, host: &FrameState, target: &FrameState, camera: &CameraModel) -> Option<Warp> {
    if !(idepth > 0.0) || !idepth.is_finite() {
        return None;
    }
    let p_host = camera.unproject(point.u, point.v) / idepth;
    let world = host.pose.transform_point(&p_host);
    let p_target = target.pose.inverse().transform_point(&world);
    let center = camera.project(&p_target)?;
    if !camera.in_bounds(&center, PROJECTION_MARGIN) {
        return None;
    }
    Some(Warp { center, p_target })
}

/// Photometric energy of `point` (at `idepth`) in `target`; `None` when the
/// projection leaves the image or lands behind the camera.
pub fn point_energy(
    point: &Point,
    idepth: f64,
    host: &FrameView,
    target: &FrameView,
    camera: &CameraModel,
    huber_k: f64,
) -> Option<f64> {
    let w = warp(point, idepth, host.state, target.state, camera)?;
    let (scale, offset) = AffineLight::relative(&host.state.affine, host.exposure(), &target.state.affine, target.exposure());
    let level = target.pyramid.level(0);
    let mut energy = 0.0;
    for (k, (dx, dy)) in PATTERN.iter().enumerate() {
        let [i, _, _] = level.interpolate(w.center.x + *dx as f64, w.center.y + *dy as f64)?;
        let r = i - (scale * point.colors[k] as f64 + offset);
        energy += point.weights[k] as f64 * huber_energy(r, huber_k);
    }
    Some(energy)
}

/// Linearizes the residual block of `point` in `target`.
pub fn linearize(
    point: &Point,
    idepth: f64,
    host: &FrameView,
    target: &FrameView,
    camera: &CameraModel,
    huber_k: f64,
) -> Option<ResidualLinearization> {
    let current = warp(point, idepth, host.state, target.state, camera)?;

    // Geometry at the linearization states.
    let h_lin = host.linearization;
    let t_lin = target.linearization;
    let bearing = camera.unproject(point.u, point.v);
    let p_host = bearing / idepth;
    let r_h = h_lin.pose.rotation_matrix();
    let r_t = t_lin.pose.rotation_matrix();
    let r_t_inv = r_t.transpose();
    let p_t_lin = r_t_inv * (r_h * p_host + h_lin.pose.translation - t_lin.pose.translation);
    if p_t_lin.z <= 1e-9 {
        return None;
    }
    let d_uv_d_p = camera.projection_jacobian(&p_t_lin);

    let d_p_d_th: Matrix3<f64> = r_t_inv;
    let d_p_d_rh: Matrix3<f64> = -r_t_inv * r_h * skew(&p_host);
    let d_p_d_tt: Matrix3<f64> = -r_t_inv;
    let d_p_d_rt: Matrix3<f64> = skew(&p_t_lin);
    let d_p_d_rho: Vector3<f64> = -r_t_inv * r_h * bearing / (idepth * idepth);

    let d_uv_th = d_uv_d_p * d_p_d_th;
    let d_uv_rh = d_uv_d_p * d_p_d_rh;
    let d_uv_tt = d_uv_d_p * d_p_d_tt;
    let d_uv_rt = d_uv_d_p * d_p_d_rt;
    let d_uv_rho = d_uv_d_p * d_p_d_rho;

    let (scale, offset) = AffineLight::relative(&host.state.affine, host.exposure(), &target.state.affine, target.exposure());
    let level = target.pyramid.level(0);

    let mut out = ResidualLinearization {
        residuals: SVector::zeros(),
        weights: SVector::zeros(),
        j_host: PatternJacobian::zeros(),
        j_target: PatternJacobian::zeros(),
        j_idepth: SVector::zeros(),
        energy: 0.0,
        center: current.center,
    };

    for (k, (dx, dy)) in PATTERN.iter().enumerate() {
        let [i, gx, gy] = level.interpolate(current.center.x + *dx as f64, current.center.y + *dy as f64)?;
        let c = point.colors[k] as f64;
        let r = i - (scale * c + offset);
        let grad_w = point.weights[k] as f64;
        let grad = nalgebra::RowVector2::new(gx, gy);

        let j_th = grad * d_uv_th;
        let j_rh = grad * d_uv_rh;
        let j_tt = grad * d_uv_tt;
        let j_rt = grad * d_uv_rt;
        for a in 0..3 {
            out.j_host[(k, a)] = j_th[a];
            out.j_host[(k, 3 + a)] = j_rh[a];
            out.j_target[(k, a)] = j_tt[a];
            out.j_target[(k, 3 + a)] = j_rt[a];
        }
        let shaded = scale * (c - host.state.affine.b);
        out.j_host[(k, 6)] = shaded;
        out.j_host[(k, 7)] = scale;
        out.j_target[(k, 6)] = -shaded;
        out.j_target[(k, 7)] = -1.0;
        out.j_idepth[k] = (grad * d_uv_rho)[0];

        out.residuals[k] = r;
        out.weights[k] = grad_w * huber_weight(r, huber_k);
        out.energy += grad_w * huber_energy(r, huber_k);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageAndExposure;
    use crate::geometry::SE3;
    use crate::window::keyframe::{FrameVector, AFFINE, ROT, TRANS};
    use crate::window::types::{FrameId, PointId};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn textured(width: usize, height: usize) -> ImagePyramid {
        let data = (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| {
                    let (x, y) = (x as f32, y as f32);
                    100.0 + 40.0 * (0.05 * x).sin() + 35.0 * (0.04 * y + 0.3 * (0.03 * x).cos()).sin()
                })
            })
            .collect();
        ImagePyramid::build(&ImageAndExposure::new(width, height, data, 0.0).unwrap(), 1)
    }

    fn camera() -> CameraModel {
        CameraModel::new(120.0, 120.0, 80.0, 60.0, 160, 120)
    }

    #[test]
    fn identical_frames_give_zero_residual() {
        let pyr = textured(160, 120);
        let state = FrameState::new(SE3::identity());
        let point = Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 70.0, 50.0, 50.0).unwrap();
        let host = FrameView::current(&state, &pyr);
        let lin = linearize(&point, 0.5, &host, &host, &camera(), 9.0).unwrap();
        assert_relative_eq!(lin.energy, 0.0, epsilon = 1e-6);
        assert!(lin.j_idepth.iter().all(|j| j.abs() < 1e-9));
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let pyr = textured(160, 120);
        let host_state = FrameState::new(SE3::identity());
        let target_state = FrameState {
            pose: SE3::new(UnitQuaternion::from_euler_angles(0.01, -0.02, 0.005), Vector3::new(0.05, -0.02, 0.03)),
            ..FrameState::new(SE3::identity())
        };
        let point = Point::new_immature(PointId(0), FrameId(0), &pyr.levels[0], 75.0, 55.0, 50.0).unwrap();
        let cam = camera();
        let k = 1e6;
        let idepth = 0.4;
        let host = FrameView::current(&host_state, &pyr);
        let target = FrameView::current(&target_state, &pyr);
        let lin = linearize(&point, idepth, &host, &target, &cam, k).unwrap();

        let residuals = |h: &FrameState, t: &FrameState, rho: f64| -> SVector<f64, PATTERN_LEN> {
            let l = linearize(&point, rho, &FrameView::current(h, &pyr), &FrameView::current(t, &pyr), &cam, k).unwrap();
            l.residuals
        };
        // Bilinear sampling makes the image derivative piecewise constant, so
        // compare against a tolerance relative to each column's magnitude.
        let close = |analytic: &[f64], numeric: &[f64]| {
            let scale = analytic.iter().chain(numeric).fold(0.0f64, |m, v| m.max(v.abs()));
            analytic
                .iter()
                .zip(numeric)
                .all(|(a, n)| (a - n).abs() <= 0.15 * scale + 1e-3)
        };
        let eps = 1e-6;
        for dim in [TRANS, TRANS + 2, ROT, ROT + 1, AFFINE, AFFINE + 1] {
            let mut d = FrameVector::zeros();
            d[dim] = eps;
            let plus = residuals(&host_state, &target_state.retract(&d), idepth);
            let minus = residuals(&host_state, &target_state.retract(&(-d)), idepth);
            let numeric = (plus - minus) / (2.0 * eps);
            let analytic: Vec<f64> = lin.j_target.column(dim).iter().copied().collect();
            assert!(close(&analytic, numeric.as_slice()), "target dim {dim}: {analytic:?} vs {numeric:?}");

            let plus = residuals(&host_state.retract(&d), &target_state, idepth);
            let minus = residuals(&host_state.retract(&(-d)), &target_state, idepth);
            let numeric = (plus - minus) / (2.0 * eps);
            let analytic: Vec<f64> = lin.j_host.column(dim).iter().copied().collect();
            assert!(close(&analytic, numeric.as_slice()), "host dim {dim}: {analytic:?} vs {numeric:?}");
        }
        let plus = residuals(&host_state, &target_state, idepth + eps);
        let minus = residuals(&host_state, &target_state, idepth - eps);
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(close(lin.j_idepth.as_slice(), numeric.as_slice()));
    }

    #[test]
    fn huber_is_continuous_at_threshold() {
        assert_relative_eq!(huber_energy(3.0, 3.0), 9.0);
        assert_relative_eq!(huber_energy(3.0 + 1e-9, 3.0), 9.0, epsilon = 1e-6);
        assert_relative_eq!(huber_weight(6.0, 3.0), 0.5);
    }
}
