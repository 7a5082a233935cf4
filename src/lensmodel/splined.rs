//! Splined stereographic model.
//!
//! A stereographic projection whose normalized coordinate is corrected by a
//! 2D uniform B-spline surface:
//!
//! ```text
//! u = stereographic(p)
//! v = u + Δu(u)
//! q = f∘v + c
//! ```
//!
//! `Δu` is defined by an `Nx × Ny` grid of 2D control points, stored row-major
//! after the core (`intrinsics[4 + 2·(iy·Nx + ix) + axis]`). The grid spans the
//! horizontal field of view `fov_x_deg` and is vertically centered with the
//! same knot spacing. Points outside the grid extrapolate from the edge
//! segment, so every direction still projects.
//!
//! Each pixel depends on only `(order+1)²` control points, which is what keeps
//! the calibration Jacobian sparse for grids with thousands of parameters.

use super::core_models::stereographic_normalize;
use super::{
    IntrinsicsGradient, LensModelError, LensModelResult, Projection, SplineGradient, apply_core,
};
use nalgebra::{Matrix2, Vector2, Vector3};
use std::fmt;

/// Configuration of a splined stereographic model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplineConfig {
    /// B-spline order: 2 (quadratic) or 3 (cubic)
    pub order: u16,
    /// Control points per row
    pub nx: u16,
    /// Control points per column
    pub ny: u16,
    /// Horizontal field of view covered by the grid, in degrees
    pub fov_x_deg: u16,
}

impl SplineConfig {
    pub fn new(order: u16, nx: u16, ny: u16, fov_x_deg: u16) -> LensModelResult<Self> {
        let config = Self {
            order,
            nx,
            ny,
            fov_x_deg,
        };
        config.validate().map_err(|reason| LensModelError::BadConfig {
            model: format!("LENSMODEL_SPLINED_STEREOGRAPHIC{config}"),
            reason,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.order != 2 && self.order != 3 {
            return Err(format!("order must be 2 or 3, got {}", self.order));
        }
        if self.nx <= self.order || self.ny <= self.order {
            return Err(format!(
                "a grid of order {} needs more than {} control points per axis, got {}x{}",
                self.order, self.order, self.nx, self.ny
            ));
        }
        if self.fov_x_deg == 0 || self.fov_x_deg >= 360 {
            return Err(format!(
                "fov_x_deg must be in (0, 360), got {}",
                self.fov_x_deg
            ));
        }
        Ok(())
    }

    /// Parse `_order=3_Nx=30_Ny=20_fov_x_deg=170`
    pub(super) fn parse(config: &str) -> Result<Self, String> {
        fn field<'a>(s: &'a str, key: &str) -> Result<(u16, &'a str), String> {
            let rest = s
                .strip_prefix('_')
                .and_then(|s| s.strip_prefix(key))
                .and_then(|s| s.strip_prefix('='))
                .ok_or_else(|| format!("expected '_{key}=<integer>'"))?;
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            let value = rest[..end]
                .parse()
                .map_err(|_| format!("'{key}' is not a valid integer"))?;
            Ok((value, &rest[end..]))
        }

        let (order, rest) = field(config, "order")?;
        let (nx, rest) = field(rest, "Nx")?;
        let (ny, rest) = field(rest, "Ny")?;
        let (fov_x_deg, rest) = field(rest, "fov_x_deg")?;
        if !rest.is_empty() {
            return Err(format!("unexpected trailing '{rest}'"));
        }
        let config = Self {
            order,
            nx,
            ny,
            fov_x_deg,
        };
        config.validate()?;
        Ok(config)
    }

    /// Number of control-point values: `2·Nx·Ny`
    pub fn num_control_params(&self) -> usize {
        2 * self.nx as usize * self.ny as usize
    }

    /// Stereographic radius at the horizontal edge of the field of view
    fn u_edge(&self) -> f64 {
        2.0 * (f64::from(self.fov_x_deg).to_radians() / 4.0).tan()
    }

    /// Knot spacing in normalized stereographic units
    pub fn knot_spacing(&self) -> f64 {
        2.0 * self.u_edge() / f64::from(self.nx - self.order)
    }

    /// Normalized stereographic positions `(ux, uy)` of the control-point
    /// columns and rows. Both are centered on the optical axis.
    pub fn knots(&self) -> (Vec<f64>, Vec<f64>) {
        let h = self.knot_spacing();
        let axis = |n: u16| {
            let center = f64::from(n - 1) / 2.0;
            (0..n).map(|i| (f64::from(i) - center) * h).collect()
        };
        (axis(self.nx), axis(self.ny))
    }
}

impl fmt::Display for SplineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "_order={}_Nx={}_Ny={}_fov_x_deg={}",
            self.order, self.nx, self.ny, self.fov_x_deg
        )
    }
}

/// Uniform B-spline basis weights and their derivatives at `t ∈ [0, 1)`
/// (extrapolation evaluates the edge segment outside that range)
fn basis(order: u16, t: f64) -> ([f64; 4], [f64; 4]) {
    if order == 3 {
        let t2 = t * t;
        let t3 = t2 * t;
        let s = 1.0 - t;
        (
            [
                s * s * s / 6.0,
                (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
                (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
                t3 / 6.0,
            ],
            [
                -0.5 * s * s,
                1.5 * t2 - 2.0 * t,
                -1.5 * t2 + t + 0.5,
                0.5 * t2,
            ],
        )
    } else {
        let s = 1.0 - t;
        (
            [0.5 * s * s, 0.5 * (-2.0 * t * t + 2.0 * t + 1.0), 0.5 * t * t, 0.0],
            [-s, 1.0 - 2.0 * t, t, 0.0],
        )
    }
}

/// Segment index and local coordinate along one axis
fn segment(s: f64, n: u16, order: u16) -> (usize, f64) {
    let last = f64::from(n - order - 1);
    let k = s.floor().clamp(0.0, last);
    (k as usize, s - k)
}

pub(super) fn project_splined(
    config: &SplineConfig,
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let (u, du_dp) = stereographic_normalize(p)?;
    let h = config.knot_spacing();
    let sx = (u.x + config.u_edge()) / h;
    let sy = u.y / h + f64::from(config.ny - config.order) / 2.0;
    if !sx.is_finite() || !sy.is_finite() {
        return None;
    }
    let (kx, tx) = segment(sx, config.nx, config.order);
    let (ky, ty) = segment(sy, config.ny, config.order);
    let (bx, dbx) = basis(config.order, tx);
    let (by, dby) = basis(config.order, ty);

    let width = config.order as usize + 1;
    let nx = config.nx as usize;
    let control = |ix: usize, iy: usize, axis: usize| intrinsics[4 + 2 * (iy * nx + ix) + axis];

    let mut delta = Vector2::zeros();
    let mut ddelta_du = Matrix2::zeros();
    let mut weights = Vec::with_capacity(if with_gradients { width * width } else { 0 });
    for j in 0..width {
        for i in 0..width {
            let w = by[j] * bx[i];
            let wx = by[j] * dbx[i] / h;
            let wy = dby[j] * bx[i] / h;
            for axis in 0..2 {
                let c = control(kx + i, ky + j, axis);
                delta[axis] += w * c;
                ddelta_du[(axis, 0)] += wx * c;
                ddelta_du[(axis, 1)] += wy * c;
            }
            if with_gradients {
                weights.push(w);
            }
        }
    }

    let v = u + delta;
    let dv_dp = (Matrix2::identity() + ddelta_du) * du_dp;
    let mut projection = apply_core(v, dv_dp, intrinsics, 4, with_gradients)?;
    if with_gradients {
        projection.dq_dintrinsics = IntrinsicsGradient::Splined(SplineGradient {
            dq_dfxy: v,
            fxy: Vector2::new(intrinsics[0], intrinsics[1]),
            ix0: kx,
            iy0: ky,
            width,
            weights,
            nx,
        });
    }
    Some(projection)
}
