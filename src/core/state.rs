//! Physical calibration state: what the solver estimates.

use crate::geometry::Pose;
use nalgebra::{DVector, Vector2, Vector3};

/// Parabolic board deformation.
///
/// Corner `(i, j)` of a `W × H` board moves along the board normal by
///
/// ```text
/// dz = x2·4·xr·(1 − xr) + y2·4·yr·(1 − yr),  xr = i/(W − 1), yr = j/(H − 1)
/// ```
///
/// so the edges stay put and the center moves by `x2 + y2`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalobjectWarp {
    pub x2: f64,
    pub y2: f64,
}

impl CalobjectWarp {
    pub fn new(x2: f64, y2: f64) -> Self {
        Self { x2, y2 }
    }
}

/// A planar chessboard-style calibration object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationObject {
    /// Corners per row
    pub width: usize,
    /// Corners per column
    pub height: usize,
    /// Distance between adjacent corners
    pub spacing: f64,
}

impl CalibrationObject {
    pub fn new(width: usize, height: usize, spacing: f64) -> Self {
        Self {
            width,
            height,
            spacing,
        }
    }

    pub fn num_corners(&self) -> usize {
        self.width * self.height
    }

    /// `(∂z/∂x2, ∂z/∂y2)` at corner `(i, j)`
    pub fn warp_gradient(&self, i: usize, j: usize) -> Vector2<f64> {
        let parabola = |k: usize, n: usize| {
            if n < 2 {
                return 0.0;
            }
            let r = k as f64 / (n - 1) as f64;
            4.0 * r * (1.0 - r)
        };
        Vector2::new(parabola(i, self.width), parabola(j, self.height))
    }

    /// Position of corner `(i, j)` in the board frame
    pub fn corner(&self, i: usize, j: usize, warp: &CalobjectWarp) -> Vector3<f64> {
        let dz = self.warp_gradient(i, j);
        Vector3::new(
            i as f64 * self.spacing,
            j as f64 * self.spacing,
            warp.x2 * dz.x + warp.y2 * dz.y,
        )
    }
}

/// Everything the solver can estimate.
///
/// Intrinsics are indexed by [`CameraIndex::intrinsics`](crate::core::CameraIndex),
/// extrinsics by [`CameraIndex::extrinsics`](crate::core::CameraIndex). The
/// last `n_points_fixed` points of `points` are never modified.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationState {
    pub intrinsics: Vec<DVector<f64>>,
    /// `rt_cam_ref` of every non-reference camera
    pub extrinsics: Vec<Pose>,
    /// `rt_ref_frame` of every board pose
    pub frames: Vec<Pose>,
    /// Points in the reference frame
    pub points: Vec<Vector3<f64>>,
    pub n_points_fixed: usize,
    pub calobject_warp: CalobjectWarp,
}

impl CalibrationState {
    pub fn num_points_optimizable(&self) -> usize {
        self.points.len().saturating_sub(self.n_points_fixed)
    }
}
