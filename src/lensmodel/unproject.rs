//! Unprojection: pixel to camera-frame direction.
//!
//! Core-only models invert in closed form. Everything else runs Newton's
//! method in the 2D normalized coordinate of the model's base projection
//! (pinhole for OpenCV and CAHVOR, stereographic for the splined model),
//! using the analytic `∂q/∂p` of the forward projection.

use super::LensModel;
use super::core_models::{self, normalized_from_pixel, stereographic_direction};
use crate::linalg::kernels::solve2;
use nalgebra::{Matrix3x2, Vector2, Vector3};

const MAX_ITERATIONS: usize = 50;
const MAX_BACKTRACKS: usize = 10;
/// Pixel reprojection error at which the iteration stops
const PIXEL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
enum Base {
    Pinhole,
    Stereographic,
}

impl Base {
    fn direction(self, u: &Vector2<f64>) -> Vector3<f64> {
        match self {
            Base::Pinhole => Vector3::new(u.x, u.y, 1.0),
            Base::Stereographic => stereographic_direction(u),
        }
    }

    fn jacobian(self, u: &Vector2<f64>) -> Matrix3x2<f64> {
        match self {
            Base::Pinhole => Matrix3x2::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            Base::Stereographic => Matrix3x2::new(4.0, 0.0, 0.0, 4.0, -2.0 * u.x, -2.0 * u.y),
        }
    }
}

pub(super) fn unproject(
    model: &LensModel,
    q: &Vector2<f64>,
    intrinsics: &[f64],
) -> Option<Vector3<f64>> {
    let base = match model {
        LensModel::Pinhole => return Some(core_models::unproject_pinhole(q, intrinsics)),
        LensModel::Stereographic => {
            return Some(core_models::unproject_stereographic(q, intrinsics));
        }
        LensModel::LonLat => return Some(core_models::unproject_lonlat(q, intrinsics)),
        LensModel::LatLon => return Some(core_models::unproject_latlon(q, intrinsics)),
        LensModel::SplinedStereographic(_) => Base::Stereographic,
        _ => Base::Pinhole,
    };

    let mut u = normalized_from_pixel(q, intrinsics);
    let residual = |u: &Vector2<f64>| -> Option<Vector2<f64>> {
        model
            .project(&base.direction(u), intrinsics)
            .map(|projected| projected - q)
    };
    let mut error = residual(&u)?;

    for _ in 0..MAX_ITERATIONS {
        if error.norm() < PIXEL_TOLERANCE {
            return Some(base.direction(&u));
        }
        let projection = model.project_with_gradients(&base.direction(&u), intrinsics)?;
        let jacobian = projection.dq_dp * base.jacobian(&u);
        let step = solve2(&jacobian, &error)?;

        // Backtrack when a full Newton step overshoots
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let candidate = u - step * scale;
            if let Some(candidate_error) = residual(&candidate)
                && candidate_error.norm() < error.norm()
            {
                accepted = Some((candidate, candidate_error));
                break;
            }
            scale *= 0.5;
        }
        let (next_u, next_error) = accepted?;
        u = next_u;
        error = next_error;
    }

    (error.norm() < PIXEL_TOLERANCE).then(|| base.direction(&u))
}
