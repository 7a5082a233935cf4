//! Rodrigues rotation vectors and their derivatives.
//!
//! A rotation is stored as `r = θ·axis`. Derivatives are taken with respect to
//! `r` itself (not a tangent perturbation), since the packed state holds `r`
//! directly:
//!
//! ```text
//! R(r + δ) ≈ exp([J_l(r)·δ]×) · R(r)
//! ∂(R·p)/∂r = −[R·p]× · J_l(r)
//! ```

use crate::linalg::kernels::skew;
use nalgebra::{Matrix3, Rotation3, Vector3};

/// Below this squared angle the series expansions are used.
const SMALL_ANGLE_SQUARED: f64 = 1e-12;

/// Rotation matrix from a Rodrigues vector
#[inline]
pub fn rotation_matrix(r: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*r).into_inner()
}

/// Rodrigues vector of a rotation matrix
pub fn rotation_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix_unchecked(*rotation).scaled_axis()
}

/// Left Jacobian of the SO(3) exponential map
///
/// ```text
/// J_l(θ) = I + (1 − cos θ)/θ² [θ]× + (θ − sin θ)/θ³ [θ]×²
/// ```
pub fn left_jacobian(r: &Vector3<f64>) -> Matrix3<f64> {
    let theta_squared = r.norm_squared();
    let r_hat = skew(r);

    if theta_squared <= SMALL_ANGLE_SQUARED {
        Matrix3::identity() + 0.5 * r_hat + (1.0 / 6.0) * r_hat * r_hat
    } else {
        let theta = theta_squared.sqrt();
        let (sin_theta, cos_theta) = theta.sin_cos();
        Matrix3::identity()
            + (1.0 - cos_theta) / theta_squared * r_hat
            + (theta - sin_theta) / (theta_squared * theta) * r_hat * r_hat
    }
}

/// Rotate `p` by `r`, returning `(R·p, ∂(R·p)/∂r, R)`
pub fn rotate_point_with_gradient(
    r: &Vector3<f64>,
    p: &Vector3<f64>,
) -> (Vector3<f64>, Matrix3<f64>, Matrix3<f64>) {
    let rotation = rotation_matrix(r);
    let rotated = rotation * p;
    let d_dr = -skew(&rotated) * left_jacobian(r);
    (rotated, d_dr, rotation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-7;
    const EPS: f64 = 1e-6;

    fn numeric_rotation_gradient(r: &Vector3<f64>, p: &Vector3<f64>) -> Matrix3<f64> {
        let mut out = Matrix3::zeros();
        for k in 0..3 {
            let mut rp = *r;
            let mut rm = *r;
            rp[k] += EPS;
            rm[k] -= EPS;
            let column = (rotation_matrix(&rp) * p - rotation_matrix(&rm) * p) / (2.0 * EPS);
            out.set_column(k, &column);
        }
        out
    }

    #[test]
    fn test_rotation_gradient_matches_finite_differences() {
        let p = Vector3::new(0.4, -1.3, 2.2);
        for r in [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(1.5, 0.7, -2.1),
            Vector3::new(1e-9, 0.0, -2e-9),
            Vector3::zeros(),
        ] {
            let (_, analytic, _) = rotate_point_with_gradient(&r, &p);
            let numeric = numeric_rotation_gradient(&r, &p);
            assert!(
                (analytic - numeric).norm() < TOLERANCE,
                "r = {r:?}: analytic {analytic} numeric {numeric}"
            );
        }
    }

    #[test]
    fn test_rotation_vector_round_trip() {
        let r = Vector3::new(0.3, -0.5, 1.1);
        let back = rotation_vector(&rotation_matrix(&r));
        assert!((back - r).norm() < 1e-12);
    }

    #[test]
    fn test_left_jacobian_identity_at_zero() {
        assert!((left_jacobian(&Vector3::zeros()) - Matrix3::identity()).norm() < 1e-15);
    }
}
