//! CAHVOR and CAHVORE, the JPL models with a tilted optical axis.
//!
//! Both describe the optical axis by two angles:
//!
//! ```text
//! o(α, β) = (sin α cos β, sin β, cos α cos β)
//! ```
//!
//! CAHVOR distorts radially about `o` and then applies a pinhole:
//!
//! ```text
//! ω   = p·o
//! τ   = |p|²/ω² − 1
//! μ   = r0 + r1 τ + r2 τ²
//! p_d = (1 + μ)·p − μ ω·o
//! ```
//!
//! CAHVORE generalizes this to a noncentral model. The ray angle `θ` off the
//! optical axis is the root of
//!
//! ```text
//! ζ sin θ − λ cos θ = (θ − sin θ)(e0 + e1 θ² + e2 θ⁴)
//! ```
//!
//! with `ζ = p·o` and `λ = |p − ζ o|`, found with Newton's method. The linearity
//! `L` picks how `θ` maps to the radial coordinate `χ`: `tan(Lθ)/L` for `L > 0`,
//! `θ` for `L = 0`, `sin(Lθ)/L` for `L < 0`.

use super::{Projection, apply_core, pinhole_normalize};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::f64::consts::FRAC_PI_2;

const CAHVORE_TOLERANCE: f64 = 1e-8;
const CAHVORE_MAX_ITERATIONS: usize = 100;

fn optical_axis(alpha: f64, beta: f64) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let (sa, ca) = alpha.sin_cos();
    let (sb, cb) = beta.sin_cos();
    let o = Vector3::new(sa * cb, sb, ca * cb);
    let do_dalpha = Vector3::new(ca * cb, 0.0, -sa * cb);
    let do_dbeta = Vector3::new(-sa * sb, cb, -ca * sb);
    (o, do_dalpha, do_dbeta)
}

pub(super) fn project_cahvor(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let [alpha, beta, r0, r1, r2] = [
        intrinsics[4],
        intrinsics[5],
        intrinsics[6],
        intrinsics[7],
        intrinsics[8],
    ];
    let (o, do_dalpha, do_dbeta) = optical_axis(alpha, beta);

    let norm2 = p.norm_squared();
    let omega = p.dot(&o);
    if omega == 0.0 {
        return None;
    }
    let tau = norm2 / (omega * omega) - 1.0;
    let mu = r0 + r1 * tau + r2 * tau * tau;
    let a = p - omega * o;
    let pd = p * (1.0 + mu) - o * (omega * mu);

    let (v, dv_dpd) = pinhole_normalize(&pd)?;
    if !with_gradients {
        return apply_core(v, dv_dpd, intrinsics, 9, false);
    }

    let dmu_dtau = r1 + 2.0 * r2 * tau;
    let omega3 = omega * omega * omega;
    let dtau_dp = p * (2.0 / (omega * omega)) - o * (2.0 * norm2 / omega3);
    let dtau_do = p * (-2.0 * norm2 / omega3);
    let dmu_dp = dtau_dp * dmu_dtau;
    let dmu_do = dtau_do * dmu_dtau;

    let dpd_dp: Matrix3<f64> =
        Matrix3::identity() * (1.0 + mu) + a * dmu_dp.transpose() - (o * o.transpose()) * mu;
    let dpd_do: Matrix3<f64> = a * dmu_do.transpose()
        - (o * p.transpose()) * mu
        - Matrix3::identity() * (mu * omega);

    let mut projection = apply_core(v, dv_dpd * dpd_dp, intrinsics, 9, true)?;
    let super::IntrinsicsGradient::Dense(dq_di) = &mut projection.dq_dintrinsics else {
        return None;
    };

    let f = Vector2::new(intrinsics[0], intrinsics[1]);
    let scaled = |dpd: Vector3<f64>| {
        let dv = dv_dpd * dpd;
        Vector2::new(f.x * dv.x, f.y * dv.y)
    };
    let columns = [
        scaled(dpd_do * do_dalpha),
        scaled(dpd_do * do_dbeta),
        scaled(a),
        scaled(a * tau),
        scaled(a * (tau * tau)),
    ];
    for (k, column) in columns.iter().enumerate() {
        dq_di[(0, 4 + k)] = column.x;
        dq_di[(1, 4 + k)] = column.y;
    }
    Some(projection)
}

/// Solve for the CAHVORE ray angle, starting from the central estimate
fn solve_theta(zeta: f64, lambda: f64, e: [f64; 3]) -> Option<f64> {
    let [e0, e1, e2] = e;
    let mut theta = lambda.atan2(zeta);
    for _ in 0..CAHVORE_MAX_ITERATIONS {
        let (s, c) = theta.sin_cos();
        let theta2 = theta * theta;
        let poly = e0 + e1 * theta2 + e2 * theta2 * theta2;
        let dpoly = 2.0 * e1 * theta + 4.0 * e2 * theta2 * theta;
        let f = zeta * s - lambda * c - (theta - s) * poly;
        let df = zeta * c + lambda * s - (1.0 - c) * poly - (theta - s) * dpoly;
        if df == 0.0 || !df.is_finite() {
            return None;
        }
        let step = f / df;
        theta -= step;
        if step.abs() < CAHVORE_TOLERANCE {
            return Some(theta);
        }
    }
    None
}

/// CAHVORE projection. Value only: the model has no analytic gradients.
pub(super) fn project_cahvore(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    linearity: f64,
) -> Option<Vector2<f64>> {
    let [alpha, beta, r0, r1, r2, e0, e1, e2] = [
        intrinsics[4],
        intrinsics[5],
        intrinsics[6],
        intrinsics[7],
        intrinsics[8],
        intrinsics[9],
        intrinsics[10],
        intrinsics[11],
    ];
    let (o, _, _) = optical_axis(alpha, beta);
    let zeta = p.dot(&o);
    let lambda_vec = p - o * zeta;
    let lambda = lambda_vec.norm();

    let pd = if lambda <= f64::EPSILON * p.norm() {
        *p
    } else {
        let theta = solve_theta(zeta, lambda, [e0, e1, e2])?;
        if theta * linearity.abs() > FRAC_PI_2 {
            return None;
        }
        let chi = if linearity > 0.0 {
            (linearity * theta).tan() / linearity
        } else if linearity < 0.0 {
            (linearity * theta).sin() / linearity
        } else {
            theta
        };
        if chi == 0.0 {
            return None;
        }
        let chi2 = chi * chi;
        let mu = r0 + r1 * chi2 + r2 * chi2 * chi2;
        o * (lambda / chi) + lambda_vec * (1.0 + mu)
    };

    let (v, dv_dpd) = pinhole_normalize(&pd)?;
    apply_core(v, dv_dpd, intrinsics, 12, false).map(|projection| projection.q)
}
