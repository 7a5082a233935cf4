//! OpenCV-compatible distortion models.
//!
//! Working on the pinhole-normalized point `(x, y) = (X/Z, Y/Z)` with
//! `r² = x² + y²`:
//!
//! ```text
//! radial = (1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)
//! x_d = x·radial + 2 p1 x y + p2 (r² + 2x²) + s1 r² + s2 r⁴
//! y_d = y·radial + p1 (r² + 2y²) + 2 p2 x y + s3 r² + s4 r⁴
//! q   = f∘(x_d, y_d) + c
//! ```
//!
//! The shorter variants are the same formula with the trailing coefficients
//! fixed at zero: OPENCV4 has `k1 k2 p1 p2`, OPENCV5 adds `k3`, OPENCV8 adds
//! the rational `k4 k5 k6`, OPENCV12 the thin prism `s1..s4`.

use super::{IntrinsicsGradient, Projection, apply_core, pinhole_normalize};
use nalgebra::{Matrix2, Matrix2x3, Vector2, Vector3};

/// Distortion coefficients in the fixed OPENCV12 order, zero-padded
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    k: [f64; 6],
    p1: f64,
    p2: f64,
    s: [f64; 4],
}

impl Coefficients {
    fn from_intrinsics(intrinsics: &[f64]) -> Self {
        let d = &intrinsics[4..];
        let at = |i: usize| d.get(i).copied().unwrap_or(0.0);
        Self {
            k: [at(0), at(1), at(4), at(5), at(6), at(7)],
            p1: at(2),
            p2: at(3),
            s: [at(8), at(9), at(10), at(11)],
        }
    }
}

pub(super) fn project_opencv(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let n_params = intrinsics.len();
    let c = Coefficients::from_intrinsics(intrinsics);
    let (v, dv_dp) = pinhole_normalize(p)?;
    let (x, y) = (v.x, v.y);

    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let [k1, k2, k3, k4, k5, k6] = c.k;
    let [s1, s2, s3, s4] = c.s;
    let (p1, p2) = (c.p1, c.p2);

    let num = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
    let den = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
    if den == 0.0 {
        return None;
    }
    let radial = num / den;

    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) + s1 * r2 + s2 * r4;
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y + s3 * r2 + s4 * r4;
    let distorted = Vector2::new(xd, yd);

    if !with_gradients {
        return apply_core(distorted, Matrix2x3::zeros(), intrinsics, n_params, false);
    }

    // ∂radial/∂(r²)
    let dnum = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
    let dden = k4 + 2.0 * k5 * r2 + 3.0 * k6 * r4;
    let dradial = (dnum * den - num * dden) / (den * den);

    let dxd_dx = radial + 2.0 * x * x * dradial + 2.0 * p1 * y + 6.0 * p2 * x
        + 2.0 * s1 * x
        + 4.0 * s2 * r2 * x;
    let dxd_dy = 2.0 * x * y * dradial + 2.0 * p1 * x + 2.0 * p2 * y
        + 2.0 * s1 * y
        + 4.0 * s2 * r2 * y;
    let dyd_dx = 2.0 * x * y * dradial + 2.0 * p1 * x + 2.0 * p2 * y
        + 2.0 * s3 * x
        + 4.0 * s4 * r2 * x;
    let dyd_dy = radial + 2.0 * y * y * dradial + 6.0 * p1 * y + 2.0 * p2 * x
        + 2.0 * s3 * y
        + 4.0 * s4 * r2 * y;
    let dd_dv = Matrix2::new(dxd_dx, dxd_dy, dyd_dx, dyd_dy);

    let mut projection = apply_core(distorted, dd_dv * dv_dp, intrinsics, n_params, true)?;
    let IntrinsicsGradient::Dense(dq_di) = &mut projection.dq_dintrinsics else {
        return None;
    };
    let (fx, fy) = (intrinsics[0], intrinsics[1]);

    // Columns follow the intrinsics layout: k1 k2 p1 p2 k3 k4 k5 k6 s1 s2 s3 s4
    let radial_powers = [r2, r4, r6];
    let numerator_terms = [(4, 0), (5, 1), (8, 2)];
    for (col, power) in numerator_terms {
        if col < n_params {
            dq_di[(0, col)] = fx * x * radial_powers[power] / den;
            dq_di[(1, col)] = fy * y * radial_powers[power] / den;
        }
    }
    if n_params > 6 {
        dq_di[(0, 6)] = fx * 2.0 * x * y;
        dq_di[(1, 6)] = fy * (r2 + 2.0 * y * y);
        dq_di[(0, 7)] = fx * (r2 + 2.0 * x * x);
        dq_di[(1, 7)] = fy * 2.0 * x * y;
    }
    let denominator_terms = [(9, 0), (10, 1), (11, 2)];
    for (col, power) in denominator_terms {
        if col < n_params {
            let dradial_dk = -num * radial_powers[power] / (den * den);
            dq_di[(0, col)] = fx * x * dradial_dk;
            dq_di[(1, col)] = fy * y * dradial_dk;
        }
    }
    if n_params == 16 {
        dq_di[(0, 12)] = fx * r2;
        dq_di[(0, 13)] = fx * r4;
        dq_di[(1, 14)] = fy * r2;
        dq_di[(1, 15)] = fy * r4;
    }
    Some(projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lensmodel::LensModel;
    use crate::lensmodel::test_support::check_gradients;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn opencv12_intrinsics() -> Vec<f64> {
        vec![
            1800.0, 1790.0, 1023.5, 767.5, // core
            -0.12, 0.03, 1e-3, -5e-4, // k1 k2 p1 p2
            -0.004, 0.02, -0.01, 0.003, // k3 k4 k5 k6
            2e-4, -1e-4, 3e-4, 1e-5, // s1..s4
        ]
    }

    #[test]
    fn test_zero_distortion_matches_pinhole() -> TestResult {
        let p = Vector3::new(0.3, -0.45, 2.0);
        let mut intrinsics = opencv12_intrinsics();
        intrinsics[4..].iter_mut().for_each(|k| *k = 0.0);
        let pinhole = LensModel::Pinhole
            .project(&p, &intrinsics[..4])
            .ok_or("pinhole projection failed")?;
        let opencv = LensModel::OpenCv12
            .project(&p, &intrinsics)
            .ok_or("opencv projection failed")?;
        assert!((pinhole - opencv).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_opencv_gradients_for_every_variant() {
        let full = opencv12_intrinsics();
        let points = [
            Vector3::new(0.3, -0.45, 2.0),
            Vector3::new(-0.9, 0.6, 1.1),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        for (model, n) in [
            (LensModel::OpenCv4, 8),
            (LensModel::OpenCv5, 9),
            (LensModel::OpenCv8, 12),
            (LensModel::OpenCv12, 16),
        ] {
            for p in &points {
                check_gradients(&model, p, &full[..n]);
            }
        }
    }

    #[test]
    fn test_opencv_gradients_near_the_field_of_view_edge() {
        let full = opencv12_intrinsics();
        for (model, n) in [
            (LensModel::OpenCv4, 8),
            (LensModel::OpenCv8, 12),
            (LensModel::OpenCv12, 16),
        ] {
            for degrees in [60.0_f64, 70.0, 75.0] {
                let r = degrees.to_radians().tan();
                let diagonal = r / 2.0_f64.sqrt();
                for p in [Vector3::new(r, 0.0, 1.0), Vector3::new(diagonal, diagonal, 1.0)] {
                    check_gradients(&model, &p, &full[..n]);
                }
            }
        }
    }

    #[test]
    fn test_radial_distortion_pulls_points_inward() -> TestResult {
        let mut intrinsics = opencv12_intrinsics()[..8].to_vec();
        intrinsics[4] = -0.2;
        intrinsics[5..].iter_mut().for_each(|k| *k = 0.0);
        let p = Vector3::new(0.5, 0.0, 1.0);
        let q = LensModel::OpenCv4.project(&p, &intrinsics).ok_or("projection failed")?;
        let undistorted = intrinsics[2] + intrinsics[0] * 0.5;
        assert!(q.x < undistorted);
        assert!((q.y - intrinsics[3]).abs() < 1e-12);
        Ok(())
    }
}
