//! Small fixed-size linear algebra kernels.
//!
//! Symmetric 3×3 matrices are stored packed as their upper triangle,
//! row-major: `[m00, m01, m02, m11, m12, m22]`. The inverses are computed
//! from cofactors and callers get `None` back for (numerically) singular
//! input rather than a matrix full of infinities.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

/// Determinants with magnitude below this are treated as singular.
pub const SINGULAR_THRESHOLD: f64 = 1e-300;

/// Skew-symmetric cross-product matrix: `skew(v) * w == v × w`
///
/// ```text
/// [v]× = [  0  -vz   vy ]
///        [  vz   0  -vx ]
///        [ -vy  vx    0 ]
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[inline]
pub fn det2(m: &Matrix2<f64>) -> f64 {
    m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]
}

/// Inverse of a 2×2 matrix from its adjugate
pub fn inverse2(m: &Matrix2<f64>) -> Option<Matrix2<f64>> {
    let det = det2(m);
    if det.abs() < SINGULAR_THRESHOLD || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    Some(Matrix2::new(
        m[(1, 1)] * inv_det,
        -m[(0, 1)] * inv_det,
        -m[(1, 0)] * inv_det,
        m[(0, 0)] * inv_det,
    ))
}

/// Solve `m·x = b` for a 2×2 system
pub fn solve2(m: &Matrix2<f64>, b: &Vector2<f64>) -> Option<Vector2<f64>> {
    inverse2(m).map(|inv| inv * b)
}

/// Cofactors of a packed symmetric 3×3 matrix, in the same packed layout.
///
/// Since the matrix is symmetric so is its cofactor matrix, and
/// `m · cofactors(m) == det(m) · I`.
pub fn cofactors_sym3(m: &[f64; 6]) -> [f64; 6] {
    let [a, b, c, d, e, f] = *m;
    [
        d * f - e * e,
        c * e - b * f,
        b * e - c * d,
        a * f - c * c,
        b * c - a * e,
        a * d - b * b,
    ]
}

/// Determinant of a packed symmetric 3×3 matrix
pub fn det_sym3(m: &[f64; 6]) -> f64 {
    let cof = cofactors_sym3(m);
    m[0] * cof[0] + m[1] * cof[1] + m[2] * cof[2]
}

/// Inverse of a packed symmetric 3×3 matrix, packed
pub fn inverse_sym3(m: &[f64; 6]) -> Option<[f64; 6]> {
    let cof = cofactors_sym3(m);
    let det = m[0] * cof[0] + m[1] * cof[1] + m[2] * cof[2];
    if det.abs() < SINGULAR_THRESHOLD || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    Some(cof.map(|c| c * inv_det))
}

/// `m·v` for a packed symmetric 3×3 matrix
pub fn mul_sym3_vec3(m: &[f64; 6], v: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(
        m[0] * v.x + m[1] * v.y + m[2] * v.z,
        m[1] * v.x + m[3] * v.y + m[4] * v.z,
        m[2] * v.x + m[4] * v.y + m[5] * v.z,
    )
}

/// Unpack a symmetric 3×3 matrix into a dense one
pub fn unpack_sym3(m: &[f64; 6]) -> Matrix3<f64> {
    Matrix3::new(m[0], m[1], m[2], m[1], m[3], m[4], m[2], m[4], m[5])
}

/// Accumulate `scale·(I − d·dᵀ/|d|²)` into a packed symmetric matrix.
///
/// This is the projector orthogonal to the ray direction `d`; summing it over
/// several rays builds the normal matrix of the closest-point-to-rays problem.
pub fn accumulate_ray_projector(acc: &mut [f64; 6], d: &Vector3<f64>, scale: f64) {
    let n2 = d.norm_squared();
    if n2 <= 0.0 {
        return;
    }
    let k = scale / n2;
    acc[0] += scale - k * d.x * d.x;
    acc[1] -= k * d.x * d.y;
    acc[2] -= k * d.x * d.z;
    acc[3] += scale - k * d.y * d.y;
    acc[4] -= k * d.y * d.z;
    acc[5] += scale - k * d.z * d.z;
}
