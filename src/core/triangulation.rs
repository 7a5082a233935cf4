//! Triangulated-feature residuals and triangulation helpers.
//!
//! A triangulated feature has no state of its own: every pair of rays that
//! observe it gives one residual, the angular fit error of the Lee-Civera
//! "Mid2" triangulation of that pair. Rays are expressed in the first
//! camera's frame:
//!
//! ```text
//! v0           ray of camera i, camera-i coordinates (fixed)
//! v1 = R_ij·v  ray of camera j rotated into camera i
//! t01          position of camera j in camera i
//! ```
//!
//! The error and its gradient with respect to `(v1, t01)` come from one
//! generic evaluation over [`RealField`], run once with `f64` and once with
//! forward-mode dual numbers. The branches (sign flips, zero-angle cutoffs,
//! divergence penalty) are decided on plain `f64` values first, so the dual
//! evaluation never compares dual numbers.

use crate::geometry::{Pose, left_jacobian};
use crate::linalg::kernels::{accumulate_ray_projector, inverse_sym3, mul_sym3_vec3, skew, solve2};
use nalgebra::{Matrix2, Matrix3, RealField, SVector, Vector2, Vector3};
use num_dual::{DualSVec64, jacobian};

/// Angles below `sqrt` of this are reported as exactly zero
const MIN_ANGLE_SQUARED: f64 = 1e-21;
/// Knee of the divergence penalty sigmoid
const DIVERGENCE_KNEE: f64 = 3.0;
/// Rays closer to parallel than this cannot be triangulated geometrically
const PARALLEL_DENOMINATOR: f64 = 1e-10;

/// Error of one pair of rays, with its gradient
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairError {
    /// Angular error, radians
    pub error: f64,
    pub d_dv1: Vector3<f64>,
    pub d_dt01: Vector3<f64>,
    /// `false` when the rays diverge and the penalty term was added
    pub convergent: bool,
}

/// Smooth step from 0 (at `x ≤ 0`) to 1 (at `x ≥ knee`)
pub fn sigmoid(x: f64, knee: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if knee <= x {
        return 1.0;
    }
    let b = 2.0 / knee;
    let a = if x < knee / 2.0 { b / knee } else { -b / knee };
    let d = x - knee / 2.0;
    0.5 + d * (b + d * a)
}

#[derive(Debug, Clone, Copy)]
struct AngleBranch {
    flip: bool,
    zero: bool,
}

fn angle_branch(a: &Vector3<f64>, b: &Vector3<f64>) -> (f64, AngleBranch) {
    let mut costh = a.dot(b) / (a.norm_squared() * b.norm_squared()).sqrt();
    let flip = costh < 0.0;
    if flip {
        costh = -costh;
    }
    let th_sq = 2.0 - 2.0 * costh;
    let zero = th_sq < MIN_ANGLE_SQUARED;
    let angle = if zero { 0.0 } else { th_sq.max(0.0).sqrt() };
    (angle, AngleBranch { flip, zero })
}

/// Small-angle approximation of the angle between two rays
fn angle_error<T: RealField>(a: &Vector3<T>, b: &Vector3<T>, branch: AngleBranch) -> T {
    if branch.zero {
        return T::zero();
    }
    let two: T = nalgebra::convert(2.0);
    let mut costh = a.dot(b) / (a.norm_squared() * b.norm_squared()).sqrt();
    if branch.flip {
        costh = -costh;
    }
    (two.clone() - two * costh).sqrt()
}

/// Branch decisions of one pair, taken on `f64` values
#[derive(Debug, Clone, Copy)]
struct ErrorPlan {
    mid: AngleBranch,
    /// Vanishing-point branch and summed sigmoid weight when the rays diverge
    divergence: Option<(AngleBranch, f64)>,
}

struct Mid2<T> {
    l0: T,
    l1: T,
    m: Vector3<T>,
}

fn mid2<T: RealField>(v0: &Vector3<T>, v1: &Vector3<T>, t01: &Vector3<T>) -> Mid2<T> {
    let p_norm2_recip = T::one() / v0.cross(v1).norm_squared();
    let l0 = (v1.cross(t01).norm_squared() * p_norm2_recip.clone()).sqrt();
    let l1 = (v0.cross(t01).norm_squared() * p_norm2_recip).sqrt();
    let half: T = nalgebra::convert(0.5);
    let m = (v0 * l0.clone() + t01 + v1 * l1.clone()) * half;
    Mid2 { l0, l1, m }
}

/// How much flipping each ray would shorten the gap between them.
///
/// All three must be positive for the rays to converge in front of both
/// cameras.
fn chirality_improvements(
    l0: f64,
    v0: &Vector3<f64>,
    l1: f64,
    v1: &Vector3<f64>,
    t01: &Vector3<f64>,
) -> [f64; 3] {
    let mut improvements = [0.0; 3];
    for i in 0..3 {
        let nominal = (l1 * v1[i] + t01[i]) - l0 * v0[i];
        let flip0 = (l1 * v1[i] + t01[i]) + l0 * v0[i];
        let flip1 = (-l1 * v1[i] + t01[i]) - l0 * v0[i];
        let flip01 = (-l1 * v1[i] + t01[i]) + l0 * v0[i];
        improvements[0] += flip0 * flip0 - nominal * nominal;
        improvements[1] += flip1 * flip1 - nominal * nominal;
        improvements[2] += flip01 * flip01 - nominal * nominal;
    }
    improvements
}

fn is_convergent(improvements: &[f64; 3]) -> bool {
    improvements.iter().all(|improvement| *improvement > 0.0)
}

fn plan(v0: &Vector3<f64>, v1: &Vector3<f64>, t01: &Vector3<f64>) -> Option<(f64, ErrorPlan)> {
    let Mid2 { l0, l1, m } = mid2(v0, v1, t01);
    if !(l0.is_finite() && l1.is_finite()) {
        return None;
    }
    let (mid_angle, mid) = angle_branch(v0, &m);
    let mut error = 2.0 * mid_angle;

    let improvements = chirality_improvements(l0, v0, l1, v1, t01);
    let divergence = if is_convergent(&improvements) {
        None
    } else {
        let (vanishing_angle, branch) = angle_branch(v0, v1);
        let weight: f64 = improvements
            .iter()
            .map(|improvement| sigmoid(-improvement, DIVERGENCE_KNEE))
            .sum();
        error += vanishing_angle * weight;
        Some((branch, weight))
    };
    error.is_finite().then_some((error, ErrorPlan { mid, divergence }))
}

fn planned_error<T: RealField>(
    v0: &Vector3<f64>,
    v1: &Vector3<T>,
    t01: &Vector3<T>,
    plan: &ErrorPlan,
) -> T {
    let v0: Vector3<T> = v0.map(|c| nalgebra::convert(c));
    let Mid2 { m, .. } = mid2(&v0, v1, t01);
    let two: T = nalgebra::convert(2.0);
    let mut error = angle_error(&v0, &m, plan.mid) * two;
    if let Some((branch, weight)) = plan.divergence {
        error += angle_error(&v0, v1, branch) * nalgebra::convert::<f64, T>(weight);
    }
    error
}

/// Fit error of two rays and its gradient.
///
/// `v0` and `v1` need not be normalized. Returns `None` for degenerate
/// geometry (parallel rays or coincident cameras).
pub fn triangulated_error(
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    t01: &Vector3<f64>,
) -> Option<PairError> {
    let (error, plan) = plan(v0, v1, t01)?;

    let x: SVector<f64, 6> = SVector::from_column_slice(&[v1.x, v1.y, v1.z, t01.x, t01.y, t01.z]);
    let (_, gradient) = jacobian(
        |x: SVector<DualSVec64<6>, 6>| {
            let v1 = Vector3::new(x[0].clone(), x[1].clone(), x[2].clone());
            let t01 = Vector3::new(x[3].clone(), x[4].clone(), x[5].clone());
            SVector::<DualSVec64<6>, 1>::new(planned_error(v0, &v1, &t01, &plan))
        },
        x,
    );
    if gradient.iter().any(|g| !g.is_finite()) {
        return None;
    }

    Some(PairError {
        error,
        d_dv1: Vector3::new(gradient[(0, 0)], gradient[(0, 1)], gradient[(0, 2)]),
        d_dt01: Vector3::new(gradient[(0, 3)], gradient[(0, 4)], gradient[(0, 5)]),
        convergent: plan.divergence.is_none(),
    })
}

/// The Lee-Civera Mid2 triangulation of two rays, in the frame of `v0`.
///
/// `None` when the rays do not converge in front of both cameras.
pub fn triangulate_mid2(
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    t01: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    let Mid2 { l0, l1, m } = mid2(v0, v1, t01);
    if !(l0.is_finite() && l1.is_finite()) {
        return None;
    }
    is_convergent(&chirality_improvements(l0, v0, l1, v1, t01)).then_some(m)
}

/// Midpoint of the closest approach of two rays, in the frame of `v0`.
///
/// `None` for parallel rays or when the closest approach is behind either
/// camera.
pub fn triangulate_geometric(
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    t01: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    let dot01 = v0.dot(v1);
    let normal = Matrix2::new(v0.norm_squared(), -dot01, -dot01, v1.norm_squared());
    if normal.determinant().abs() <= PARALLEL_DENOMINATOR {
        return None;
    }
    let k = solve2(&normal, &Vector2::new(t01.dot(v0), -t01.dot(v1)))?;
    if k.x <= 0.0 || k.y <= 0.0 {
        return None;
    }
    Some((v0 * k.x + v1 * k.y + t01) * 0.5)
}

/// Least-squares point closest to any number of rays `origin + k·direction`
pub fn triangulate_rays(rays: &[(Vector3<f64>, Vector3<f64>)]) -> Option<Vector3<f64>> {
    if rays.len() < 2 {
        return None;
    }
    let mut normal = [0.0; 6];
    let mut rhs = Vector3::zeros();
    for (origin, direction) in rays {
        let mut projector = [0.0; 6];
        accumulate_ray_projector(&mut projector, direction, 1.0);
        rhs += mul_sym3_vec3(&projector, origin);
        for (acc, p) in normal.iter_mut().zip(projector) {
            *acc += p;
        }
    }
    let inverse = inverse_sym3(&normal)?;
    let point = mul_sym3_vec3(&inverse, &rhs);
    point.iter().all(|c| c.is_finite()).then_some(point)
}

/// Relative geometry of a camera pair and its gradients with respect to both
/// cameras' `rt_cam_ref`
#[derive(Debug, Clone, Copy)]
pub struct PairGeometry {
    /// Ray of camera j, in camera i
    pub v1: Vector3<f64>,
    /// Origin of camera j, in camera i
    pub t01: Vector3<f64>,
    pub dv1_dri: Matrix3<f64>,
    pub dv1_drj: Matrix3<f64>,
    pub dt01_dri: Matrix3<f64>,
    pub dt01_drj: Matrix3<f64>,
    /// `∂t01/∂t_j`; `∂t01/∂t_i` is the identity
    pub dt01_dtj: Matrix3<f64>,
}

/// Bring ray `v_j` of camera j into camera i.
///
/// Both poses map the reference frame into their camera; the reference
/// camera passes the identity.
pub fn pair_geometry(pose_i: &Pose, pose_j: &Pose, v_j: &Vector3<f64>) -> PairGeometry {
    let r_i = pose_i.rotation();
    let r_j = pose_j.rotation();
    let r_ij = r_i * r_j.transpose();
    let jl_i = left_jacobian(&pose_i.r);
    let jl_j = left_jacobian(&pose_j.r);

    let v1 = r_ij * v_j;
    let rotated_tj = r_ij * pose_j.t;
    PairGeometry {
        v1,
        t01: pose_i.t - rotated_tj,
        dv1_dri: -skew(&v1) * jl_i,
        dv1_drj: r_ij * skew(v_j) * jl_j,
        dt01_dri: skew(&rotated_tj) * jl_i,
        dt01_drj: -(r_ij * skew(&pose_j.t) * jl_j),
        dt01_dtj: -r_ij,
    }
}
