//! Rigid transforms in Rodrigues + translation ("rt") form.
//!
//! Conventions used throughout the crate:
//! - camera extrinsics map the reference frame into the camera frame
//!   (`p_cam = R·p_ref + t`); the reference camera has none
//! - frame poses map a calibration board into the reference frame
//!   (`p_ref = R·p_board + t`)

pub mod rotation;

pub use rotation::{left_jacobian, rotate_point_with_gradient, rotation_matrix, rotation_vector};

use nalgebra::{Matrix3, Vector3};

/// A rigid transform `x ↦ R(r)·x + t`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Rodrigues rotation vector
    pub r: Vector3<f64>,
    /// Translation
    pub t: Vector3<f64>,
}

/// A transformed point with its derivatives
#[derive(Debug, Clone, Copy)]
pub struct TransformedPoint {
    pub point: Vector3<f64>,
    /// ∂point/∂r
    pub d_dr: Matrix3<f64>,
    /// ∂point/∂(input point), i.e. the rotation matrix. ∂point/∂t is the identity.
    pub d_dp: Matrix3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn new(r: Vector3<f64>, t: Vector3<f64>) -> Self {
        Self { r, t }
    }

    pub fn identity() -> Self {
        Self {
            r: Vector3::zeros(),
            t: Vector3::zeros(),
        }
    }

    /// `[r, t]` as a flat array
    pub fn to_array(&self) -> [f64; 6] {
        [self.r.x, self.r.y, self.r.z, self.t.x, self.t.y, self.t.z]
    }

    pub fn from_array(rt: &[f64; 6]) -> Self {
        Self {
            r: Vector3::new(rt[0], rt[1], rt[2]),
            t: Vector3::new(rt[3], rt[4], rt[5]),
        }
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        rotation_matrix(&self.r)
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * p + self.t
    }

    pub fn transform_point_with_gradients(&self, p: &Vector3<f64>) -> TransformedPoint {
        let (rotated, d_dr, rotation) = rotate_point_with_gradient(&self.r, p);
        TransformedPoint {
            point: rotated + self.t,
            d_dr,
            d_dp: rotation,
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`
    pub fn compose(&self, other: &Pose) -> Pose {
        let r_self = self.rotation();
        let rotation = r_self * other.rotation();
        Pose {
            r: rotation_vector(&rotation),
            t: r_self * other.t + self.t,
        }
    }

    pub fn inverse(&self) -> Pose {
        let rt = self.rotation().transpose();
        Pose {
            r: -self.r,
            t: -(rt * self.t),
        }
    }
}
