//! Models that are nothing but a normalization followed by `f∘v + c`.

use super::{Projection, apply_core, pinhole_normalize};
use nalgebra::{Matrix2x3, Vector2, Vector3};

pub(super) fn project_pinhole(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let (v, dv_dp) = pinhole_normalize(p)?;
    apply_core(v, dv_dp, intrinsics, 4, with_gradients)
}

/// Stereographic normalization `u = 2·(x, y)/(|p| + z)`.
///
/// Singular only for points exactly behind the camera on the optical axis.
pub(crate) fn stereographic_normalize(
    p: &Vector3<f64>,
) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
    let norm = p.norm();
    let denom = norm + p.z;
    if norm == 0.0 || denom <= 0.0 {
        return None;
    }
    let u = Vector2::new(2.0 * p.x / denom, 2.0 * p.y / denom);

    // ∂denom/∂p = p/|p| + e_z
    let g = Vector3::new(p.x / norm, p.y / norm, p.z / norm + 1.0);
    let a = 2.0 / denom;
    let bx = 2.0 * p.x / (denom * denom);
    let by = 2.0 * p.y / (denom * denom);
    let du_dp = Matrix2x3::new(
        a - bx * g.x,
        -bx * g.y,
        -bx * g.z,
        -by * g.x,
        a - by * g.y,
        -by * g.z,
    );
    Some((u, du_dp))
}

pub(super) fn project_stereographic(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let (u, du_dp) = stereographic_normalize(p)?;
    apply_core(u, du_dp, intrinsics, 4, with_gradients)
}

/// `(longitude, latitude) = (atan2(x, z), asin(y/|p|))`
pub(super) fn project_lonlat(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let norm2 = p.norm_squared();
    let horizontal2 = p.x * p.x + p.z * p.z;
    if norm2 == 0.0 || horizontal2 == 0.0 {
        return None;
    }
    let horizontal = horizontal2.sqrt();
    let v = Vector2::new(p.x.atan2(p.z), (p.y / norm2.sqrt()).clamp(-1.0, 1.0).asin());

    let k = 1.0 / (norm2 * horizontal);
    let dv_dp = Matrix2x3::new(
        p.z / horizontal2,
        0.0,
        -p.x / horizontal2,
        -p.x * p.y * k,
        horizontal2 * k,
        -p.z * p.y * k,
    );
    apply_core(v, dv_dp, intrinsics, 4, with_gradients)
}

/// `(latitude, longitude) = (asin(x/|p|), atan2(y, z))`
pub(super) fn project_latlon(
    p: &Vector3<f64>,
    intrinsics: &[f64],
    with_gradients: bool,
) -> Option<Projection> {
    let norm2 = p.norm_squared();
    let vertical2 = p.y * p.y + p.z * p.z;
    if norm2 == 0.0 || vertical2 == 0.0 {
        return None;
    }
    let vertical = vertical2.sqrt();
    let v = Vector2::new((p.x / norm2.sqrt()).clamp(-1.0, 1.0).asin(), p.y.atan2(p.z));

    let k = 1.0 / (norm2 * vertical);
    let dv_dp = Matrix2x3::new(
        vertical2 * k,
        -p.x * p.y * k,
        -p.x * p.z * k,
        0.0,
        p.z / vertical2,
        -p.y / vertical2,
    );
    apply_core(v, dv_dp, intrinsics, 4, with_gradients)
}

/// Normalized coordinate `(q − c)/f`
pub(crate) fn normalized_from_pixel(q: &Vector2<f64>, intrinsics: &[f64]) -> Vector2<f64> {
    Vector2::new(
        (q.x - intrinsics[2]) / intrinsics[0],
        (q.y - intrinsics[3]) / intrinsics[1],
    )
}

pub(super) fn unproject_pinhole(q: &Vector2<f64>, intrinsics: &[f64]) -> Vector3<f64> {
    let v = normalized_from_pixel(q, intrinsics);
    Vector3::new(v.x, v.y, 1.0)
}

/// Inverse stereographic: `(4u, 4 − |u|²)`
pub(crate) fn stereographic_direction(u: &Vector2<f64>) -> Vector3<f64> {
    Vector3::new(4.0 * u.x, 4.0 * u.y, 4.0 - u.norm_squared())
}

pub(super) fn unproject_stereographic(q: &Vector2<f64>, intrinsics: &[f64]) -> Vector3<f64> {
    stereographic_direction(&normalized_from_pixel(q, intrinsics))
}

pub(super) fn unproject_lonlat(q: &Vector2<f64>, intrinsics: &[f64]) -> Vector3<f64> {
    let v = normalized_from_pixel(q, intrinsics);
    let (sin_lon, cos_lon) = v.x.sin_cos();
    let (sin_lat, cos_lat) = v.y.sin_cos();
    Vector3::new(cos_lat * sin_lon, sin_lat, cos_lat * cos_lon)
}

pub(super) fn unproject_latlon(q: &Vector2<f64>, intrinsics: &[f64]) -> Vector3<f64> {
    let v = normalized_from_pixel(q, intrinsics);
    let (sin_lat, cos_lat) = v.x.sin_cos();
    let (sin_lon, cos_lon) = v.y.sin_cos();
    Vector3::new(sin_lat, cos_lat * sin_lon, cos_lat * cos_lon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lensmodel::LensModel;
    use crate::lensmodel::test_support::check_gradients;

    const INTRINSICS: [f64; 4] = [1200.0, 1100.0, 639.5, 479.5];

    #[test]
    fn test_pinhole_projects_on_axis_to_center() -> Result<(), Box<dyn std::error::Error>> {
        let q = LensModel::Pinhole
            .project(&Vector3::new(0.0, 0.0, 3.0), &INTRINSICS)
            .ok_or("projection failed")?;
        assert!((q - Vector2::new(639.5, 479.5)).norm() < 1e-12);
        assert!(LensModel::Pinhole.project(&Vector3::new(1.0, 0.0, 0.0), &INTRINSICS).is_none());
        Ok(())
    }

    #[test]
    fn test_core_model_gradients() {
        let points = [
            Vector3::new(0.3, -0.2, 2.0),
            Vector3::new(-1.5, 0.8, 1.0),
            // 80° off axis, well inside a wide field of view
            Vector3::new(80f64.to_radians().tan(), 0.1, 1.0),
        ];
        for model in [
            LensModel::Pinhole,
            LensModel::Stereographic,
            LensModel::LonLat,
            LensModel::LatLon,
        ] {
            for p in &points {
                check_gradients(&model, p, &INTRINSICS);
            }
        }
    }

    #[test]
    fn test_stereographic_sees_behind_camera() {
        let behind = Vector3::new(0.5, 0.2, -1.0);
        for model in [LensModel::Stereographic, LensModel::LonLat, LensModel::LatLon] {
            assert!(model.project(&behind, &INTRINSICS).is_some(), "{model}");
            check_gradients(&model, &behind, &INTRINSICS);
        }
        assert!(
            LensModel::Stereographic
                .project(&Vector3::new(0.0, 0.0, -1.0), &INTRINSICS)
                .is_none()
        );
    }

    #[test]
    fn test_closed_form_unprojection() -> Result<(), Box<dyn std::error::Error>> {
        let p = Vector3::new(-0.4, 0.7, 1.3);
        for model in [
            LensModel::Pinhole,
            LensModel::Stereographic,
            LensModel::LonLat,
            LensModel::LatLon,
        ] {
            let q = model.project(&p, &INTRINSICS).ok_or("projection failed")?;
            let v = model.unproject(&q, &INTRINSICS)?.ok_or("unprojection failed")?;
            let angle = v.normalize().dot(&p.normalize()).clamp(-1.0, 1.0).acos();
            assert!(angle < 1e-10, "{model}: angle {angle}");
        }
        Ok(())
    }
}
