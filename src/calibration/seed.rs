//! Board pose seeds from observed corners.
//!
//! Without any prior knowledge of the lens, a board view is seeded by
//! assuming a stereographic camera with a guessed focal length and a centered
//! principal point:
//!
//! 1. unproject the inlier corners through that stereographic camera and
//!    re-project them as pinhole pixels
//! 2. fit the plane-to-image homography (normalized DLT)
//! 3. decompose it into a pose of the flat board
//! 4. refine the pose by minimizing the pinhole reprojection error
//!
//! The result maps the board into the observing camera's frame. For the
//! reference camera that is the frame pose itself.

use crate::calibration::CalibrationError;
use crate::core::{
    CalibrationObject, CalibrationProblem, CalibrationProblemSpec, CalibrationState, CameraIndex,
    ObservedPixel, Observations, ProblemSelections,
};
use crate::error::ApexCalibResult;
use crate::geometry::{Pose, rotation_vector};
use crate::lensmodel::LensModel;
use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};
use tracing::debug;

/// Fewest inlier corners a board view needs for a homography
const MIN_CORNERS: usize = 4;

fn seed_error(reason: impl Into<String>) -> CalibrationError {
    CalibrationError::SeedFailed(reason.into()).log()
}

/// Similarity taking `points` to zero mean and mean distance √2
fn normalizing_transform(points: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_distance <= f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(transform: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let h = transform * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(h.x / h.z, h.y / h.z)
}

/// Homography `H` with `image ~ H·board`, from at least four correspondences
pub fn fit_homography(board: &[Vector2<f64>], image: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = board.len();
    if n < MIN_CORNERS || image.len() != n {
        return None;
    }
    let t_board = normalizing_transform(board)?;
    let t_image = normalizing_transform(image)?;

    // Padded to square so the SVD always yields the full right basis
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (k, (b, i)) in board.iter().zip(image).enumerate() {
        let b = apply(&t_board, b);
        let i = apply(&t_image, i);
        let (r0, r1) = (2 * k, 2 * k + 1);
        a[(r0, 0)] = -b.x;
        a[(r0, 1)] = -b.y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = i.x * b.x;
        a[(r0, 7)] = i.x * b.y;
        a[(r0, 8)] = i.x;
        a[(r1, 3)] = -b.x;
        a[(r1, 4)] = -b.y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = i.y * b.x;
        a[(r1, 7)] = i.y * b.y;
        a[(r1, 8)] = i.y;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    // Singular values are sorted; the null vector is the last row
    let h = v_t.row(v_t.nrows() - 1);
    let normalized = Matrix3::from_fn(|r, c| h[3 * r + c]);
    let homography = t_image.try_inverse()? * normalized * t_board;
    let scale = homography[(2, 2)];
    Some(if scale.abs() > f64::EPSILON {
        homography / scale
    } else {
        homography
    })
}

/// Pose of the `z = 0` plane from a homography into normalized pinhole
/// coordinates. The board ends up in front of the camera.
pub fn pose_from_homography(homography: &Matrix3<f64>) -> Option<Pose> {
    let h1 = homography.column(0).into_owned();
    let h2 = homography.column(1).into_owned();
    let h3 = homography.column(2).into_owned();
    let mean_norm = (h1.norm() + h2.norm()) / 2.0;
    if mean_norm <= 1e-12 {
        return None;
    }
    let sign = if h3.z < 0.0 { -1.0 } else { 1.0 };
    let lambda = sign / mean_norm;
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return None;
    }

    // Closest rotation to [r1 r2 r3]
    let svd = Matrix3::from_columns(&[r1, r2, r3]).svd(true, true);
    let (mut u, v_t) = (svd.u?, svd.v_t?);
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    Some(Pose::new(rotation_vector(&(u * v_t)), t))
}

/// Seed the pose of one board view in the observing camera's frame.
///
/// `pixels` holds the `W·H` corners in board order; corners with a negative
/// weight are skipped. The camera is taken to be stereographic with focal
/// length `focal_guess` and its principal point at the imager center.
pub fn seed_board_pose(
    pixels: &[ObservedPixel],
    object: &CalibrationObject,
    imager_size: [usize; 2],
    focal_guess: f64,
) -> ApexCalibResult<Pose> {
    if pixels.len() != object.num_corners() {
        return Err(seed_error(format!(
            "board view has {} corners, the board has {}",
            pixels.len(),
            object.num_corners()
        ))
        .into());
    }
    if !(focal_guess.is_finite() && focal_guess > 0.0) {
        return Err(seed_error(format!("focal length guess {focal_guess} is not positive")).into());
    }

    let cx = imager_size[0] as f64 / 2.0 - 0.5;
    let cy = imager_size[1] as f64 / 2.0 - 0.5;
    let intrinsics = [focal_guess, focal_guess, cx, cy];

    // Normalized pinhole coordinates of the usable corners; `None` elsewhere
    let mut normalized: Vec<Option<Vector2<f64>>> = Vec::with_capacity(pixels.len());
    for px in pixels {
        if px.is_outlier() {
            normalized.push(None);
            continue;
        }
        let ray = LensModel::Stereographic.unproject(&Vector2::new(px.x, px.y), &intrinsics)?;
        normalized.push(ray.filter(|v| v.z > 0.0).map(|v| Vector2::new(v.x / v.z, v.y / v.z)));
    }

    let (board, image): (Vec<Vector2<f64>>, Vec<Vector2<f64>>) = normalized
        .iter()
        .enumerate()
        .filter_map(|(k, m)| {
            let (i, j) = (k % object.width, k / object.width);
            m.map(|m| {
                let corner = Vector2::new(i as f64 * object.spacing, j as f64 * object.spacing);
                (corner, m)
            })
        })
        .unzip();
    if board.len() < MIN_CORNERS {
        return Err(seed_error(format!(
            "{} usable corners, need at least {MIN_CORNERS}",
            board.len()
        ))
        .into());
    }

    let linear = fit_homography(&board, &image)
        .and_then(|h| pose_from_homography(&h))
        .ok_or_else(|| seed_error("degenerate board view"))?;
    refine(linear, &normalized, object, imager_size, &intrinsics)
}

/// Minimize the pinhole reprojection error of the flat board over its pose
fn refine(
    linear: Pose,
    normalized: &[Option<Vector2<f64>>],
    object: &CalibrationObject,
    imager_size: [usize; 2],
    intrinsics: &[f64; 4],
) -> ApexCalibResult<Pose> {
    let [f, _, cx, cy] = *intrinsics;
    let pixels: Vec<ObservedPixel> = normalized
        .iter()
        .map(|m| match m {
            Some(m) => ObservedPixel::new(f * m.x + cx, f * m.y + cy, 1.0),
            None => ObservedPixel::new(cx, cy, -1.0),
        })
        .collect();
    let mut observations = Observations::new();
    observations.add_board(CameraIndex::reference(0), 0, &pixels);

    let state = CalibrationState {
        intrinsics: vec![DVector::from_row_slice(intrinsics.as_slice())],
        frames: vec![linear],
        ..Default::default()
    };
    let spec = CalibrationProblemSpec::new(LensModel::Pinhole, vec![imager_size])
        .with_calibration_object(*object)
        .with_selections(ProblemSelections::none().with_frames(true));
    let problem = CalibrationProblem::new(&spec, &state, &observations)?;

    let mut solver = LevenbergMarquardt::with_config(LevenbergMarquardtConfig::default());
    let result = solver.optimize(&problem, &problem.pack_state()?)?;
    if !result.status.is_success() {
        return Err(CalibrationError::SolverFailed {
            status: result.status,
        }
        .log()
        .into());
    }
    let mut refined = state.clone();
    problem.unpack_state(&result.parameters, &mut refined)?;
    debug!(
        "Seeded board pose after {} iterations (cost {:.3e} -> {:.3e})",
        result.iterations, result.initial_cost, result.final_cost
    );
    Ok(refined.frames[0])
}

/// Seed every board observation, each in its own camera's frame
pub fn seed_board_poses(
    observations: &Observations,
    spec: &CalibrationProblemSpec,
    focal_guess: f64,
) -> ApexCalibResult<Vec<Pose>> {
    let object = spec
        .calibration_object
        .as_ref()
        .ok_or_else(|| seed_error("no calibration object"))?;
    observations
        .boards
        .iter()
        .enumerate()
        .map(|(k, observation)| {
            let imager_size = spec
                .imager_sizes
                .get(observation.camera.intrinsics)
                .copied()
                .ok_or_else(|| {
                    seed_error(format!(
                        "board observation {k}: no imager size for camera {}",
                        observation.camera.intrinsics
                    ))
                })?;
            seed_board_pose(
                observations.board(k, object.num_corners()),
                object,
                imager_size,
                focal_guess,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const IMAGER: [usize; 2] = [1280, 960];
    const FOCAL: f64 = 900.0;

    fn object() -> CalibrationObject {
        CalibrationObject::new(9, 7, 0.04)
    }

    fn stereographic_intrinsics() -> [f64; 4] {
        [FOCAL, FOCAL, 639.5, 479.5]
    }

    fn render(pose: &Pose, object: &CalibrationObject) -> Result<Vec<ObservedPixel>, Box<dyn std::error::Error>> {
        let mut pixels = Vec::with_capacity(object.num_corners());
        for j in 0..object.height {
            for i in 0..object.width {
                let p = pose.transform_point(&object.corner(i, j, &Default::default()));
                let q = LensModel::Stereographic
                    .project(&p, &stereographic_intrinsics())
                    .ok_or("corner behind the camera")?;
                pixels.push(ObservedPixel::new(q.x, q.y, 1.0));
            }
        }
        Ok(pixels)
    }

    fn assert_close(a: &Pose, b: &Pose, tolerance: f64) {
        assert!((a.r - b.r).norm() < tolerance, "r {} vs {}", a.r, b.r);
        assert!((a.t - b.t).norm() < tolerance, "t {} vs {}", a.t, b.t);
    }

    #[test]
    fn test_homography_of_a_known_plane() -> TestResult {
        let pose = Pose::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.1, 0.05, 1.5));
        let board: Vec<Vector2<f64>> = (0..12)
            .map(|k| Vector2::new(0.05 * (k % 4) as f64, 0.05 * (k / 4) as f64))
            .collect();
        let image: Vec<Vector2<f64>> = board
            .iter()
            .map(|b| {
                let p = pose.transform_point(&Vector3::new(b.x, b.y, 0.0));
                Vector2::new(p.x / p.z, p.y / p.z)
            })
            .collect();
        let homography = fit_homography(&board, &image).ok_or("no homography")?;
        for (b, i) in board.iter().zip(&image) {
            assert!((apply(&homography, b) - i).norm() < 1e-10);
        }
        let recovered = pose_from_homography(&homography).ok_or("no pose")?;
        assert_close(&recovered, &pose, 1e-8);
        Ok(())
    }

    #[test]
    fn test_stereographic_view_is_recovered_exactly() -> TestResult {
        let object = object();
        for pose in [
            Pose::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(-0.16, -0.12, 0.8)),
            Pose::new(Vector3::new(0.3, -0.25, 0.1), Vector3::new(-0.3, 0.1, 1.2)),
            Pose::new(Vector3::new(-0.2, 0.4, -0.3), Vector3::new(0.05, -0.2, 0.6)),
        ] {
            let pixels = render(&pose, &object)?;
            let seeded = seed_board_pose(&pixels, &object, IMAGER, FOCAL)?;
            assert_close(&seeded, &pose, 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_negative_weight_corners_are_skipped() -> TestResult {
        let object = object();
        let pose = Pose::new(Vector3::new(0.15, 0.1, 0.0), Vector3::new(-0.2, -0.1, 1.0));
        let mut pixels = render(&pose, &object)?;
        for k in [0, 10, 33, 62] {
            pixels[k] = ObservedPixel::new(5000.0, -3000.0, -1.0);
        }
        let seeded = seed_board_pose(&pixels, &object, IMAGER, FOCAL)?;
        assert_close(&seeded, &pose, 1e-6);
        Ok(())
    }

    #[test]
    fn test_unusable_views_are_refused() -> TestResult {
        let object = object();
        let pose = Pose::new(Vector3::zeros(), Vector3::new(-0.16, -0.12, 0.8));
        let mut pixels = render(&pose, &object)?;
        assert!(seed_board_pose(&pixels[1..], &object, IMAGER, FOCAL).is_err());
        assert!(seed_board_pose(&pixels, &object, IMAGER, 0.0).is_err());

        pixels.iter_mut().skip(3).for_each(|px| px.mark_outlier());
        assert!(seed_board_pose(&pixels, &object, IMAGER, FOCAL).is_err());
        Ok(())
    }

    #[test]
    fn test_every_board_observation_is_seeded() -> TestResult {
        let object = object();
        let poses = [
            Pose::new(Vector3::new(0.1, 0.0, 0.0), Vector3::new(-0.16, -0.12, 0.9)),
            Pose::new(Vector3::new(0.0, -0.2, 0.1), Vector3::new(-0.1, -0.1, 1.1)),
        ];
        let mut observations = Observations::new();
        for (k, pose) in poses.iter().enumerate() {
            observations.add_board(CameraIndex::new(k, (k > 0).then_some(0)), k, &render(pose, &object)?);
        }
        let spec = CalibrationProblemSpec::new(LensModel::Stereographic, vec![IMAGER; 2])
            .with_calibration_object(object);
        let seeds = seed_board_poses(&observations, &spec, FOCAL)?;
        assert_eq!(seeds.len(), 2);
        for (seeded, pose) in seeds.iter().zip(&poses) {
            assert_close(seeded, pose, 1e-6);
        }

        let no_board = CalibrationProblemSpec::new(LensModel::Stereographic, vec![IMAGER; 2]);
        assert!(seed_board_poses(&observations, &no_board, FOCAL).is_err());
        Ok(())
    }
}
