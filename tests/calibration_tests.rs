//! End-to-end calibration tests on synthetic scenes.
//!
//! Every scene is rendered from a known ground truth with the crate's own
//! projection, then solved from a perturbed seed. The tests check that the
//! solver recovers the truth, that outlier rejection finds corrupted corners,
//! and that bad inputs are refused before any solve starts.
//!
//! # Test Coverage
//!
//! - **Boards**: two OpenCV cameras observing a chessboard in several poses
//! - **Points**: discrete points, some of them fixed to anchor the scale
//! - **Triangulated**: features seen by three cameras with fixed intrinsics
//! - **Outliers**: corners pushed far off their true position
//! - **Seeds**: frame poses seeded from the reference camera's corners
//! - **Validation**: inconsistent indices and selections

use apex_calib::calibration::{CalibrationConfig, OutlierConfig, optimize, seed_board_poses};
use apex_calib::core::{
    CalibrationObject, CalibrationProblem, CalibrationProblemSpec, CalibrationState, CameraIndex,
    CoreError, ObservedPixel, Observations, ProblemSelections,
};
use apex_calib::geometry::Pose;
use apex_calib::lensmodel::LensModel;
use apex_calib::optimizer::LevenbergMarquardtConfig;
use apex_calib::{ApexCalibError, OptimizationStatus};
use nalgebra::{DVector, Vector2, Vector3};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const IMAGER: [usize; 2] = [640, 480];

/// Route solver logs through the test harness; `RUST_LOG=debug` shows the
/// iteration tables
fn init_logging() {
    #[cfg(feature = "logging")]
    apex_calib::try_init_logger_with_level(tracing::Level::WARN);
}

/// Deterministic noise in `[-amplitude/2, amplitude/2)`
fn noise(k: usize, amplitude: f64) -> f64 {
    let x = ((k as f64 + 1.0) * 12.9898).sin() * 43758.5453;
    (x.rem_euclid(1.0) - 0.5) * amplitude
}

fn project(
    model: &LensModel,
    intrinsics: &DVector<f64>,
    camera: Option<&Pose>,
    p_ref: &Vector3<f64>,
) -> Result<Vector2<f64>, Box<dyn std::error::Error>> {
    let p_cam = camera.map_or(*p_ref, |pose| pose.transform_point(p_ref));
    Ok(model
        .project(&p_cam, intrinsics.as_slice())
        .ok_or("point behind the camera")?)
}

fn board() -> CalibrationObject {
    CalibrationObject::new(10, 8, 0.05)
}

/// Board poses in front of the reference camera, tilted in turn about both axes
fn board_frames() -> Vec<Pose> {
    let tilts = [
        (0.0, 0.0),
        (0.25, 0.0),
        (-0.25, 0.0),
        (0.0, 0.25),
        (0.0, -0.25),
        (0.2, 0.2),
        (-0.2, 0.15),
        (0.15, -0.2),
    ];
    tilts
        .iter()
        .enumerate()
        .map(|(k, &(rx, ry))| {
            Pose::new(
                Vector3::new(rx, ry, 0.05 * (k as f64 - 3.5) / 3.5),
                Vector3::new(-0.225 + 0.02 * k as f64 - 0.07, -0.175, 0.9 + 0.05 * k as f64),
            )
        })
        .collect()
}

fn two_camera_truth(distortions: [f64; 4]) -> CalibrationState {
    let [k1, k2, p1, p2] = distortions;
    CalibrationState {
        intrinsics: vec![
            DVector::from_vec(vec![600.0, 600.0, 319.5, 239.5, k1, k2, p1, p2]),
            DVector::from_vec(vec![610.0, 605.0, 319.5, 239.5, k1, k2, p1, p2]),
        ],
        extrinsics: vec![Pose::new(
            Vector3::new(0.0, 0.05, 0.0),
            Vector3::new(-0.15, 0.0, 0.0),
        )],
        frames: board_frames(),
        ..Default::default()
    }
}

/// Render every board pose into both cameras
fn observe_boards(
    model: &LensModel,
    truth: &CalibrationState,
    object: &CalibrationObject,
    noise_amplitude: f64,
) -> Result<Observations, Box<dyn std::error::Error>> {
    let mut observations = Observations::new();
    let mut k = 0;
    for (iframe, frame) in truth.frames.iter().enumerate() {
        for (icam, camera) in [None, Some(0)].into_iter().enumerate() {
            let mut pixels = Vec::with_capacity(object.num_corners());
            for j in 0..object.height {
                for i in 0..object.width {
                    let p_ref = frame.transform_point(&object.corner(i, j, &truth.calobject_warp));
                    let q = project(
                        model,
                        &truth.intrinsics[icam],
                        camera.map(|e: usize| &truth.extrinsics[e]),
                        &p_ref,
                    )?;
                    pixels.push(ObservedPixel::new(
                        q.x + noise(k, noise_amplitude),
                        q.y + noise(k + 1, noise_amplitude),
                        1.0,
                    ));
                    k += 2;
                }
            }
            observations.add_board(CameraIndex::new(icam, camera), iframe, &pixels);
        }
    }
    Ok(observations)
}

fn perturb(pose: &Pose, k: usize) -> Pose {
    Pose::new(
        pose.r + Vector3::new(0.02, -0.015, 0.01) * (1.0 + 0.1 * k as f64),
        pose.t + Vector3::new(-0.01, 0.015, 0.02),
    )
}

fn pose_error(a: &Pose, b: &Pose) -> f64 {
    (a.r - b.r).norm().max((a.t - b.t).norm())
}

fn solver_config() -> LevenbergMarquardtConfig {
    LevenbergMarquardtConfig::new().with_max_iterations(200)
}

#[test]
fn test_noise_free_boards_recover_truth() -> TestResult {
    init_logging();
    let model = LensModel::OpenCv4;
    let object = board();
    let truth = two_camera_truth([0.0; 4]);
    let mut observations = observe_boards(&model, &truth, &object, 0.0)?;

    let mut state = truth.clone();
    state.intrinsics[0][0] = 580.0;
    state.intrinsics[0][3] = 245.0;
    state.intrinsics[1][1] = 620.0;
    state.intrinsics[1][4] = 0.01;
    state.extrinsics[0] = perturb(&truth.extrinsics[0], 0);
    for (k, frame) in state.frames.iter_mut().enumerate() {
        *frame = perturb(frame, k);
    }

    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2])
        .with_calibration_object(object)
        .with_selections(ProblemSelections::default().with_outlier_rejection(false));
    let config = CalibrationConfig::new().with_solver(solver_config());
    let report = optimize(&mut state, &mut observations, &spec, &config)?;

    assert!(report.stats.status.is_success(), "status {}", report.stats.status);
    assert!(
        report.stats.rms_reproj_error_pixels < 1e-6,
        "RMS {}",
        report.stats.rms_reproj_error_pixels
    );
    assert_eq!(report.stats.outlier_rounds, 0);
    for (solved, expected) in state.intrinsics.iter().zip(&truth.intrinsics) {
        assert!((solved - expected).amax() < 1e-4, "{solved} vs {expected}");
    }
    assert!(pose_error(&state.extrinsics[0], &truth.extrinsics[0]) < 1e-6);
    for (solved, expected) in state.frames.iter().zip(&truth.frames) {
        assert!(pose_error(solved, expected) < 1e-6);
    }
    Ok(())
}

#[test]
fn test_seeded_frames_calibrate() -> TestResult {
    init_logging();
    let model = LensModel::OpenCv4;
    let object = board();
    let truth = two_camera_truth([0.0; 4]);
    let mut observations = observe_boards(&model, &truth, &object, 0.0)?;
    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2])
        .with_calibration_object(object)
        .with_selections(ProblemSelections::default().with_outlier_rejection(false));

    // The reference camera's views are the frame poses
    let seeds = seed_board_poses(&observations, &spec, 600.0)?;
    assert_eq!(seeds.len(), observations.boards.len());
    let mut state = truth.clone();
    for (observation, seed) in observations.boards.iter().zip(&seeds) {
        if observation.camera.extrinsics.is_none() {
            assert!(pose_error(seed, &truth.frames[observation.frame]) < 0.1);
            state.frames[observation.frame] = *seed;
        }
    }
    state.extrinsics[0] = perturb(&truth.extrinsics[0], 0);
    state.intrinsics[1][0] = 590.0;

    let config = CalibrationConfig::new().with_solver(solver_config());
    let report = optimize(&mut state, &mut observations, &spec, &config)?;
    assert!(
        report.stats.rms_reproj_error_pixels < 1e-6,
        "RMS {}",
        report.stats.rms_reproj_error_pixels
    );
    for (solved, expected) in state.frames.iter().zip(&truth.frames) {
        assert!(pose_error(solved, expected) < 1e-6);
    }
    Ok(())
}

#[test]
fn test_corrupted_corners_are_rejected() -> TestResult {
    init_logging();
    let model = LensModel::OpenCv4;
    let object = board();
    let truth = two_camera_truth([-0.05, 0.01, 0.0005, -0.0005]);
    let mut observations = observe_boards(&model, &truth, &object, 0.3)?;

    let corrupted = [17, 250, 901];
    for &k in &corrupted {
        observations.board_pixels[k].x += 25.0;
        observations.board_pixels[k].y -= 15.0;
    }

    let mut state = truth.clone();
    state.extrinsics[0] = perturb(&truth.extrinsics[0], 0);
    for frame in &mut state.frames {
        *frame = perturb(frame, 1);
    }

    let seed = state.clone();
    let mut inliers_only = observations.clone();
    for &k in &corrupted {
        inliers_only.board_pixels[k].mark_outlier();
    }

    let spec =
        CalibrationProblemSpec::new(model, vec![IMAGER; 2]).with_calibration_object(object);
    let config = CalibrationConfig::new()
        .with_solver(solver_config())
        .with_outliers(OutlierConfig::default());
    let report = optimize(&mut state, &mut observations, &spec, &config)?;

    let marked: Vec<usize> = observations
        .board_pixels
        .iter()
        .enumerate()
        .filter(|(_, px)| px.is_outlier())
        .map(|(k, _)| k)
        .collect();
    assert_eq!(marked, corrupted);
    assert_eq!(report.stats.outlier_rounds, 1);
    assert_eq!(report.stats.n_outliers_board, corrupted.len());
    // Uniform noise of width 0.3 has σ ≈ 0.087
    assert!(
        report.stats.rms_reproj_error_pixels < 0.15,
        "RMS {}",
        report.stats.rms_reproj_error_pixels
    );
    assert!(pose_error(&state.extrinsics[0], &truth.extrinsics[0]) < 1e-2);

    // Same fit as a solve that never saw the corrupted corners
    let mut reference = seed;
    let reference_spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2])
        .with_calibration_object(object)
        .with_selections(ProblemSelections::default().with_outlier_rejection(false));
    let reference_report = optimize(
        &mut reference,
        &mut inliers_only,
        &reference_spec,
        &CalibrationConfig::new().with_solver(solver_config()),
    )?;
    assert_eq!(reference_report.stats.outlier_rounds, 0);
    for (solved, expected) in state.intrinsics.iter().zip(&reference.intrinsics) {
        for (a, b) in solved.iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-5 * (1.0 + b.abs()), "{solved} vs {expected}");
        }
    }
    let (a, b) = (&state.extrinsics[0], &reference.extrinsics[0]);
    assert!((a.r - b.r).norm() <= 1e-5 * (1.0 + b.r.norm()));
    assert!((a.t - b.t).norm() <= 1e-5 * (1.0 + b.t.norm()));
    Ok(())
}

#[test]
fn test_points_with_fixed_anchors() -> TestResult {
    init_logging();
    let model = LensModel::Pinhole;
    let intrinsics = DVector::from_vec(vec![500.0, 500.0, 319.5, 239.5]);
    let extrinsics = Pose::new(Vector3::new(0.0, -0.04, 0.01), Vector3::new(-0.3, 0.02, 0.0));
    let points: Vec<Vector3<f64>> = (0..12)
        .map(|k| {
            let k = k as f64;
            Vector3::new(-0.6 + 0.11 * k, 0.3 * (0.7 * k).sin(), 2.0 + 0.15 * k)
        })
        .collect();
    let truth = CalibrationState {
        intrinsics: vec![intrinsics.clone(), intrinsics.clone()],
        extrinsics: vec![extrinsics],
        points: points.clone(),
        n_points_fixed: 4,
        ..Default::default()
    };

    let mut observations = Observations::new();
    for (ipoint, p) in points.iter().enumerate() {
        for (icam, camera) in [None, Some(0)].into_iter().enumerate() {
            let q = project(&model, &intrinsics, camera.map(|_| &extrinsics), p)?;
            observations.add_point(
                CameraIndex::new(icam, camera),
                ipoint,
                ObservedPixel::new(q.x, q.y, 1.0),
            );
        }
    }

    let mut state = truth.clone();
    state.extrinsics[0] = perturb(&extrinsics, 0);
    for p in state.points.iter_mut().take(8) {
        *p += Vector3::new(0.03, -0.02, 0.05);
    }

    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2]).with_selections(
        ProblemSelections::default()
            .with_intrinsics_core(false)
            .with_intrinsics_distortions(false)
            .with_outlier_rejection(false),
    );
    let config = CalibrationConfig::new().with_solver(solver_config());
    let report = optimize(&mut state, &mut observations, &spec, &config)?;

    assert!(report.stats.rms_reproj_error_pixels < 1e-6);
    assert!(pose_error(&state.extrinsics[0], &extrinsics) < 1e-6);
    for (solved, expected) in state.points.iter().zip(&points) {
        assert!((solved - expected).norm() < 1e-6);
    }
    // Fixed points are never touched
    assert_eq!(&state.points[8..], &points[8..]);
    assert_eq!(state.intrinsics, truth.intrinsics);
    Ok(())
}

#[test]
fn test_zero_noise_pinhole_seeded_at_truth() -> TestResult {
    init_logging();
    let model = LensModel::Pinhole;
    let intrinsics = DVector::from_vec(vec![500.0, 510.0, 319.5, 239.5]);
    // Unit baseline, so the unity-cam01 term is satisfied at the truth
    let extrinsics = Pose::new(Vector3::new(0.02, -0.1, 0.0), Vector3::new(-0.6, 0.0, 0.8));
    let points: Vec<Vector3<f64>> = (0..8)
        .map(|k| {
            let k = k as f64;
            Vector3::new(-0.8 + 0.2 * k, 0.4 * (0.9 * k).cos(), 3.0 + 0.25 * k)
        })
        .collect();
    let truth = CalibrationState {
        intrinsics: vec![intrinsics.clone(), intrinsics.clone()],
        extrinsics: vec![extrinsics],
        points: points.clone(),
        ..Default::default()
    };

    let mut observations = Observations::new();
    for (ipoint, p) in points.iter().enumerate() {
        for (icam, camera) in [None, Some(0)].into_iter().enumerate() {
            let q = project(&model, &intrinsics, camera.map(|_| &extrinsics), p)?;
            observations.add_point(
                CameraIndex::new(icam, camera),
                ipoint,
                ObservedPixel::new(q.x, q.y, 1.0),
            );
        }
    }

    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2])
        .with_selections(ProblemSelections::default().with_unity_cam01(true));
    let mut state = truth.clone();
    let report = optimize(&mut state, &mut observations, &spec, &CalibrationConfig::default())?;

    assert!(report.stats.status.is_success());
    assert!(report.stats.rms_reproj_error_pixels < 1e-6);
    assert_eq!(report.stats.n_outliers_point, 0);
    assert_eq!(report.stats.outlier_rounds, 0);
    for (solved, expected) in state.points.iter().zip(&points) {
        assert!((solved - expected).norm() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_triangulated_features_refine_extrinsics() -> TestResult {
    init_logging();
    let model = LensModel::Pinhole;
    let object = board();
    let intrinsics = DVector::from_vec(vec![600.0, 600.0, 319.5, 239.5]);
    let cameras = [
        Pose::new(Vector3::new(0.0, 0.05, 0.0), Vector3::new(-0.15, 0.0, 0.0)),
        Pose::new(Vector3::new(0.03, -0.04, 0.0), Vector3::new(0.12, -0.05, 0.01)),
    ];
    let truth = CalibrationState {
        intrinsics: vec![intrinsics.clone(); 3],
        extrinsics: cameras.to_vec(),
        frames: board_frames().into_iter().take(3).collect(),
        ..Default::default()
    };

    // The boards fix the scale, the triangulated features add geometry
    let mut observations = Observations::new();
    for (iframe, frame) in truth.frames.iter().enumerate() {
        for icam in 0..3usize {
            let camera = icam.checked_sub(1);
            let mut pixels = Vec::with_capacity(object.num_corners());
            for j in 0..object.height {
                for i in 0..object.width {
                    let p_ref = frame.transform_point(&object.corner(i, j, &truth.calobject_warp));
                    let q = project(&model, &intrinsics, camera.map(|e| &cameras[e]), &p_ref)?;
                    pixels.push(ObservedPixel::new(q.x, q.y, 1.0));
                }
            }
            observations.add_board(CameraIndex::new(icam, camera), iframe, &pixels);
        }
    }
    let features: Vec<Vector3<f64>> = (0..10)
        .map(|k| {
            let k = k as f64;
            Vector3::new(-0.5 + 0.1 * k, 0.2 * (1.3 * k).cos(), 2.5 + 0.2 * k)
        })
        .collect();
    for p in &features {
        let mut rays = Vec::with_capacity(3);
        for icam in 0..3usize {
            let camera = icam.checked_sub(1);
            let q = project(&model, &intrinsics, camera.map(|e| &cameras[e]), p)?;
            rays.push((CameraIndex::new(icam, camera), ObservedPixel::new(q.x, q.y, 1.0)));
        }
        observations.add_triangulated_set(&rays);
    }

    let mut state = truth.clone();
    for (k, pose) in state.extrinsics.iter_mut().enumerate() {
        *pose = perturb(pose, k);
    }

    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 3])
        .with_calibration_object(object)
        .with_selections(
            ProblemSelections::default()
                .with_intrinsics_core(false)
                .with_intrinsics_distortions(false)
                .with_outlier_rejection(false),
        );
    let config = CalibrationConfig::new().with_solver(solver_config());
    let report = optimize(&mut state, &mut observations, &spec, &config)?;

    assert!(report.stats.rms_reproj_error_pixels < 1e-6);
    assert!(
        report.stats.rms_triangulated_error_pixels < 1e-5,
        "triangulated RMS {}",
        report.stats.rms_triangulated_error_pixels
    );
    for (solved, expected) in state.extrinsics.iter().zip(&cameras) {
        assert!(pose_error(solved, expected) < 1e-6);
    }
    assert_eq!(report.triangulated_points.len(), features.len());
    for (solved, expected) in report.triangulated_points.iter().zip(&features) {
        let solved = solved.ok_or("feature was not triangulated")?;
        assert!((solved - expected).norm() < 1e-4, "{solved} vs {expected}");
    }
    Ok(())
}

#[test]
fn test_pack_unpack_restores_state() -> TestResult {
    let model = LensModel::OpenCv4;
    let object = board();
    let truth = two_camera_truth([-0.05, 0.01, 0.0005, -0.0005]);
    let observations = observe_boards(&model, &truth, &object, 0.0)?;
    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2])
        .with_calibration_object(object)
        .with_selections(ProblemSelections::default().with_calobject_warp(true));

    let problem = CalibrationProblem::new(&spec, &truth, &observations)?;
    let packed = problem.pack_state()?;
    assert_eq!(packed.len(), problem.schema().num_states());

    let mut restored = truth.clone();
    restored.intrinsics.iter_mut().for_each(|i| i.fill(0.0));
    restored.frames.iter_mut().for_each(|f| *f = Pose::identity());
    problem.unpack_state(&packed, &mut restored)?;

    for (a, b) in restored.intrinsics.iter().zip(&truth.intrinsics) {
        assert!((a - b).amax() < 1e-9);
    }
    for (a, b) in restored.frames.iter().zip(&truth.frames) {
        assert!(pose_error(a, b) < 1e-12);
    }

    // The truth reprojects exactly
    let (residuals, jacobian) = problem.callback(&packed, true)?;
    let jacobian = jacobian.ok_or("missing Jacobian")?;
    assert_eq!(jacobian.nrows(), problem.layout().num_measurements());
    assert_eq!(jacobian.ncols(), problem.schema().num_states());
    let board_rows = problem.layout().board.clone();
    for row in board_rows {
        assert!(residuals[(row, 0)].abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn test_board_observation_with_missing_frame_is_refused() -> TestResult {
    let model = LensModel::OpenCv4;
    let object = board();
    let truth = two_camera_truth([0.0; 4]);
    let mut observations = observe_boards(&model, &truth, &object, 0.0)?;
    let pixels = observations.board(0, object.num_corners()).to_vec();
    observations.add_board(CameraIndex::reference(0), truth.frames.len(), &pixels);

    let spec = CalibrationProblemSpec::new(model, vec![IMAGER; 2]).with_calibration_object(object);
    let mut state = truth.clone();
    match optimize(&mut state, &mut observations, &spec, &CalibrationConfig::default()) {
        Err(ApexCalibError::Core(CoreError::IndexOutOfRange(_))) => {}
        other => panic!("expected IndexOutOfRange, got {other:?}"),
    }
    // Nothing was solved
    assert_eq!(state, truth);
    Ok(())
}

#[test]
fn test_triangulated_with_free_intrinsics_is_refused() {
    let intrinsics = DVector::from_vec(vec![600.0, 600.0, 319.5, 239.5]);
    let state = CalibrationState {
        intrinsics: vec![intrinsics.clone(), intrinsics],
        extrinsics: vec![Pose::new(Vector3::zeros(), Vector3::new(-0.1, 0.0, 0.0))],
        ..Default::default()
    };
    let mut observations = Observations::new();
    let px = ObservedPixel::new(320.0, 240.0, 1.0);
    observations.add_triangulated_set(&[
        (CameraIndex::reference(0), px),
        (CameraIndex::new(1, Some(0)), px),
    ]);
    let spec = CalibrationProblemSpec::new(LensModel::Pinhole, vec![IMAGER; 2]);

    match CalibrationProblem::new(&spec, &state, &observations) {
        Err(CoreError::IncompatibleSelections(_)) => {}
        other => panic!("expected IncompatibleSelections, got {other:?}"),
    }
}

#[test]
fn test_solver_status_reports_success() {
    assert!(OptimizationStatus::MaxIterationsReached.is_success());
    assert!(!OptimizationStatus::InvalidNumericalValues.is_success());
}
