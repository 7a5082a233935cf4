//! The calibration entry point.
//!
//! [`optimize`] runs the solve → classify → mark → re-solve loop:
//!
//! ```text
//! loop {
//!     solve the problem from the current state
//!     classify the residuals
//!     if nothing new or out of rounds: done
//!     mark, re-solve from the solution
//! }
//! ```
//!
//! The state is updated in place after every solve; observations are only
//! changed by [`outliers::mark`] between solves.

pub mod outliers;
pub mod seed;

pub use outliers::{Classification, MarkSummary, OutlierConfig, classify, mark};
pub use seed::{seed_board_pose, seed_board_poses};

use crate::core::{
    CalibrationProblem, CalibrationProblemSpec, CalibrationState, MeasurementLayout,
    Observations,
};
use crate::error::ApexCalibResult;
use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus};
use faer::Mat;
use nalgebra::{DVector, Vector3};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Whole-solve failures
#[derive(Debug, Clone, Error)]
pub enum CalibrationError {
    /// The solver broke down; no partial result is returned
    #[error("Solver failed: {status}")]
    SolverFailed { status: OptimizationStatus },

    /// A board view gave no usable pose seed
    #[error("Cannot seed board pose: {0}")]
    SeedFailed(String),
}

impl CalibrationError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Everything [`optimize`] needs besides the problem itself
#[derive(Debug, Clone, Default)]
pub struct CalibrationConfig {
    pub solver: LevenbergMarquardtConfig,
    pub outliers: OutlierConfig,
}

impl CalibrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_solver(mut self, solver: LevenbergMarquardtConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_outliers(mut self, outliers: OutlierConfig) -> Self {
        self.outliers = outliers;
        self
    }
}

/// Fit quality of a finished calibration
#[derive(Debug, Clone, PartialEq)]
pub struct SolveStats {
    /// RMS over inlier board and point pixel coordinates, weights applied
    pub rms_reproj_error_pixels: f64,
    /// RMS over inlier triangulated pairs, in pixel-equivalent units
    pub rms_triangulated_error_pixels: f64,
    pub n_outliers_board: usize,
    pub n_outliers_point: usize,
    pub n_outliers_triangulated: usize,
    /// Rounds that marked new outliers
    pub outlier_rounds: usize,
    /// Solver status of the last solve
    pub status: OptimizationStatus,
    /// Solver iterations summed over all rounds
    pub iterations: usize,
}

/// Result of [`optimize`]
#[derive(Debug, Clone)]
pub struct OptimizeReport {
    /// Residuals at the solution, in layout order
    pub residuals: DVector<f64>,
    /// Packed state at the solution
    pub packed: DVector<f64>,
    pub stats: SolveStats,
    /// Reference-frame position of each triangulated feature, from its inlier rays
    pub triangulated_points: Vec<Option<Vector3<f64>>>,
}

/// Output of one solve, detached from the borrowed problem
struct Round {
    packed: DVector<f64>,
    residuals: Mat<f64>,
    layout: MeasurementLayout,
    classification: Option<Classification>,
    triangulated_points: Vec<Option<Vector3<f64>>>,
    status: OptimizationStatus,
    iterations: usize,
}

fn solve_round(
    state: &CalibrationState,
    observations: &Observations,
    spec: &CalibrationProblemSpec,
    config: &CalibrationConfig,
) -> ApexCalibResult<(CalibrationState, Round)> {
    let problem = CalibrationProblem::new(spec, state, observations)?;
    let initial = problem.pack_state()?;

    let mut solver = LevenbergMarquardt::with_config(config.solver.clone());
    let result = solver.optimize(&problem, &initial)?;
    if !result.status.is_success() {
        return Err(CalibrationError::SolverFailed {
            status: result.status,
        }
        .log()
        .into());
    }
    debug!(
        "Solve finished after {} iterations: {} (cost {:.6e} -> {:.6e})",
        result.iterations, result.status, result.initial_cost, result.final_cost
    );

    let packed = result.parameters;
    let (residuals, _) = problem.callback(&packed, false)?;
    let classification = if spec.selections.apply_outlier_rejection {
        let divergent = problem.assembler().divergent_pairs(&packed)?;
        Some(classify(
            &residuals,
            problem.layout(),
            observations,
            &divergent,
            &config.outliers,
        ))
    } else {
        None
    };

    let mut solved = state.clone();
    problem.unpack_state(&packed, &mut solved)?;
    let round = Round {
        triangulated_points: problem.assembler().triangulated_points(&packed)?,
        layout: problem.layout().clone(),
        packed,
        residuals,
        classification,
        status: result.status,
        iterations: result.iterations,
    };
    Ok((solved, round))
}

/// Calibrate: solve, reject outliers and re-solve until nothing new is found.
///
/// `state` holds the seed on entry and the solution on return. Outliers found
/// along the way are marked in `observations`.
///
/// # Example
///
/// ```no_run
/// use apex_calib::calibration::{CalibrationConfig, optimize};
/// use apex_calib::core::{CalibrationProblemSpec, CalibrationState, Observations};
/// use apex_calib::lensmodel::LensModel;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let spec = CalibrationProblemSpec::new(LensModel::OpenCv8, vec![[1280, 960]; 2]);
/// let mut state = CalibrationState::default();
/// let mut observations = Observations::new();
/// // ... seed the state, add observations ...
///
/// let report = optimize(&mut state, &mut observations, &spec, &CalibrationConfig::default())?;
/// println!("RMS reprojection error: {:.3} px", report.stats.rms_reproj_error_pixels);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub fn optimize(
    state: &mut CalibrationState,
    observations: &mut Observations,
    spec: &CalibrationProblemSpec,
    config: &CalibrationConfig,
) -> ApexCalibResult<OptimizeReport> {
    info!(
        "Calibrating {} cameras with {} board, {} point and {} triangulated observations",
        state.intrinsics.len(),
        observations.boards.len(),
        observations.points.len(),
        observations.triangulated.len()
    );

    let mut outlier_rounds = 0;
    let mut iterations = 0;
    loop {
        let (solved, mut round) = solve_round(state, observations, spec, config)?;
        *state = solved;
        iterations += round.iterations;

        let classification = match round.classification.take() {
            Some(classification) if classification.found_new && !classification.is_empty() => {
                classification
            }
            _ => return Ok(finish(round, observations, outlier_rounds, iterations)),
        };
        if outlier_rounds >= config.outliers.max_iterations {
            warn!(
                "Stopped outlier rejection after {} rounds with outliers still being found",
                outlier_rounds
            );
            return Ok(finish(round, observations, outlier_rounds, iterations));
        }

        let marked = mark(&classification, observations);
        outlier_rounds += 1;
        info!(
            "Outlier round {}: marked {} board corners, {} points, {} triangulated observations (σ = {:.3})",
            outlier_rounds,
            marked.board_corners,
            marked.points,
            marked.triangulated,
            classification.variance.sqrt()
        );
    }
}

fn finish(
    round: Round,
    observations: &Observations,
    outlier_rounds: usize,
    iterations: usize,
) -> OptimizeReport {
    let residuals = DVector::from_fn(round.residuals.nrows(), |i, _| round.residuals[(i, 0)]);
    let layout = &round.layout;
    let stats = SolveStats {
        rms_reproj_error_pixels: rms_reprojection_error(&residuals, layout, observations),
        rms_triangulated_error_pixels: rms_triangulated_error(&residuals, layout, observations),
        n_outliers_board: observations.num_board_outliers(),
        n_outliers_point: observations.num_point_outliers(),
        n_outliers_triangulated: observations.num_triangulated_outliers(),
        outlier_rounds,
        status: round.status,
        iterations,
    };
    info!(
        "Calibration done: RMS reprojection error {:.4} px, {} outliers",
        stats.rms_reproj_error_pixels,
        stats.n_outliers_board + stats.n_outliers_point + stats.n_outliers_triangulated
    );
    OptimizeReport {
        residuals,
        packed: round.packed,
        stats,
        triangulated_points: round.triangulated_points,
    }
}

/// RMS over inlier pixel coordinates of boards and points
pub fn rms_reprojection_error(
    residuals: &DVector<f64>,
    layout: &MeasurementLayout,
    observations: &Observations,
) -> f64 {
    let board = observations
        .board_pixels
        .iter()
        .enumerate()
        .filter(|(_, px)| !px.is_outlier())
        .map(|(k, _)| layout.board.start + 2 * k);
    let points = observations
        .points
        .iter()
        .enumerate()
        .filter(|(_, o)| !o.px.is_outlier())
        .map(|(k, _)| layout.points.start + 2 * k);

    let (sum, count) = board.chain(points).fold((0.0, 0usize), |(sum, count), row| {
        (
            sum + residuals[row].powi(2) + residuals[row + 1].powi(2),
            count + 2,
        )
    });
    if count == 0 { 0.0 } else { (sum / count as f64).sqrt() }
}

/// RMS over triangulated pairs whose observations are both inliers
pub fn rms_triangulated_error(
    residuals: &DVector<f64>,
    layout: &MeasurementLayout,
    observations: &Observations,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut row = layout.triangulated.start;
    for set in &layout.triangulated_sets {
        for i in set.clone() {
            for j in i + 1..set.end {
                if !observations.triangulated[i].outlier && !observations.triangulated[j].outlier {
                    sum += residuals[row].powi(2);
                    count += 1;
                }
                row += 1;
            }
        }
    }
    if count == 0 { 0.0 } else { (sum / count as f64).sqrt() }
}
