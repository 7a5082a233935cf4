//! Nonlinear least-squares solver.
//!
//! The solver only sees a packed state vector and a callback returning the
//! residuals and the sparse Jacobian at that state ([`LeastSquaresProblem`]).
//! It knows nothing about cameras; [`crate::core::CalibrationProblem`] is one
//! implementation of the callback.

use crate::error::ApexCalibResult;
use crate::linalg;
use faer::Mat;
use faer::sparse::SparseColMat;
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Linear system solve failed during optimization
    #[error("Linear system solve failed: {0}")]
    LinearSolveFailed(String),

    /// The callback returned residuals or a Jacobian of the wrong shape
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Numerical instability detected (NaN, Inf in cost, gradient, or parameters)
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// Jacobi scaling matrix creation failed
    #[error("Failed to create Jacobi scaling matrix: {0}")]
    JacobiScalingCreation(String),

    /// Jacobi scaling not initialized when expected
    #[error("Jacobi scaling not initialized")]
    JacobiScalingNotInitialized,
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SparseColMat::try_new_from_triplets(cols, cols, &triplets)
    ///     .map_err(|e| {
    ///         OptimizerError::JacobiScalingCreation(e.to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// A least-squares problem seen through its callback.
///
/// `evaluate` returns the residual column `x(p)` and, when asked for, the
/// sparse Jacobian `∂x/∂p`. It must be free of side effects: the solver
/// calls it on trial states it may reject.
pub trait LeastSquaresProblem {
    /// Length of the packed state
    fn num_states(&self) -> usize;

    /// Length of the residual vector
    fn num_measurements(&self) -> usize;

    /// Stored entries of the Jacobian
    fn num_jacobian_nonzeros(&self) -> usize;

    fn evaluate(
        &self,
        x: &DVector<f64>,
        want_jacobian: bool,
    ) -> ApexCalibResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)>;
}

/// Work done and state of the last step
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// `‖Jᵀx‖` at the last linearization
    pub final_gradient_norm: f64,
    /// `‖h‖` of the last step, accepted or not
    pub final_parameter_update_norm: f64,
    pub cost_evaluations: usize,
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|g| = {:.2e}, |h| = {:.2e} after {} residual and {} Jacobian evaluations",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Why a solve stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    Converged,
    MaxIterationsReached,
    /// Relative cost change of an accepted step fell below tolerance
    CostToleranceReached,
    /// Accepted step was small relative to the state
    ParameterToleranceReached,
    GradientToleranceReached,
    Timeout,
    MinCostThresholdReached,
    /// λ hit its upper bound without an acceptable step
    DampingTooLarge,
    /// The cost, gradient or step stopped being finite
    InvalidNumericalValues,
    Failed(String),
}

impl OptimizationStatus {
    /// Whether the state the solver stopped at is usable.
    ///
    /// Running out of iterations or time still leaves the best state found;
    /// only numerical breakdowns count as failures.
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            OptimizationStatus::InvalidNumericalValues | OptimizationStatus::Failed(_)
        )
    }

    /// Whether a convergence criterion was met
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::GradientToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::MinCostThresholdReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            OptimizationStatus::Converged => "converged",
            OptimizationStatus::MaxIterationsReached => "iteration limit reached",
            OptimizationStatus::CostToleranceReached => "cost change below tolerance",
            OptimizationStatus::ParameterToleranceReached => "step below tolerance",
            OptimizationStatus::GradientToleranceReached => "gradient below tolerance",
            OptimizationStatus::Timeout => "timed out",
            OptimizationStatus::MinCostThresholdReached => "cost below threshold",
            OptimizationStatus::DampingTooLarge => "damping at its upper bound",
            OptimizationStatus::InvalidNumericalValues => "non-finite values (NaN/Inf)",
            OptimizationStatus::Failed(msg) => return write!(f, "failed: {msg}"),
        };
        f.write_str(text)
    }
}

/// What a solve returns
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    pub parameters: T,
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub elapsed_time: time::Duration,
    /// `None` when there was nothing to optimize
    pub convergence_info: Option<ConvergenceInfo>,
}
/// `½‖x‖²`
pub fn compute_cost(residual: &Mat<f64>) -> f64 {
    let norm = residual.norm_l2();
    0.5 * norm * norm
}

/// Check the shapes a callback returned against what the problem announced
pub(crate) fn check_evaluation(
    problem: &dyn LeastSquaresProblem,
    residuals: &Mat<f64>,
    jacobian: Option<&SparseColMat<usize, f64>>,
) -> OptimizerResult<()> {
    if residuals.nrows() != problem.num_measurements() || residuals.ncols() != 1 {
        return Err(OptimizerError::DimensionMismatch(format!(
            "callback returned {}x{} residuals, expected {}x1",
            residuals.nrows(),
            residuals.ncols(),
            problem.num_measurements()
        ))
        .log());
    }
    if let Some(jacobian) = jacobian
        && (jacobian.nrows() != problem.num_measurements()
            || jacobian.ncols() != problem.num_states())
    {
        return Err(OptimizerError::DimensionMismatch(format!(
            "callback returned a {}x{} Jacobian, expected {}x{}",
            jacobian.nrows(),
            jacobian.ncols(),
            problem.num_measurements(),
            problem.num_states()
        ))
        .log());
    }
    Ok(())
}
