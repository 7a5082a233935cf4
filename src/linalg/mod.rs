//! Linear algebra used by the calibration solver.
//!
//! - [`cholesky`]: sparse Cholesky factorization of the (damped) normal equations
//! - [`kernels`]: small fixed-size routines (cofactor inverses, skew matrices, ray
//!   intersection normal equations) used by projection, unprojection and triangulation

pub mod cholesky;
pub mod kernels;

pub use cholesky::SparseCholeskySolver;

use faer::{Mat, sparse::SparseColMat};
use thiserror::Error;
use tracing::error;

/// Failures while solving the normal equations
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic analysis or numeric factorization of `JᵀJ + λI` failed
    #[error("Cholesky factorization failed: {0}")]
    FactorizationFailed(String),

    /// `JᵀJ + λI` is not positive definite
    #[error("Normal equations are not positive definite")]
    SingularMatrix,

    /// A sparse operand could not be assembled
    #[error("Sparse matrix assembly failed: {0}")]
    SparseMatrixCreation(String),

    /// `Jᵀ` could not be stored column-major
    #[error("Jacobian transpose conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log alongside the faer error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} ({:?})", self, source_error);
        self
    }
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Solver for the linearized least-squares step.
///
/// Implementors factor `JᵀJ` (optionally damped by `λI`) and return the step `h`
/// solving `(JᵀJ + λI)·h = −Jᵀr`.
pub trait SparseLinearSolver {
    /// Solve the undamped normal equations `(JᵀJ)·h = −Jᵀr`
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the damped system `(JᵀJ + λI)·h = −Jᵀr`
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>>;

    /// `JᵀJ` from the last solve
    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    /// `Jᵀr` from the last solve
    fn get_gradient(&self) -> Option<&Mat<f64>>;
}
