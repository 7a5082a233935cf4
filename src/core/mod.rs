//! Calibration problem formulation
//!
//! This module turns a calibration state and its observations into a
//! least-squares problem:
//! - observations, selections and the physical state ([`observation`],
//!   [`selections`], [`state`])
//! - the packed-state and measurement layouts ([`schema`])
//! - residual and sparse Jacobian assembly ([`assembler`], [`jacobian`])
//! - regularization and triangulated-feature terms ([`regularization`],
//!   [`triangulation`])
//! - the problem definition handed to the solver ([`problem`])

pub mod assembler;
pub mod jacobian;
pub mod observation;
pub mod problem;
pub mod regularization;
pub mod schema;
pub mod selections;
pub mod state;
pub mod triangulation;

pub use observation::{
    BoardObservation, CameraIndex, ObservedPixel, Observations, PointObservation,
    TriangulatedObservation,
};
pub use problem::{CalibrationProblem, CalibrationProblemSpec};
pub use regularization::RegularizationConfig;
pub use schema::{MeasurementLayout, ParameterSchema, ProblemDimensions, ScaleConfig};
pub use selections::{ProblemConstants, ProblemSelections};
pub use state::{CalibrationObject, CalibrationState, CalobjectWarp};

use thiserror::Error;
use tracing::error;

/// Core module error types for calibration problems
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Sizes of the state, observations or packed vector disagree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// An observation refers to a camera, frame or point that does not exist
    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    /// The requested selections cannot be combined with these observations
    #[error("Incompatible selections: {0}")]
    IncompatibleSelections(String),

    /// Sparse Jacobian construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// schema.validate_state(state)
    ///     .map_err(|e| e.log())?;
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
    /// SymbolicSparseColMat::try_new_from_indices(nrows, ncols, &indices)
    ///     .map_err(|e| {
    ///         CoreError::SymbolicStructure("Failed to build Jacobian pattern".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
