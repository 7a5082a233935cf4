//! The crate-level error.
//!
//! Each module reports failures through its own enum ([`CoreError`] for
//! problem layout and validation, [`LensModelError`], [`OptimizerError`],
//! [`LinAlgError`], [`CalibrationError`]). Public entry points return
//! [`ApexCalibError`], which wraps them without adding text, so
//!
//! ```text
//! Core(IndexOutOfRange("board observation 3: frame 9 of 4"))
//! ```
//!
//! displays as `Index out of range: board observation 3: frame 9 of 4`.

use crate::{
    calibration::CalibrationError, core::CoreError, lensmodel::LensModelError,
    linalg::LinAlgError, optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

pub type ApexCalibResult<T> = Result<T, ApexCalibError>;

#[derive(Debug, Error)]
pub enum ApexCalibError {
    /// Invalid problem description or inconsistent packed state
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Unknown model names, bad spline configurations, failed unprojection
    #[error(transparent)]
    LensModel(#[from] LensModelError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// The solver broke down inside [`crate::optimize`]
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl ApexCalibError {
    fn messages(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            messages.push(err.to_string());
            source = err.source();
        }
        messages
    }

    /// The error and its sources, one per line
    ///
    /// ```rust,ignore
    /// if let Err(e) = optimize(&mut state, &mut observations, &spec, &config) {
    ///     warn!("Calibration failed:\n{}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        self.messages().join("\n  caused by: ")
    }

    /// The error and its sources on one line
    pub fn chain_compact(&self) -> String {
        self.messages().join(": ")
    }
}
