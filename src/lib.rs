//! # Apex Calib
//!
//! Multi-camera calibration by bundle adjustment, on top of a sparse
//! Levenberg-Marquardt solver.
//!
//! ## Features
//!
//! - **Lens models**: pinhole, stereographic, lon/lat, OpenCV 4/5/8/12, CAHVOR, CAHVORE and
//!   splined stereographic, with analytic gradients
//! - **Observations**: chessboard corners, individual points, and triangulated features
//!   whose 3D position never enters the state
//! - **Selective optimization**: intrinsics core and distortions, extrinsics, frames, points
//!   and board warp can each be held fixed
//! - **Regularization**: light priors on distortions and principal point, optional scale and
//!   point-range terms
//! - **Outlier rejection**: iterative k·σ rejection around the solver
//! - **Sparse**: hand-assembled sparse Jacobian and a cached sparse Cholesky factorization,
//!   built on the faer linear algebra library
//!
//! ## Modules
//!
//! - [`lensmodel`]: projection models
//! - [`geometry`]: rotations and rigid transforms
//! - [`core`]: problem layout, residuals and Jacobian
//! - [`optimizer`]: the callback-driven solver
//! - [`calibration`]: the [`optimize`] entry point, outlier rejection and board pose seeds

pub mod calibration;
pub mod core;
pub mod error;
pub mod geometry;
pub mod lensmodel;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;

pub use calibration::{
    CalibrationConfig, OptimizeReport, OutlierConfig, SolveStats, optimize, seed_board_poses,
};
pub use core::{
    CalibrationObject, CalibrationProblem, CalibrationProblemSpec, CalibrationState,
    CameraIndex, ObservedPixel, Observations, ProblemConstants, ProblemSelections,
};
pub use error::{ApexCalibError, ApexCalibResult};
pub use geometry::Pose;
pub use lensmodel::{LensModel, SplineConfig};
pub use linalg::{SparseCholeskySolver, SparseLinearSolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level, try_init_logger_with_level};
pub use optimizer::{
    LeastSquaresProblem, LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus,
};
