//! Lens models: projection of camera-frame points to pixels, with gradients.
//!
//! Every model is a variant of the closed [`LensModel`] enum. The intrinsics
//! vector of a camera always starts with the core `[fx, fy, cx, cy]`; the
//! remaining entries are model specific:
//!
//! | model                         | intrinsics after the core                     |
//! |-------------------------------|-----------------------------------------------|
//! | `Pinhole`, `Stereographic`    | none                                          |
//! | `LonLat`, `LatLon`            | none                                          |
//! | `OpenCv4` / `5` / `8` / `12`  | `k1 k2 p1 p2 [k3] [k4 k5 k6] [s1 s2 s3 s4]`   |
//! | `Cahvor`                      | `alpha beta r0 r1 r2`                         |
//! | `Cahvore`                     | `alpha beta r0 r1 r2 e0 e1 e2`                |
//! | `SplinedStereographic`        | `Nx·Ny` control points, 2 values each         |
//!
//! Projection returns `None` instead of non-finite pixels, so callers can drop a
//! single degenerate observation without poisoning a whole solve.
//!
//! Gradients with respect to the intrinsics are dense for every model except
//! the splined one, where only a `(order+1)²` neighborhood of control points
//! is touched. That neighborhood is reported as [`SplineGradient`] and must be
//! scattered sparsely by the caller.

mod cahvor;
mod core_models;
mod opencv;
mod splined;
mod unproject;

pub use splined::SplineConfig;

use nalgebra::{Matrix2x3, Matrix2xX, Vector2, Vector3};
use std::fmt;
use thiserror::Error;
use tracing::error;

const NAME_PREFIX: &str = "LENSMODEL_";

/// Lens model errors
///
/// These are configuration errors: the caller asked for a model that does not
/// exist, or configured it inconsistently.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LensModelError {
    /// The name does not describe any known model
    #[error("Unknown lens model: '{0}'")]
    UnknownModel(String),

    /// The name is known but its configuration is malformed or out of range
    #[error("Invalid configuration for lens model '{model}': {reason}")]
    BadConfig { model: String, reason: String },

    /// The model requires a configuration and none was given
    #[error("Lens model '{0}' requires a configuration")]
    MissingConfig(String),

    /// An intrinsics vector of the wrong size was given for this model
    #[error("Lens model {model} takes {expected} intrinsics, got {actual}")]
    WrongParameterCount {
        model: String,
        expected: usize,
        actual: usize,
    },

    /// The model cannot perform the requested operation
    #[error("Lens model {model} does not support {operation}")]
    Unsupported { model: String, operation: String },
}

impl LensModelError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying cause
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for lens model operations
pub type LensModelResult<T> = Result<T, LensModelError>;

/// Static properties of a lens model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LensModelMetadata {
    /// The first 4 intrinsics are `fx, fy, cx, cy`
    pub has_core: bool,
    /// Points with `z <= 0` still project to meaningful pixels
    pub can_project_behind_camera: bool,
    /// Analytic gradients are available
    pub has_gradients: bool,
    /// Observation rays do not all pass through one point
    pub noncentral: bool,
}

/// The supported projection families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LensModel {
    Pinhole,
    Stereographic,
    LonLat,
    LatLon,
    OpenCv4,
    OpenCv5,
    OpenCv8,
    OpenCv12,
    Cahvor,
    Cahvore { linearity: f64 },
    SplinedStereographic(SplineConfig),
}

/// Gradient of the projected pixel with respect to the intrinsics
#[derive(Debug, Clone, PartialEq)]
pub enum IntrinsicsGradient {
    /// `2 × num_params()`, core included
    Dense(Matrix2xX<f64>),
    /// Local control-point neighborhood of a splined model
    Splined(SplineGradient),
}

/// Sparse intrinsics gradient of a splined model.
///
/// `∂q/∂[fx, fy, cx, cy]` is `diag(dq_dfxy) | I`. The control point at grid
/// position `(ix0 + i, iy0 + j)`, for `i, j < width`, has
/// `∂q_x/∂c_x = fx·weights[j·width + i]` and `∂q_y/∂c_y = fy·weights[j·width + i]`;
/// the cross terms are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineGradient {
    /// `(∂q_x/∂fx, ∂q_y/∂fy)`
    pub dq_dfxy: Vector2<f64>,
    /// `(fx, fy)`, the scale of the control-point weights
    pub fxy: Vector2<f64>,
    /// Neighborhood origin in the control grid
    pub ix0: usize,
    pub iy0: usize,
    /// Neighborhood width in each direction: `order + 1`
    pub width: usize,
    /// Row-major `width × width` B-spline blending weights
    pub weights: Vec<f64>,
    /// Number of control points per grid row
    pub nx: usize,
}

impl SplineGradient {
    /// Index into the intrinsics vector of control point `(ix, iy)`, component `axis`
    pub fn intrinsics_index(&self, ix: usize, iy: usize, axis: usize) -> usize {
        4 + 2 * (iy * self.nx + ix) + axis
    }
}

/// A projected pixel with its gradients
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub q: Vector2<f64>,
    pub dq_dp: Matrix2x3<f64>,
    pub dq_dintrinsics: IntrinsicsGradient,
}

impl IntrinsicsGradient {
    /// Expand into a dense `2 × n_params` matrix.
    ///
    /// Only meant for checks and small problems: splined models have thousands
    /// of intrinsics.
    pub fn to_dense(&self, n_params: usize) -> Matrix2xX<f64> {
        match self {
            IntrinsicsGradient::Dense(m) => m.clone(),
            IntrinsicsGradient::Splined(g) => {
                let mut dense = Matrix2xX::zeros(n_params);
                dense[(0, 0)] = g.dq_dfxy.x;
                dense[(1, 1)] = g.dq_dfxy.y;
                dense[(0, 2)] = 1.0;
                dense[(1, 3)] = 1.0;
                for j in 0..g.width {
                    for i in 0..g.width {
                        let w = g.weights[j * g.width + i];
                        dense[(0, g.intrinsics_index(g.ix0 + i, g.iy0 + j, 0))] = g.fxy.x * w;
                        dense[(1, g.intrinsics_index(g.ix0 + i, g.iy0 + j, 1))] = g.fxy.y * w;
                    }
                }
                dense
            }
        }
    }
}

impl LensModel {
    /// Parse a model name such as `LENSMODEL_OPENCV8` or
    /// `LENSMODEL_SPLINED_STEREOGRAPHIC_order=3_Nx=30_Ny=20_fov_x_deg=170`
    pub fn from_name(name: &str) -> LensModelResult<Self> {
        let unknown = || LensModelError::UnknownModel(name.to_string());
        let body = name.strip_prefix(NAME_PREFIX).ok_or_else(unknown)?;

        let simple = match body {
            "PINHOLE" => Some(LensModel::Pinhole),
            "STEREOGRAPHIC" => Some(LensModel::Stereographic),
            "LONLAT" => Some(LensModel::LonLat),
            "LATLON" => Some(LensModel::LatLon),
            "OPENCV4" => Some(LensModel::OpenCv4),
            "OPENCV5" => Some(LensModel::OpenCv5),
            "OPENCV8" => Some(LensModel::OpenCv8),
            "OPENCV12" => Some(LensModel::OpenCv12),
            "CAHVOR" => Some(LensModel::Cahvor),
            _ => None,
        };
        if let Some(model) = simple {
            return Ok(model);
        }

        if let Some(config) = body.strip_prefix("CAHVORE") {
            if config.is_empty() {
                return Err(LensModelError::MissingConfig(name.to_string()));
            }
            let value = config.strip_prefix("_linearity=").ok_or_else(|| {
                LensModelError::BadConfig {
                    model: name.to_string(),
                    reason: "expected '_linearity=<value>'".to_string(),
                }
            })?;
            let linearity: f64 = value.parse().map_err(|e| {
                LensModelError::BadConfig {
                    model: name.to_string(),
                    reason: format!("linearity '{value}' is not a number"),
                }
                .log_with_source(e)
            })?;
            if !linearity.is_finite() {
                return Err(LensModelError::BadConfig {
                    model: name.to_string(),
                    reason: "linearity must be finite".to_string(),
                });
            }
            return Ok(LensModel::Cahvore { linearity });
        }

        if let Some(config) = body.strip_prefix("SPLINED_STEREOGRAPHIC") {
            if config.is_empty() {
                return Err(LensModelError::MissingConfig(name.to_string()));
            }
            let config = SplineConfig::parse(config).map_err(|reason| LensModelError::BadConfig {
                model: name.to_string(),
                reason,
            })?;
            return Ok(LensModel::SplinedStereographic(config));
        }

        Err(unknown())
    }

    pub fn metadata(&self) -> LensModelMetadata {
        let (can_project_behind_camera, has_gradients, noncentral) = match self {
            LensModel::Pinhole => (false, true, false),
            LensModel::Stereographic | LensModel::LonLat | LensModel::LatLon => (true, true, false),
            LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8 | LensModel::OpenCv12 => {
                (false, true, false)
            }
            LensModel::Cahvor => (false, true, false),
            LensModel::Cahvore { .. } => (false, false, true),
            LensModel::SplinedStereographic(_) => (true, true, false),
        };
        LensModelMetadata {
            has_core: true,
            can_project_behind_camera,
            has_gradients,
            noncentral,
        }
    }

    /// Total number of intrinsics, core included
    pub fn num_params(&self) -> usize {
        match self {
            LensModel::Pinhole | LensModel::Stereographic | LensModel::LonLat | LensModel::LatLon => {
                4
            }
            LensModel::OpenCv4 => 8,
            LensModel::OpenCv5 => 9,
            LensModel::OpenCv8 => 12,
            LensModel::OpenCv12 => 16,
            LensModel::Cahvor => 9,
            LensModel::Cahvore { .. } => 12,
            LensModel::SplinedStereographic(config) => 4 + config.num_control_params(),
        }
    }

    /// Number of intrinsics after the core
    pub fn num_distortion_params(&self) -> usize {
        let core = if self.metadata().has_core { 4 } else { 0 };
        self.num_params() - core
    }

    pub fn is_splined(&self) -> bool {
        matches!(self, LensModel::SplinedStereographic(_))
    }

    /// Check the length of an intrinsics vector
    pub fn validate_intrinsics(&self, intrinsics: &[f64]) -> LensModelResult<()> {
        if intrinsics.len() != self.num_params() {
            return Err(LensModelError::WrongParameterCount {
                model: self.to_string(),
                expected: self.num_params(),
                actual: intrinsics.len(),
            });
        }
        Ok(())
    }

    /// Project a camera-frame point to a pixel.
    ///
    /// Returns `None` when the projection is not finite or, for CAHVORE, when
    /// the ray angle cannot be solved for.
    pub fn project(&self, p: &Vector3<f64>, intrinsics: &[f64]) -> Option<Vector2<f64>> {
        debug_assert_eq!(intrinsics.len(), self.num_params());
        match self {
            LensModel::Cahvore { linearity } => cahvor::project_cahvore(p, intrinsics, *linearity),
            _ => self.project_impl(p, intrinsics, false).map(|proj| proj.q),
        }
    }

    /// Project a camera-frame point and compute `∂q/∂p` and `∂q/∂intrinsics`.
    ///
    /// # Panics
    ///
    /// Panics for models without gradients (CAHVORE). Solver setup rejects
    /// those models before any projection happens, so reaching this is a bug.
    pub fn project_with_gradients(
        &self,
        p: &Vector3<f64>,
        intrinsics: &[f64],
    ) -> Option<Projection> {
        assert!(
            self.metadata().has_gradients,
            "lens model {self} has no gradients"
        );
        debug_assert_eq!(intrinsics.len(), self.num_params());
        self.project_impl(p, intrinsics, true)
    }

    fn project_impl(
        &self,
        p: &Vector3<f64>,
        intrinsics: &[f64],
        with_gradients: bool,
    ) -> Option<Projection> {
        match self {
            LensModel::Pinhole => core_models::project_pinhole(p, intrinsics, with_gradients),
            LensModel::Stereographic => {
                core_models::project_stereographic(p, intrinsics, with_gradients)
            }
            LensModel::LonLat => core_models::project_lonlat(p, intrinsics, with_gradients),
            LensModel::LatLon => core_models::project_latlon(p, intrinsics, with_gradients),
            LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8 | LensModel::OpenCv12 => {
                opencv::project_opencv(p, intrinsics, with_gradients)
            }
            LensModel::Cahvor => cahvor::project_cahvor(p, intrinsics, with_gradients),
            LensModel::Cahvore { linearity } => {
                let q = cahvor::project_cahvore(p, intrinsics, *linearity)?;
                Some(Projection {
                    q,
                    dq_dp: Matrix2x3::zeros(),
                    dq_dintrinsics: IntrinsicsGradient::Dense(Matrix2xX::zeros(0)),
                })
            }
            LensModel::SplinedStereographic(config) => {
                splined::project_splined(config, p, intrinsics, with_gradients)
            }
        }
    }

    /// Unproject a pixel to an (unnormalized) camera-frame direction.
    ///
    /// Returns `Ok(None)` when the internal root-find does not converge.
    /// Models without gradients cannot be unprojected.
    pub fn unproject(
        &self,
        q: &Vector2<f64>,
        intrinsics: &[f64],
    ) -> LensModelResult<Option<Vector3<f64>>> {
        let metadata = self.metadata();
        if !metadata.has_gradients || metadata.noncentral {
            return Err(LensModelError::Unsupported {
                model: self.to_string(),
                operation: "unprojection".to_string(),
            });
        }
        self.validate_intrinsics(intrinsics)?;
        Ok(unproject::unproject(self, q, intrinsics))
    }
}

impl fmt::Display for LensModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NAME_PREFIX}")?;
        match self {
            LensModel::Pinhole => write!(f, "PINHOLE"),
            LensModel::Stereographic => write!(f, "STEREOGRAPHIC"),
            LensModel::LonLat => write!(f, "LONLAT"),
            LensModel::LatLon => write!(f, "LATLON"),
            LensModel::OpenCv4 => write!(f, "OPENCV4"),
            LensModel::OpenCv5 => write!(f, "OPENCV5"),
            LensModel::OpenCv8 => write!(f, "OPENCV8"),
            LensModel::OpenCv12 => write!(f, "OPENCV12"),
            LensModel::Cahvor => write!(f, "CAHVOR"),
            LensModel::Cahvore { linearity } => write!(f, "CAHVORE_linearity={linearity:.2}"),
            LensModel::SplinedStereographic(config) => write!(f, "SPLINED_STEREOGRAPHIC{config}"),
        }
    }
}

impl std::str::FromStr for LensModel {
    type Err = LensModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LensModel::from_name(s)
    }
}

/// Build the projection of a model whose last step is `q = f∘v + c`.
///
/// `v` is the normalized (pre-core) coordinate and `dv_dp` its gradient. The
/// dense intrinsics gradient is sized for `n_params` and has its core columns
/// filled in; model specific columns are left for the caller.
pub(crate) fn apply_core(
    v: Vector2<f64>,
    dv_dp: Matrix2x3<f64>,
    intrinsics: &[f64],
    n_params: usize,
    with_gradients: bool,
) -> Option<Projection> {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let q = Vector2::new(fx * v.x + cx, fy * v.y + cy);
    if !q.x.is_finite() || !q.y.is_finite() {
        return None;
    }
    if !with_gradients {
        return Some(Projection {
            q,
            dq_dp: Matrix2x3::zeros(),
            dq_dintrinsics: IntrinsicsGradient::Dense(Matrix2xX::zeros(0)),
        });
    }

    let mut dq_dp = dv_dp;
    for j in 0..3 {
        dq_dp[(0, j)] *= fx;
        dq_dp[(1, j)] *= fy;
    }

    let mut dq_di = Matrix2xX::zeros(n_params);
    dq_di[(0, 0)] = v.x;
    dq_di[(1, 1)] = v.y;
    dq_di[(0, 2)] = 1.0;
    dq_di[(1, 3)] = 1.0;

    Some(Projection {
        q,
        dq_dp,
        dq_dintrinsics: IntrinsicsGradient::Dense(dq_di),
    })
}

/// Pinhole normalization `v = (x/z, y/z)` and its gradient
pub(crate) fn pinhole_normalize(p: &Vector3<f64>) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
    if p.z == 0.0 {
        return None;
    }
    let inv_z = 1.0 / p.z;
    let v = Vector2::new(p.x * inv_z, p.y * inv_z);
    let dv_dp = Matrix2x3::new(
        inv_z,
        0.0,
        -v.x * inv_z,
        0.0,
        inv_z,
        -v.y * inv_z,
    );
    Some((v, dv_dp))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    const EPS: f64 = 1e-6;

    fn close(analytic: f64, numeric: f64) -> bool {
        (analytic - numeric).abs() <= 1e-5 * (1.0 + analytic.abs())
    }

    /// Compare the analytic gradients of `model` at `p` to central differences
    pub(crate) fn check_gradients(model: &LensModel, p: &Vector3<f64>, intrinsics: &[f64]) {
        let projection = model
            .project_with_gradients(p, intrinsics)
            .unwrap_or_else(|| panic!("{model}: projection of {p:?} failed"));
        let q = model.project(p, intrinsics).unwrap_or_else(|| panic!("{model}: no value"));
        assert!((projection.q - q).norm() < 1e-12, "{model}: value paths disagree");

        for k in 0..3 {
            let mut plus = *p;
            let mut minus = *p;
            plus[k] += EPS;
            minus[k] -= EPS;
            let (Some(qp), Some(qm)) = (model.project(&plus, intrinsics), model.project(&minus, intrinsics))
            else {
                panic!("{model}: perturbed projection failed");
            };
            let numeric = (qp - qm) / (2.0 * EPS);
            for row in 0..2 {
                assert!(
                    close(projection.dq_dp[(row, k)], numeric[row]),
                    "{model}: dq{row}/dp{k} analytic {} numeric {}",
                    projection.dq_dp[(row, k)],
                    numeric[row]
                );
            }
        }

        let dense = projection.dq_dintrinsics.to_dense(intrinsics.len());
        assert_eq!(dense.ncols(), intrinsics.len());
        for k in 0..intrinsics.len() {
            let mut plus = intrinsics.to_vec();
            let mut minus = intrinsics.to_vec();
            plus[k] += EPS;
            minus[k] -= EPS;
            let (Some(qp), Some(qm)) = (model.project(p, &plus), model.project(p, &minus)) else {
                panic!("{model}: perturbed projection failed");
            };
            let numeric = (qp - qm) / (2.0 * EPS);
            for row in 0..2 {
                assert!(
                    close(dense[(row, k)], numeric[row]),
                    "{model}: dq{row}/dintrinsics{k} analytic {} numeric {}",
                    dense[(row, k)],
                    numeric[row]
                );
            }
        }
    }
}
