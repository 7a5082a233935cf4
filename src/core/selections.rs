//! Optimization toggles and problem constants.

use crate::core::schema::ProblemDimensions;
use crate::lensmodel::LensModel;

/// Which parts of the calibration state take part in the optimization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemSelections {
    /// Optimize `fx, fy, cx, cy`
    pub optimize_intrinsics_core: bool,
    /// Optimize the model parameters after the core
    pub optimize_intrinsics_distortions: bool,
    pub optimize_extrinsics: bool,
    /// Optimize board poses and the non-fixed points
    pub optimize_frames: bool,
    pub optimize_calobject_warp: bool,
    pub apply_regularization: bool,
    /// Run the outlier-rejection loop around the solver
    pub apply_outlier_rejection: bool,
    /// Pull the first camera's translation to unit length, fixing the scale of
    /// problems that have no other scale reference
    pub apply_regularization_unity_cam01: bool,
}

impl Default for ProblemSelections {
    fn default() -> Self {
        Self {
            optimize_intrinsics_core: true,
            optimize_intrinsics_distortions: true,
            optimize_extrinsics: true,
            optimize_frames: true,
            optimize_calobject_warp: false,
            apply_regularization: true,
            apply_outlier_rejection: true,
            apply_regularization_unity_cam01: false,
        }
    }
}

impl ProblemSelections {
    /// Nothing optimized, nothing applied
    pub fn none() -> Self {
        Self {
            optimize_intrinsics_core: false,
            optimize_intrinsics_distortions: false,
            optimize_extrinsics: false,
            optimize_frames: false,
            optimize_calobject_warp: false,
            apply_regularization: false,
            apply_outlier_rejection: false,
            apply_regularization_unity_cam01: false,
        }
    }

    pub fn with_intrinsics_core(mut self, enabled: bool) -> Self {
        self.optimize_intrinsics_core = enabled;
        self
    }

    pub fn with_intrinsics_distortions(mut self, enabled: bool) -> Self {
        self.optimize_intrinsics_distortions = enabled;
        self
    }

    pub fn with_extrinsics(mut self, enabled: bool) -> Self {
        self.optimize_extrinsics = enabled;
        self
    }

    pub fn with_frames(mut self, enabled: bool) -> Self {
        self.optimize_frames = enabled;
        self
    }

    pub fn with_calobject_warp(mut self, enabled: bool) -> Self {
        self.optimize_calobject_warp = enabled;
        self
    }

    pub fn with_regularization(mut self, enabled: bool) -> Self {
        self.apply_regularization = enabled;
        self
    }

    pub fn with_outlier_rejection(mut self, enabled: bool) -> Self {
        self.apply_outlier_rejection = enabled;
        self
    }

    pub fn with_unity_cam01(mut self, enabled: bool) -> Self {
        self.apply_regularization_unity_cam01 = enabled;
        self
    }

    /// The selections that can actually apply to this problem.
    ///
    /// Toggles for quantities that do not exist are switched off, so that the
    /// parameter layout never reserves room for them.
    pub fn effective(&self, dims: &ProblemDimensions, model: &LensModel) -> Self {
        let mut selections = *self;
        if !model.metadata().has_core {
            selections.optimize_intrinsics_core = false;
        }
        if model.num_distortion_params() == 0 {
            selections.optimize_intrinsics_distortions = false;
        }
        if dims.n_observations_board == 0 {
            selections.optimize_calobject_warp = false;
        }
        if dims.n_cameras_extrinsics == 0 || !selections.optimize_extrinsics {
            selections.apply_regularization_unity_cam01 = false;
        }
        selections
    }

    pub fn optimizes_intrinsics(&self) -> bool {
        self.optimize_intrinsics_core || self.optimize_intrinsics_distortions
    }
}

/// Physical constants of the problem
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProblemConstants {
    /// Observed points closer than this to their camera are penalized
    pub point_min_range: Option<f64>,
    /// Observed points farther than this from their camera are penalized
    pub point_max_range: Option<f64>,
}

impl ProblemConstants {
    pub fn with_point_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.point_min_range = min;
        self.point_max_range = max;
        self
    }

    pub fn has_point_range(&self) -> bool {
        self.point_min_range.is_some() || self.point_max_range.is_some()
    }
}
