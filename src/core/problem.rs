//! Calibration problem definition.
//!
//! A [`CalibrationProblemSpec`] names what is being solved: the lens model,
//! the imagers, the calibration object and what to optimize. A
//! [`CalibrationProblem`] binds a spec to a baseline state and observations,
//! checks that they agree, and exposes the residual/Jacobian callback the
//! solver drives.
//!
//! # Workflow
//!
//! 1. **Describe**: build a `CalibrationProblemSpec` with `new()` and `with_*`
//! 2. **Bind**: `CalibrationProblem::new(&spec, &state, &observations)` validates
//!    everything and fixes the parameter and measurement layouts
//! 3. **Pack**: `pack_state()` gives the unit-scaled starting vector
//! 4. **Evaluate**: `callback(packed, want_jacobian)` returns the residuals and
//!    the sparse Jacobian with respect to the packed state
//! 5. **Unpack**: `unpack_state()` writes a solution back into a state
//!
//! # Example
//!
//! ```
//! use apex_calib::core::{
//!     CalibrationObject, CalibrationProblem, CalibrationProblemSpec, CalibrationState,
//!     CameraIndex, ObservedPixel, Observations, ProblemSelections,
//! };
//! use apex_calib::geometry::Pose;
//! use apex_calib::lensmodel::LensModel;
//! use nalgebra::{DVector, Vector3};
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let board = CalibrationObject::new(2, 2, 0.1);
//! let spec = CalibrationProblemSpec::new(LensModel::Pinhole, vec![[640, 480]])
//!     .with_calibration_object(board)
//!     .with_selections(ProblemSelections::default().with_outlier_rejection(false));
//!
//! let state = CalibrationState {
//!     intrinsics: vec![DVector::from_vec(vec![500.0, 500.0, 319.5, 239.5])],
//!     frames: vec![Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0))],
//!     ..Default::default()
//! };
//! let mut observations = Observations::new();
//! observations.add_board(
//!     CameraIndex::reference(0),
//!     0,
//!     &[ObservedPixel::new(319.5, 239.5, 1.0); 4],
//! );
//!
//! let problem = CalibrationProblem::new(&spec, &state, &observations)?;
//! let packed = problem.pack_state()?;
//! let (residuals, jacobian) = problem.callback(&packed, true)?;
//! assert_eq!(residuals.nrows(), problem.layout().num_measurements());
//! assert!(jacobian.is_some());
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::core::assembler::Assembler;
use crate::core::observation::{CameraIndex, Observations};
use crate::core::regularization::{RegularizationConfig, RegularizationScales};
use crate::core::schema::{MeasurementLayout, ParameterSchema, ProblemDimensions, ScaleConfig};
use crate::core::selections::{ProblemConstants, ProblemSelections};
use crate::core::state::{CalibrationObject, CalibrationState};
use crate::core::{CoreError, CoreResult};
use crate::error::ApexCalibResult;
use crate::lensmodel::LensModel;
use crate::optimizer::LeastSquaresProblem;
use faer::Mat;
use faer::sparse::SparseColMat;
use nalgebra::{DVector, Vector2, Vector3};
use std::collections::HashSet;
use tracing::debug;

/// What is being calibrated and how
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProblemSpec {
    /// Model shared by every camera
    pub lens_model: LensModel,
    /// `[width, height]` of each intrinsics group, used by the centering term
    pub imager_sizes: Vec<[usize; 2]>,
    /// Required when there are board observations
    pub calibration_object: Option<CalibrationObject>,
    pub selections: ProblemSelections,
    pub constants: ProblemConstants,
    pub scales: ScaleConfig,
    pub regularization: RegularizationConfig,
}

impl CalibrationProblemSpec {
    pub fn new(lens_model: LensModel, imager_sizes: Vec<[usize; 2]>) -> Self {
        Self {
            lens_model,
            imager_sizes,
            calibration_object: None,
            selections: ProblemSelections::default(),
            constants: ProblemConstants::default(),
            scales: ScaleConfig::default(),
            regularization: RegularizationConfig::default(),
        }
    }

    pub fn with_calibration_object(mut self, object: CalibrationObject) -> Self {
        self.calibration_object = Some(object);
        self
    }

    pub fn with_selections(mut self, selections: ProblemSelections) -> Self {
        self.selections = selections;
        self
    }

    pub fn with_constants(mut self, constants: ProblemConstants) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_scales(mut self, scales: ScaleConfig) -> Self {
        self.scales = scales;
        self
    }

    pub fn with_regularization(mut self, regularization: RegularizationConfig) -> Self {
        self.regularization = regularization;
        self
    }
}

/// A validated calibration problem, ready to be evaluated
#[derive(Debug, Clone)]
pub struct CalibrationProblem<'a> {
    schema: ParameterSchema,
    layout: MeasurementLayout,
    assembler: Assembler<'a>,
}

impl<'a> CalibrationProblem<'a> {
    /// Validate `state` and `observations` against `spec` and fix the layouts.
    ///
    /// `state` is the baseline: quantities the selections leave out of the
    /// packed state are read from it on every evaluation.
    pub fn new(
        spec: &'a CalibrationProblemSpec,
        state: &'a CalibrationState,
        observations: &'a Observations,
    ) -> CoreResult<Self> {
        let dims = ProblemDimensions::from_problem(state, observations);
        let schema = ParameterSchema::new(dims, spec.selections, spec.lens_model, spec.scales);
        Self::validate(spec, &schema, state, observations)?;

        let layout = MeasurementLayout::new(
            &schema,
            observations,
            spec.calibration_object.as_ref(),
            &spec.constants,
        )?;
        let regularization = RegularizationScales::new(
            &spec.regularization,
            &spec.lens_model,
            dims.n_cameras_intrinsics,
            layout.num_pixel_measurements(),
        );
        let rays = Self::unproject_triangulated(spec, state, observations)?;

        debug!(
            "Calibration problem: {} states, {} measurements, {} Jacobian non-zeros",
            schema.num_states(),
            layout.num_measurements(),
            layout.num_jacobian_nonzeros()
        );

        let assembler = Assembler::new(
            spec,
            state,
            observations,
            schema.clone(),
            layout.clone(),
            regularization,
            rays,
        );
        Ok(Self {
            schema,
            layout,
            assembler,
        })
    }

    /// Check every size and index the assembler relies on
    fn validate(
        spec: &CalibrationProblemSpec,
        schema: &ParameterSchema,
        state: &CalibrationState,
        observations: &Observations,
    ) -> CoreResult<()> {
        let model = &spec.lens_model;
        if !model.metadata().has_gradients {
            return Err(CoreError::InvalidInput(format!(
                "lens model {model} has no gradients and cannot be optimized"
            ))
            .log());
        }
        schema.validate_state(state)?;
        let dims = schema.dims();

        if spec.imager_sizes.len() != dims.n_cameras_intrinsics {
            return Err(CoreError::DimensionMismatch(format!(
                "{} imager sizes for {} intrinsics groups",
                spec.imager_sizes.len(),
                dims.n_cameras_intrinsics
            ))
            .log());
        }
        if dims.n_points_fixed > dims.n_points {
            return Err(CoreError::DimensionMismatch(format!(
                "{} fixed points out of {}",
                dims.n_points_fixed, dims.n_points
            ))
            .log());
        }
        if let (Some(min), Some(max)) = (spec.constants.point_min_range, spec.constants.point_max_range)
            && min > max
        {
            return Err(CoreError::InvalidInput(format!(
                "point range minimum {min} exceeds maximum {max}"
            ))
            .log());
        }

        let check_camera = |camera: &CameraIndex, what: &str| -> CoreResult<()> {
            if camera.intrinsics >= dims.n_cameras_intrinsics {
                return Err(CoreError::IndexOutOfRange(format!(
                    "{what}: intrinsics {} of {}",
                    camera.intrinsics, dims.n_cameras_intrinsics
                ))
                .log());
            }
            if let Some(extrinsics) = camera.extrinsics
                && extrinsics >= dims.n_cameras_extrinsics
            {
                return Err(CoreError::IndexOutOfRange(format!(
                    "{what}: extrinsics {extrinsics} of {}",
                    dims.n_cameras_extrinsics
                ))
                .log());
            }
            Ok(())
        };

        if !observations.boards.is_empty() {
            let object = spec.calibration_object.as_ref().ok_or_else(|| {
                CoreError::InvalidInput(
                    "board observations given without a calibration object".to_string(),
                )
                .log()
            })?;
            if object.width == 0 || object.height == 0 || object.spacing.is_nan() || object.spacing <= 0.0 {
                return Err(CoreError::InvalidInput(format!(
                    "degenerate calibration object {object:?}"
                ))
                .log());
            }
            let expected = observations.boards.len() * object.num_corners();
            if observations.board_pixels.len() != expected {
                return Err(CoreError::DimensionMismatch(format!(
                    "board pool holds {} pixels, {} boards of {} corners need {expected}",
                    observations.board_pixels.len(),
                    observations.boards.len(),
                    object.num_corners()
                ))
                .log());
            }
        }
        for (i, board) in observations.boards.iter().enumerate() {
            check_camera(&board.camera, &format!("board observation {i}"))?;
            if board.frame >= dims.n_frames {
                return Err(CoreError::IndexOutOfRange(format!(
                    "board observation {i}: frame {} of {}",
                    board.frame, dims.n_frames
                ))
                .log());
            }
        }
        for (i, point) in observations.points.iter().enumerate() {
            check_camera(&point.camera, &format!("point observation {i}"))?;
            if point.point >= dims.n_points {
                return Err(CoreError::IndexOutOfRange(format!(
                    "point observation {i}: point {} of {}",
                    point.point, dims.n_points
                ))
                .log());
            }
        }

        if !observations.triangulated.is_empty() {
            if schema.selections().optimizes_intrinsics() {
                return Err(CoreError::IncompatibleSelections(
                    "triangulated observations require fixed intrinsics".to_string(),
                )
                .log());
            }
            for (i, observation) in observations.triangulated.iter().enumerate() {
                check_camera(&observation.camera, &format!("triangulated observation {i}"))?;
            }
            for set in observations.triangulated_sets() {
                if set.len() < 2 {
                    return Err(CoreError::InvalidInput(format!(
                        "triangulated set at {} has a single observation",
                        set.start
                    ))
                    .log());
                }
                let mut seen = HashSet::new();
                for observation in &observations.triangulated[set.clone()] {
                    if !seen.insert(observation.camera.extrinsics) {
                        return Err(CoreError::InvalidInput(format!(
                            "triangulated set at {} observes from the same camera twice",
                            set.start
                        ))
                        .log());
                    }
                }
            }
        }
        Ok(())
    }

    /// Rays of the triangulated observations. Intrinsics are fixed whenever
    /// these exist, so they are computed once.
    fn unproject_triangulated(
        spec: &CalibrationProblemSpec,
        state: &CalibrationState,
        observations: &Observations,
    ) -> CoreResult<Vec<Option<Vector3<f64>>>> {
        observations
            .triangulated
            .iter()
            .map(|observation| {
                let intrinsics = state.intrinsics[observation.camera.intrinsics].as_slice();
                let q = Vector2::new(observation.px.x, observation.px.y);
                spec.lens_model.unproject(&q, intrinsics).map_err(|e| {
                    CoreError::InvalidInput("Failed to unproject triangulated observation".to_string())
                        .log_with_source(e)
                })
            })
            .collect()
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    pub fn layout(&self) -> &MeasurementLayout {
        &self.layout
    }

    pub fn assembler(&self) -> &Assembler<'a> {
        &self.assembler
    }

    /// Packed, unit-scaled form of the baseline state
    pub fn pack_state(&self) -> CoreResult<DVector<f64>> {
        self.schema.pack(self.assembler.baseline())
    }

    /// Write a packed vector into `state`
    pub fn unpack_state(&self, packed: &DVector<f64>, state: &mut CalibrationState) -> CoreResult<()> {
        self.schema.unpack(packed, state)
    }

    /// Residuals and, when asked for, the Jacobian with respect to `packed`
    pub fn callback(
        &self,
        packed: &DVector<f64>,
        want_jacobian: bool,
    ) -> CoreResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
        self.assembler.evaluate(packed, want_jacobian)
    }
}

impl LeastSquaresProblem for CalibrationProblem<'_> {
    fn num_states(&self) -> usize {
        self.schema.num_states()
    }

    fn num_measurements(&self) -> usize {
        self.layout.num_measurements()
    }

    fn num_jacobian_nonzeros(&self) -> usize {
        self.layout.num_jacobian_nonzeros()
    }

    fn evaluate(
        &self,
        x: &DVector<f64>,
        want_jacobian: bool,
    ) -> ApexCalibResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
        Ok(self.callback(x, want_jacobian)?)
    }
}
