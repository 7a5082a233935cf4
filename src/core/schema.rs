//! Layout of the packed state vector and of the measurement vector.
//!
//! The solver sees a vector of unit-scaled values. For a given problem the
//! layout is:
//!
//! ```text
//! [ intrinsics cam 0 | ... | intrinsics cam N-1 ]   core (4) then distortions
//! [ extrinsics 0 | ... ]                             6 each: r, t
//! [ frame 0 | ... ]                                  6 each: r, t
//! [ point 0 | ... ]                                  3 each, fixed points excluded
//! [ calobject warp ]                                 2
//! ```
//!
//! A block is absent when its [`ProblemSelections`] toggle is off. Every
//! packed entry is the physical value divided by the [`ScaleConfig`] constant
//! of its kind, which keeps the solver's parameters of comparable magnitude.
//!
//! The measurement vector is laid out as board corners, point observations,
//! then the regularization block (distortion, centering, unity-cam01, point
//! range) and finally the triangulated pairs. [`MeasurementLayout`] predicts
//! both its length and the Jacobian non-zero count, which the assembler then
//! has to reproduce exactly.

use crate::core::observation::{CameraIndex, Observations};
use crate::core::selections::{ProblemConstants, ProblemSelections};
use crate::core::state::{CalibrationObject, CalibrationState};
use crate::core::{CoreError, CoreResult};
use crate::geometry::Pose;
use crate::lensmodel::LensModel;
use nalgebra::{DVector, Vector3};
use std::ops::Range;

/// Unit scale of each kind of optimized quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleConfig {
    pub focal_length: f64,
    pub center_pixel: f64,
    pub camera_rotation: f64,
    pub camera_translation: f64,
    pub frame_rotation: f64,
    pub frame_translation: f64,
    pub point: f64,
    pub calobject_warp: f64,
    pub distortion: f64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            focal_length: 500.0,
            center_pixel: 20.0,
            camera_rotation: 0.1_f64.to_radians(),
            camera_translation: 1.0,
            frame_rotation: 15.0_f64.to_radians(),
            frame_translation: 1.0,
            point: 1.0,
            calobject_warp: 0.01,
            distortion: 1.0,
        }
    }
}

impl ScaleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_focal_length(mut self, scale: f64) -> Self {
        self.focal_length = scale;
        self
    }

    pub fn with_center_pixel(mut self, scale: f64) -> Self {
        self.center_pixel = scale;
        self
    }

    pub fn with_camera_rotation(mut self, scale: f64) -> Self {
        self.camera_rotation = scale;
        self
    }

    pub fn with_camera_translation(mut self, scale: f64) -> Self {
        self.camera_translation = scale;
        self
    }

    pub fn with_frame_rotation(mut self, scale: f64) -> Self {
        self.frame_rotation = scale;
        self
    }

    pub fn with_frame_translation(mut self, scale: f64) -> Self {
        self.frame_translation = scale;
        self
    }

    pub fn with_point(mut self, scale: f64) -> Self {
        self.point = scale;
        self
    }

    pub fn with_calobject_warp(mut self, scale: f64) -> Self {
        self.calobject_warp = scale;
        self
    }

    pub fn with_distortion(mut self, scale: f64) -> Self {
        self.distortion = scale;
        self
    }
}

/// Sizes of a calibration problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProblemDimensions {
    pub n_cameras_intrinsics: usize,
    pub n_cameras_extrinsics: usize,
    pub n_frames: usize,
    pub n_points: usize,
    /// The last `n_points_fixed` points are not optimized
    pub n_points_fixed: usize,
    pub n_observations_board: usize,
    pub n_observations_point: usize,
    pub n_observations_triangulated: usize,
}

impl ProblemDimensions {
    pub fn from_problem(state: &CalibrationState, observations: &Observations) -> Self {
        Self {
            n_cameras_intrinsics: state.intrinsics.len(),
            n_cameras_extrinsics: state.extrinsics.len(),
            n_frames: state.frames.len(),
            n_points: state.points.len(),
            n_points_fixed: state.n_points_fixed,
            n_observations_board: observations.boards.len(),
            n_observations_point: observations.points.len(),
            n_observations_triangulated: observations.triangulated.len(),
        }
    }
}

/// Packed-state layout of one problem
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSchema {
    dims: ProblemDimensions,
    selections: ProblemSelections,
    model: LensModel,
    scales: ScaleConfig,
}

impl ParameterSchema {
    /// Build the layout. The selections are reduced to the ones that apply.
    pub fn new(
        dims: ProblemDimensions,
        selections: ProblemSelections,
        model: LensModel,
        scales: ScaleConfig,
    ) -> Self {
        Self {
            dims,
            selections: selections.effective(&dims, &model),
            model,
            scales,
        }
    }

    pub fn dims(&self) -> &ProblemDimensions {
        &self.dims
    }

    /// The effective selections
    pub fn selections(&self) -> &ProblemSelections {
        &self.selections
    }

    pub fn model(&self) -> &LensModel {
        &self.model
    }

    pub fn scales(&self) -> &ScaleConfig {
        &self.scales
    }

    fn num_core_states(&self) -> usize {
        if self.selections.optimize_intrinsics_core {
            4
        } else {
            0
        }
    }

    fn num_distortion_states(&self) -> usize {
        if self.selections.optimize_intrinsics_distortions {
            self.model.num_distortion_params()
        } else {
            0
        }
    }

    /// Optimized intrinsics per camera
    pub fn num_intrinsics_optimization_params(&self) -> usize {
        self.num_core_states() + self.num_distortion_states()
    }

    pub fn num_states_intrinsics(&self) -> usize {
        self.dims.n_cameras_intrinsics * self.num_intrinsics_optimization_params()
    }

    pub fn num_states_extrinsics(&self) -> usize {
        if self.selections.optimize_extrinsics {
            6 * self.dims.n_cameras_extrinsics
        } else {
            0
        }
    }

    pub fn num_states_frames(&self) -> usize {
        if self.selections.optimize_frames {
            6 * self.dims.n_frames
        } else {
            0
        }
    }

    pub fn num_states_points(&self) -> usize {
        if self.selections.optimize_frames {
            3 * self.dims.n_points.saturating_sub(self.dims.n_points_fixed)
        } else {
            0
        }
    }

    pub fn num_states_calobject_warp(&self) -> usize {
        if self.selections.optimize_calobject_warp {
            2
        } else {
            0
        }
    }

    pub fn num_states(&self) -> usize {
        self.num_states_intrinsics()
            + self.num_states_extrinsics()
            + self.num_states_frames()
            + self.num_states_points()
            + self.num_states_calobject_warp()
    }

    pub fn state_index_intrinsics(&self, icam: usize) -> Option<usize> {
        let n = self.num_intrinsics_optimization_params();
        (n > 0 && icam < self.dims.n_cameras_intrinsics).then_some(icam * n)
    }

    /// Offset of `fx` of camera `icam`, when the core is optimized
    pub fn state_index_intrinsics_core(&self, icam: usize) -> Option<usize> {
        if !self.selections.optimize_intrinsics_core {
            return None;
        }
        self.state_index_intrinsics(icam)
    }

    /// Offset of the first distortion parameter of camera `icam`
    pub fn state_index_intrinsics_distortions(&self, icam: usize) -> Option<usize> {
        if !self.selections.optimize_intrinsics_distortions {
            return None;
        }
        self.state_index_intrinsics(icam)
            .map(|offset| offset + self.num_core_states())
    }

    pub fn state_index_extrinsics(&self, i: usize) -> Option<usize> {
        (self.selections.optimize_extrinsics && i < self.dims.n_cameras_extrinsics)
            .then(|| self.num_states_intrinsics() + 6 * i)
    }

    /// Offset of the extrinsics of `camera`; `None` for the reference camera
    pub fn state_index_camera(&self, camera: &CameraIndex) -> Option<usize> {
        camera.extrinsics.and_then(|i| self.state_index_extrinsics(i))
    }

    pub fn state_index_frame(&self, i: usize) -> Option<usize> {
        (self.selections.optimize_frames && i < self.dims.n_frames).then(|| {
            self.num_states_intrinsics() + self.num_states_extrinsics() + 6 * i
        })
    }

    /// Offset of point `i`; `None` for fixed points
    pub fn state_index_point(&self, i: usize) -> Option<usize> {
        let n_optimizable = self.dims.n_points.saturating_sub(self.dims.n_points_fixed);
        (self.selections.optimize_frames && i < n_optimizable).then(|| {
            self.num_states_intrinsics()
                + self.num_states_extrinsics()
                + self.num_states_frames()
                + 3 * i
        })
    }

    pub fn state_index_calobject_warp(&self) -> Option<usize> {
        self.selections.optimize_calobject_warp.then(|| {
            self.num_states_intrinsics()
                + self.num_states_extrinsics()
                + self.num_states_frames()
                + self.num_states_points()
        })
    }

    /// Scale of intrinsics parameter `k` (in the full intrinsics vector)
    pub fn intrinsics_scale(&self, k: usize) -> f64 {
        match k {
            0 | 1 => self.scales.focal_length,
            2 | 3 => self.scales.center_pixel,
            _ => self.scales.distortion,
        }
    }

    /// Per-entry scale of the packed state: `physical = packed · scale`.
    ///
    /// Jacobian columns with respect to the packed state are the physical
    /// gradients multiplied by this.
    pub fn column_scales(&self) -> DVector<f64> {
        let mut scales = DVector::zeros(self.num_states());
        for icam in 0..self.dims.n_cameras_intrinsics {
            if let Some(offset) = self.state_index_intrinsics_core(icam) {
                for k in 0..4 {
                    scales[offset + k] = self.intrinsics_scale(k);
                }
            }
            if let Some(offset) = self.state_index_intrinsics_distortions(icam) {
                for k in 0..self.model.num_distortion_params() {
                    scales[offset + k] = self.scales.distortion;
                }
            }
        }
        let pose_scales = |scales: &mut DVector<f64>, offset: usize, r: f64, t: f64| {
            for k in 0..3 {
                scales[offset + k] = r;
                scales[offset + 3 + k] = t;
            }
        };
        for i in 0..self.dims.n_cameras_extrinsics {
            if let Some(offset) = self.state_index_extrinsics(i) {
                pose_scales(
                    &mut scales,
                    offset,
                    self.scales.camera_rotation,
                    self.scales.camera_translation,
                );
            }
        }
        for i in 0..self.dims.n_frames {
            if let Some(offset) = self.state_index_frame(i) {
                pose_scales(
                    &mut scales,
                    offset,
                    self.scales.frame_rotation,
                    self.scales.frame_translation,
                );
            }
        }
        for i in 0..self.dims.n_points {
            if let Some(offset) = self.state_index_point(i) {
                for k in 0..3 {
                    scales[offset + k] = self.scales.point;
                }
            }
        }
        if let Some(offset) = self.state_index_calobject_warp() {
            scales[offset] = self.scales.calobject_warp;
            scales[offset + 1] = self.scales.calobject_warp;
        }
        scales
    }

    /// Check that a state has the dimensions this schema was built for
    pub fn validate_state(&self, state: &CalibrationState) -> CoreResult<()> {
        let expect = |what: &str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(CoreError::DimensionMismatch(format!(
                    "{what}: expected {expected}, got {actual}"
                ))
                .log())
            }
        };
        expect(
            "intrinsics count",
            self.dims.n_cameras_intrinsics,
            state.intrinsics.len(),
        )?;
        for (icam, intrinsics) in state.intrinsics.iter().enumerate() {
            expect(
                &format!("intrinsics of camera {icam}"),
                self.model.num_params(),
                intrinsics.len(),
            )?;
        }
        expect(
            "extrinsics count",
            self.dims.n_cameras_extrinsics,
            state.extrinsics.len(),
        )?;
        expect("frame count", self.dims.n_frames, state.frames.len())?;
        expect("point count", self.dims.n_points, state.points.len())?;
        expect(
            "fixed point count",
            self.dims.n_points_fixed,
            state.n_points_fixed,
        )?;
        Ok(())
    }

    /// Physical state to packed, unit-scaled vector
    pub fn pack(&self, state: &CalibrationState) -> CoreResult<DVector<f64>> {
        self.validate_state(state)?;
        let mut packed = DVector::zeros(self.num_states());

        for (icam, intrinsics) in state.intrinsics.iter().enumerate() {
            if let Some(offset) = self.state_index_intrinsics_core(icam) {
                for k in 0..4 {
                    packed[offset + k] = intrinsics[k] / self.intrinsics_scale(k);
                }
            }
            if let Some(offset) = self.state_index_intrinsics_distortions(icam) {
                for (k, value) in intrinsics.iter().skip(4).enumerate() {
                    packed[offset + k] = value / self.scales.distortion;
                }
            }
        }

        let pack_pose = |packed: &mut DVector<f64>, offset: usize, pose: &Pose, r: f64, t: f64| {
            for k in 0..3 {
                packed[offset + k] = pose.r[k] / r;
                packed[offset + 3 + k] = pose.t[k] / t;
            }
        };
        for (i, pose) in state.extrinsics.iter().enumerate() {
            if let Some(offset) = self.state_index_extrinsics(i) {
                pack_pose(
                    &mut packed,
                    offset,
                    pose,
                    self.scales.camera_rotation,
                    self.scales.camera_translation,
                );
            }
        }
        for (i, pose) in state.frames.iter().enumerate() {
            if let Some(offset) = self.state_index_frame(i) {
                pack_pose(
                    &mut packed,
                    offset,
                    pose,
                    self.scales.frame_rotation,
                    self.scales.frame_translation,
                );
            }
        }
        for (i, point) in state.points.iter().enumerate() {
            if let Some(offset) = self.state_index_point(i) {
                for k in 0..3 {
                    packed[offset + k] = point[k] / self.scales.point;
                }
            }
        }
        if let Some(offset) = self.state_index_calobject_warp() {
            packed[offset] = state.calobject_warp.x2 / self.scales.calobject_warp;
            packed[offset + 1] = state.calobject_warp.y2 / self.scales.calobject_warp;
        }
        Ok(packed)
    }

    /// Packed vector back into the physical state.
    ///
    /// Quantities that are not part of the packed state keep their values.
    pub fn unpack(&self, packed: &DVector<f64>, state: &mut CalibrationState) -> CoreResult<()> {
        self.validate_state(state)?;
        if packed.len() != self.num_states() {
            return Err(CoreError::DimensionMismatch(format!(
                "packed state: expected {}, got {}",
                self.num_states(),
                packed.len()
            ))
            .log());
        }

        for icam in 0..state.intrinsics.len() {
            if let Some(offset) = self.state_index_intrinsics_core(icam) {
                for k in 0..4 {
                    state.intrinsics[icam][k] = packed[offset + k] * self.intrinsics_scale(k);
                }
            }
            if let Some(offset) = self.state_index_intrinsics_distortions(icam) {
                for k in 0..self.model.num_distortion_params() {
                    state.intrinsics[icam][4 + k] = packed[offset + k] * self.scales.distortion;
                }
            }
        }

        let unpack_pose = |offset: usize, r: f64, t: f64| {
            Pose::new(
                Vector3::new(packed[offset], packed[offset + 1], packed[offset + 2]) * r,
                Vector3::new(packed[offset + 3], packed[offset + 4], packed[offset + 5]) * t,
            )
        };
        for i in 0..state.extrinsics.len() {
            if let Some(offset) = self.state_index_extrinsics(i) {
                state.extrinsics[i] = unpack_pose(
                    offset,
                    self.scales.camera_rotation,
                    self.scales.camera_translation,
                );
            }
        }
        for i in 0..state.frames.len() {
            if let Some(offset) = self.state_index_frame(i) {
                state.frames[i] =
                    unpack_pose(offset, self.scales.frame_rotation, self.scales.frame_translation);
            }
        }
        for i in 0..state.points.len() {
            if let Some(offset) = self.state_index_point(i) {
                state.points[i] =
                    Vector3::new(packed[offset], packed[offset + 1], packed[offset + 2])
                        * self.scales.point;
            }
        }
        if let Some(offset) = self.state_index_calobject_warp() {
            state.calobject_warp.x2 = packed[offset] * self.scales.calobject_warp;
            state.calobject_warp.y2 = packed[offset + 1] * self.scales.calobject_warp;
        }
        Ok(())
    }

    /// Jacobian entries contributed by the intrinsics to one pixel row
    pub fn intrinsics_entries_per_row(&self) -> usize {
        let core = if self.selections.optimize_intrinsics_core {
            2
        } else {
            0
        };
        let distortion = if !self.selections.optimize_intrinsics_distortions {
            0
        } else if let LensModel::SplinedStereographic(config) = &self.model {
            let width = config.order as usize + 1;
            width * width
        } else {
            self.model.num_distortion_params()
        };
        core + distortion
    }

    fn camera_entries(&self, camera: &CameraIndex) -> usize {
        if self.state_index_camera(camera).is_some() {
            6
        } else {
            0
        }
    }
}

/// Row layout of the measurement vector
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementLayout {
    pub board: Range<usize>,
    pub points: Range<usize>,
    pub regularization_distortion: Range<usize>,
    pub regularization_centering: Range<usize>,
    pub regularization_unity_cam01: Range<usize>,
    pub regularization_point_range: Range<usize>,
    pub triangulated: Range<usize>,
    /// Observation index ranges of the triangulated sets
    pub triangulated_sets: Vec<Range<usize>>,
    pub corners_per_board: usize,
    num_jacobian_nonzeros: usize,
}

fn block(start: &mut usize, len: usize) -> Range<usize> {
    let range = *start..*start + len;
    *start += len;
    range
}

impl MeasurementLayout {
    pub fn new(
        schema: &ParameterSchema,
        observations: &Observations,
        calibration_object: Option<&CalibrationObject>,
        constants: &ProblemConstants,
    ) -> CoreResult<Self> {
        let selections = schema.selections();
        let dims = schema.dims();
        let corners_per_board = match (calibration_object, observations.boards.is_empty()) {
            (Some(object), _) => object.num_corners(),
            (None, true) => 0,
            (None, false) => {
                return Err(CoreError::InvalidInput(
                    "board observations given without a calibration object".to_string(),
                )
                .log());
            }
        };

        let n_distortion = schema.model().num_distortion_params();
        let n_dist_rows = if selections.apply_regularization
            && selections.optimize_intrinsics_distortions
        {
            dims.n_cameras_intrinsics * n_distortion
        } else {
            0
        };
        let n_center_rows =
            if selections.apply_regularization && selections.optimize_intrinsics_core {
                dims.n_cameras_intrinsics * 2
            } else {
                0
            };
        let n_unity_rows = usize::from(selections.apply_regularization_unity_cam01);
        let point_range_applies = selections.apply_regularization
            && selections.optimize_frames
            && constants.has_point_range();
        let n_point_range_rows = if point_range_applies {
            observations.points.len()
        } else {
            0
        };
        let triangulated_sets = observations.triangulated_sets();
        let n_pairs: usize = triangulated_sets
            .iter()
            .map(|set| set.len() * set.len().saturating_sub(1) / 2)
            .sum();

        let mut row = 0;
        let board = block(&mut row, observations.boards.len() * corners_per_board * 2);
        let points = block(&mut row, observations.points.len() * 2);
        let regularization_distortion = block(&mut row, n_dist_rows);
        let regularization_centering = block(&mut row, n_center_rows);
        let regularization_unity_cam01 = block(&mut row, n_unity_rows);
        let regularization_point_range = block(&mut row, n_point_range_rows);
        let triangulated = block(&mut row, n_pairs);

        // Jacobian non-zeros, counted exactly the way the assembler pushes them
        let intrinsics = schema.intrinsics_entries_per_row();
        let mut nnz = 0;
        for observation in &observations.boards {
            let mut per_row = intrinsics + schema.camera_entries(&observation.camera);
            if schema.state_index_frame(observation.frame).is_some() {
                per_row += 6;
            }
            per_row += schema.num_states_calobject_warp();
            nnz += 2 * corners_per_board * per_row;
        }
        for observation in &observations.points {
            let mut per_row = intrinsics + schema.camera_entries(&observation.camera);
            if schema.state_index_point(observation.point).is_some() {
                per_row += 3;
            }
            nnz += 2 * per_row;
        }
        nnz += n_dist_rows + n_center_rows + 3 * n_unity_rows;
        if point_range_applies {
            for observation in &observations.points {
                nnz += schema.camera_entries(&observation.camera);
                if schema.state_index_point(observation.point).is_some() {
                    nnz += 3;
                }
            }
        }
        for set in &triangulated_sets {
            for i in set.clone() {
                for j in i + 1..set.end {
                    nnz += schema.camera_entries(&observations.triangulated[i].camera)
                        + schema.camera_entries(&observations.triangulated[j].camera);
                }
            }
        }

        Ok(Self {
            board,
            points,
            regularization_distortion,
            regularization_centering,
            regularization_unity_cam01,
            regularization_point_range,
            triangulated,
            triangulated_sets,
            corners_per_board,
            num_jacobian_nonzeros: nnz,
        })
    }

    pub fn num_measurements(&self) -> usize {
        self.triangulated.end
    }

    pub fn num_jacobian_nonzeros(&self) -> usize {
        self.num_jacobian_nonzeros
    }

    /// Rows holding pixel reprojection errors: boards then points
    pub fn num_pixel_measurements(&self) -> usize {
        self.board.len() + self.points.len()
    }

    pub fn num_regularization_measurements(&self) -> usize {
        self.regularization_point_range.end - self.regularization_distortion.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::ObservedPixel;
    use crate::core::state::CalobjectWarp;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn dims() -> ProblemDimensions {
        ProblemDimensions {
            n_cameras_intrinsics: 2,
            n_cameras_extrinsics: 1,
            n_frames: 3,
            n_points: 4,
            n_points_fixed: 1,
            n_observations_board: 1,
            n_observations_point: 2,
            n_observations_triangulated: 0,
        }
    }

    fn state() -> CalibrationState {
        CalibrationState {
            intrinsics: vec![
                DVector::from_vec(vec![1000.0, 1010.0, 639.5, 479.5, -0.1, 0.02, 1e-3, -2e-3]),
                DVector::from_vec(vec![900.0, 905.0, 640.0, 480.0, -0.2, 0.05, 0.0, 1e-4]),
            ],
            extrinsics: vec![Pose::new(Vector3::new(0.01, -0.02, 0.03), Vector3::new(-0.5, 0.0, 0.01))],
            frames: (0..3)
                .map(|i| Pose::new(Vector3::new(0.1 * i as f64, 0.2, -0.1), Vector3::new(0.0, 0.1, 2.0 + i as f64)))
                .collect(),
            points: (0..4).map(|i| Vector3::new(i as f64, 1.0, 5.0)).collect(),
            n_points_fixed: 1,
            calobject_warp: CalobjectWarp::new(1e-3, -2e-3),
        }
    }

    fn all_selection_combinations() -> Vec<ProblemSelections> {
        (0..32u32)
            .map(|bits| {
                ProblemSelections::none()
                    .with_intrinsics_core(bits & 1 != 0)
                    .with_intrinsics_distortions(bits & 2 != 0)
                    .with_extrinsics(bits & 4 != 0)
                    .with_frames(bits & 8 != 0)
                    .with_calobject_warp(bits & 16 != 0)
            })
            .collect()
    }

    #[test]
    fn test_pack_unpack_round_trip_for_every_selection() -> TestResult {
        let original = state();
        for selections in all_selection_combinations() {
            let schema =
                ParameterSchema::new(dims(), selections, LensModel::OpenCv4, ScaleConfig::default());
            let packed = schema.pack(&original)?;
            assert_eq!(packed.len(), schema.num_states());

            let mut scrambled = original.clone();
            schema.unpack(&DVector::zeros(schema.num_states()), &mut scrambled)?;
            schema.unpack(&packed, &mut scrambled)?;
            for (a, b) in scrambled.intrinsics.iter().zip(&original.intrinsics) {
                assert!((a - b).norm() < 1e-9, "{selections:?}");
            }
            for (a, b) in scrambled.frames.iter().zip(&original.frames) {
                assert!((a.r - b.r).norm() < 1e-12 && (a.t - b.t).norm() < 1e-12);
            }
            for (a, b) in scrambled.extrinsics.iter().zip(&original.extrinsics) {
                assert!((a.r - b.r).norm() < 1e-12 && (a.t - b.t).norm() < 1e-12);
            }
            for (a, b) in scrambled.points.iter().zip(&original.points) {
                assert!((a - b).norm() < 1e-12);
            }
            assert!((scrambled.calobject_warp.x2 - original.calobject_warp.x2).abs() < 1e-15);
        }
        Ok(())
    }

    #[test]
    fn test_excluded_quantities_are_left_alone() -> TestResult {
        let schema = ParameterSchema::new(
            dims(),
            ProblemSelections::none().with_extrinsics(true),
            LensModel::OpenCv4,
            ScaleConfig::default(),
        );
        assert_eq!(schema.num_states(), 6);
        assert_eq!(schema.state_index_intrinsics(0), None);
        assert_eq!(schema.state_index_frame(0), None);
        assert_eq!(schema.state_index_extrinsics(0), Some(0));

        let mut updated = state();
        schema.unpack(&DVector::zeros(6), &mut updated)?;
        assert_eq!(updated.intrinsics, state().intrinsics);
        assert_eq!(updated.extrinsics[0], Pose::identity());
        Ok(())
    }

    #[test]
    fn test_offsets_follow_state_order() {
        let schema = ParameterSchema::new(
            dims(),
            ProblemSelections::default().with_calobject_warp(true),
            LensModel::OpenCv4,
            ScaleConfig::default(),
        );
        assert_eq!(schema.num_intrinsics_optimization_params(), 8);
        assert_eq!(schema.state_index_intrinsics(1), Some(8));
        assert_eq!(schema.state_index_intrinsics_distortions(1), Some(12));
        assert_eq!(schema.state_index_extrinsics(0), Some(16));
        assert_eq!(schema.state_index_frame(2), Some(22 + 12));
        assert_eq!(schema.state_index_point(0), Some(40));
        assert_eq!(schema.state_index_point(2), Some(46));
        assert_eq!(schema.state_index_point(3), None);
        assert_eq!(schema.state_index_calobject_warp(), Some(49));
        assert_eq!(schema.num_states(), 51);
        assert_eq!(schema.column_scales().len(), 51);
    }

    #[test]
    fn test_mismatched_state_is_rejected() {
        let schema =
            ParameterSchema::new(dims(), ProblemSelections::default(), LensModel::OpenCv4, ScaleConfig::default());
        let mut bad = state();
        bad.intrinsics[1] = DVector::zeros(5);
        assert!(matches!(schema.pack(&bad), Err(CoreError::DimensionMismatch(_))));

        let mut ok = state();
        assert!(schema.unpack(&DVector::zeros(3), &mut ok).is_err());
    }

    #[test]
    fn test_measurement_layout_blocks() -> TestResult {
        let board = CalibrationObject::new(4, 3, 0.05);
        let mut observations = Observations::new();
        let px = ObservedPixel::new(0.0, 0.0, 1.0);
        observations.add_board(CameraIndex::new(1, Some(0)), 2, &[px; 12]);
        observations.add_point(CameraIndex::reference(0), 0, px);
        observations.add_point(CameraIndex::new(1, Some(0)), 3, px);

        let schema = ParameterSchema::new(
            dims(),
            ProblemSelections::default(),
            LensModel::OpenCv4,
            ScaleConfig::default(),
        );
        let constants = ProblemConstants::default().with_point_range(Some(0.5), None);
        let layout = MeasurementLayout::new(&schema, &observations, Some(&board), &constants)?;
        assert_eq!(layout.board, 0..24);
        assert_eq!(layout.points, 24..28);
        assert_eq!(layout.regularization_distortion, 28..36);
        assert_eq!(layout.regularization_centering, 36..40);
        assert!(layout.regularization_unity_cam01.is_empty());
        assert_eq!(layout.regularization_point_range, 40..42);
        assert_eq!(layout.num_measurements(), 42);

        // board rows: 6 intrinsics + 6 extrinsics + 6 frame
        // point rows: 6 + 0 + 3 and 6 + 6 + 0 (point 3 is fixed)
        // regularization: 8 + 4, point range: 3 + 6
        assert_eq!(
            layout.num_jacobian_nonzeros(),
            24 * 18 + 2 * 9 + 2 * 12 + 8 + 4 + 3 + 6
        );

        assert!(MeasurementLayout::new(&schema, &observations, None, &constants).is_err());
        Ok(())
    }
}
