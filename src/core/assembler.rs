//! Residual and Jacobian assembly.
//!
//! The assembler is the callback the solver drives. Given a packed state it
//! rebuilds the physical state and walks the measurements in layout order:
//!
//! 1. board corners, two rows each: `w·(q − q_obs)`
//! 2. point observations, two rows each
//! 3. regularization: distortion, centering, unity-cam01, point range
//! 4. triangulated pairs, one row each
//!
//! Jacobian entries are pushed with respect to physical quantities and
//! scaled to the packed state by the [`JacobianBuilder`]. Outliers and
//! failed projections keep their rows and columns as explicit zeros, so the
//! sparsity pattern only depends on the layout. The one exception is the
//! splined model, whose control-point neighborhood follows the projection.

use crate::core::jacobian::JacobianBuilder;
use crate::core::observation::{CameraIndex, ObservedPixel, Observations};
use crate::core::problem::CalibrationProblemSpec;
use crate::core::regularization::{RegularizationScales, point_range_error};
use crate::core::schema::{MeasurementLayout, ParameterSchema};
use crate::core::state::CalibrationState;
use crate::core::triangulation::{pair_geometry, triangulate_rays, triangulated_error};
use crate::core::CoreResult;
use crate::geometry::Pose;
use crate::lensmodel::{IntrinsicsGradient, LensModel, Projection};
use faer::Mat;
use faer::sparse::SparseColMat;
use nalgebra::{DVector, Matrix2, Matrix2x3, RowVector3, Vector2, Vector3};

/// Jacobian columns of one pixel measurement besides the intrinsics
struct PixelColumns {
    /// `(first column, ∂q/∂block)` for 3-column blocks
    blocks: Vec<(usize, Matrix2x3<f64>)>,
    /// `(column, ∂q/∂(x2, y2))`
    warp: Option<(usize, Matrix2<f64>)>,
}

/// Evaluates residuals and Jacobians of one calibration problem
#[derive(Debug, Clone)]
pub struct Assembler<'a> {
    model: LensModel,
    spec: &'a CalibrationProblemSpec,
    baseline: &'a CalibrationState,
    observations: &'a Observations,
    schema: ParameterSchema,
    layout: MeasurementLayout,
    regularization: RegularizationScales,
    column_scales: Vec<f64>,
    /// Unprojected triangulated observations
    rays: Vec<Option<Vector3<f64>>>,
}

impl<'a> Assembler<'a> {
    pub fn new(
        spec: &'a CalibrationProblemSpec,
        baseline: &'a CalibrationState,
        observations: &'a Observations,
        schema: ParameterSchema,
        layout: MeasurementLayout,
        regularization: RegularizationScales,
        rays: Vec<Option<Vector3<f64>>>,
    ) -> Self {
        let column_scales = schema.column_scales().as_slice().to_vec();
        Self {
            model: spec.lens_model,
            spec,
            baseline,
            observations,
            schema,
            layout,
            regularization,
            column_scales,
            rays,
        }
    }

    pub fn baseline(&self) -> &'a CalibrationState {
        self.baseline
    }

    fn unpack(&self, packed: &DVector<f64>) -> CoreResult<CalibrationState> {
        let mut state = self.baseline.clone();
        self.schema.unpack(packed, &mut state)?;
        Ok(state)
    }

    /// Residuals at `packed`, and the Jacobian when `want_jacobian` is set
    pub fn evaluate(
        &self,
        packed: &DVector<f64>,
        want_jacobian: bool,
    ) -> CoreResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
        let state = self.unpack(packed)?;
        let mut builder = JacobianBuilder::new(
            self.layout.num_measurements(),
            &self.column_scales,
            self.layout.num_jacobian_nonzeros(),
            want_jacobian,
        );

        let mut row = 0;
        row = self.evaluate_boards(&state, &mut builder, row);
        row = self.evaluate_points(&state, &mut builder, row);
        row = self.evaluate_regularization(&state, &mut builder, row);
        row = self.evaluate_triangulated(&state, &mut builder, row);

        assert_eq!(
            row,
            self.layout.num_measurements(),
            "assembled rows disagree with the measurement layout"
        );
        if want_jacobian {
            assert_eq!(
                builder.num_nonzeros(),
                self.layout.num_jacobian_nonzeros(),
                "assembled Jacobian entries disagree with the measurement layout"
            );
        }
        builder.finish()
    }

    fn camera_pose(&self, state: &CalibrationState, camera: &CameraIndex) -> Pose {
        camera
            .extrinsics
            .map(|i| state.extrinsics[i])
            .unwrap_or_else(Pose::identity)
    }

    fn evaluate_boards(
        &self,
        state: &CalibrationState,
        builder: &mut JacobianBuilder,
        mut row: usize,
    ) -> usize {
        debug_assert_eq!(row, self.layout.board.start);
        let Some(object) = self.spec.calibration_object.as_ref() else {
            return row;
        };
        let warp_col = self.schema.state_index_calobject_warp();

        for (k, observation) in self.observations.boards.iter().enumerate() {
            let intrinsics = state.intrinsics[observation.camera.intrinsics].as_slice();
            let extrinsics = self.camera_pose(state, &observation.camera);
            let frame = state.frames[observation.frame];
            let ext_col = self.schema.state_index_camera(&observation.camera);
            let frame_col = self.schema.state_index_frame(observation.frame);
            let r_ext = extrinsics.rotation();
            let r_frame = frame.rotation();
            let pixels = self.observations.board(k, object.num_corners());

            for j in 0..object.height {
                for i in 0..object.width {
                    let px = &pixels[j * object.width + i];
                    let p_ref = frame.transform_point_with_gradients(&object.corner(
                        i,
                        j,
                        &state.calobject_warp,
                    ));
                    let p_cam = extrinsics.transform_point_with_gradients(&p_ref.point);
                    let projection = self.model.project_with_gradients(&p_cam.point, intrinsics);

                    let dq_dp = projection
                        .as_ref()
                        .map(|p| p.dq_dp)
                        .unwrap_or_else(Matrix2x3::zeros);
                    let dq_dref = dq_dp * r_ext;
                    let mut blocks = Vec::with_capacity(4);
                    if let Some(col) = ext_col {
                        blocks.push((col, dq_dp * p_cam.d_dr));
                        blocks.push((col + 3, dq_dp));
                    }
                    if let Some(col) = frame_col {
                        blocks.push((col, dq_dref * p_ref.d_dr));
                        blocks.push((col + 3, dq_dref));
                    }
                    let warp = warp_col.map(|col| {
                        let dz = object.warp_gradient(i, j);
                        let dq_dz = dq_dref * r_frame.column(2);
                        (col, Matrix2::from_columns(&[dq_dz * dz.x, dq_dz * dz.y]))
                    });

                    self.push_pixel(
                        builder,
                        row,
                        observation.camera.intrinsics,
                        px,
                        projection.as_ref(),
                        &PixelColumns { blocks, warp },
                    );
                    row += 2;
                }
            }
        }
        row
    }

    fn evaluate_points(
        &self,
        state: &CalibrationState,
        builder: &mut JacobianBuilder,
        mut row: usize,
    ) -> usize {
        debug_assert_eq!(row, self.layout.points.start);
        for observation in &self.observations.points {
            let intrinsics = state.intrinsics[observation.camera.intrinsics].as_slice();
            let extrinsics = self.camera_pose(state, &observation.camera);
            let p_cam = extrinsics.transform_point_with_gradients(&state.points[observation.point]);
            let projection = self.model.project_with_gradients(&p_cam.point, intrinsics);
            let dq_dp = projection
                .as_ref()
                .map(|p| p.dq_dp)
                .unwrap_or_else(Matrix2x3::zeros);

            let mut blocks = Vec::with_capacity(3);
            if let Some(col) = self.schema.state_index_camera(&observation.camera) {
                blocks.push((col, dq_dp * p_cam.d_dr));
                blocks.push((col + 3, dq_dp));
            }
            if let Some(col) = self.schema.state_index_point(observation.point) {
                blocks.push((col, dq_dp * p_cam.d_dp));
            }

            self.push_pixel(
                builder,
                row,
                observation.camera.intrinsics,
                &observation.px,
                projection.as_ref(),
                &PixelColumns { blocks, warp: None },
            );
            row += 2;
        }
        row
    }

    /// Two rows of one observed pixel
    fn push_pixel(
        &self,
        builder: &mut JacobianBuilder,
        row: usize,
        icam: usize,
        px: &ObservedPixel,
        projection: Option<&Projection>,
        columns: &PixelColumns,
    ) {
        let valid = projection.filter(|_| !px.is_outlier());
        let weight = px.weight;
        let observed = Vector2::new(px.x, px.y);

        for axis in 0..2 {
            let r = row + axis;
            let scale = if valid.is_some() { weight } else { 0.0 };
            if let Some(projection) = valid {
                builder.set_residual(r, weight * (projection.q[axis] - observed[axis]));
            }
            if !builder.wants_jacobian() {
                continue;
            }
            self.push_intrinsics(builder, r, icam, axis, projection, scale);
            for (col, d) in &columns.blocks {
                for k in 0..3 {
                    builder.push(r, col + k, if valid.is_some() { scale * d[(axis, k)] } else { 0.0 });
                }
            }
            if let Some((col, d)) = &columns.warp {
                for k in 0..2 {
                    builder.push(r, col + k, if valid.is_some() { scale * d[(axis, k)] } else { 0.0 });
                }
            }
        }
    }

    /// Intrinsics entries of one pixel row. `projection` locates the
    /// control points of a splined model even when `scale` is zero.
    fn push_intrinsics(
        &self,
        builder: &mut JacobianBuilder,
        row: usize,
        icam: usize,
        axis: usize,
        projection: Option<&Projection>,
        scale: f64,
    ) {
        let gradient = projection.map(|p| &p.dq_dintrinsics);
        let value = |v: f64| if scale == 0.0 { 0.0 } else { scale * v };

        if let Some(core) = self.schema.state_index_intrinsics_core(icam) {
            let (df, dc) = match gradient {
                Some(IntrinsicsGradient::Dense(m)) => (m[(axis, axis)], m[(axis, 2 + axis)]),
                Some(IntrinsicsGradient::Splined(g)) => (g.dq_dfxy[axis], 1.0),
                None => (0.0, 0.0),
            };
            builder.push(row, core + axis, value(df));
            builder.push(row, core + 2 + axis, value(dc));
        }

        let Some(distortion) = self.schema.state_index_intrinsics_distortions(icam) else {
            return;
        };
        match (&self.model, gradient) {
            (LensModel::SplinedStereographic(config), gradient) => {
                let width = config.order as usize + 1;
                let nx = config.nx as usize;
                let (ix0, iy0) = match gradient {
                    Some(IntrinsicsGradient::Splined(g)) => (g.ix0, g.iy0),
                    _ => (0, 0),
                };
                for j in 0..width {
                    for i in 0..width {
                        let v = match gradient {
                            Some(IntrinsicsGradient::Splined(g)) => {
                                g.fxy[axis] * g.weights[j * width + i]
                            }
                            _ => 0.0,
                        };
                        let control = 2 * ((iy0 + j) * nx + ix0 + i) + axis;
                        builder.push(row, distortion + control, value(v));
                    }
                }
            }
            (_, gradient) => {
                for k in 0..self.model.num_distortion_params() {
                    let v = match gradient {
                        Some(IntrinsicsGradient::Dense(m)) => m[(axis, 4 + k)],
                        _ => 0.0,
                    };
                    builder.push(row, distortion + k, value(v));
                }
            }
        }
    }

    fn evaluate_regularization(
        &self,
        state: &CalibrationState,
        builder: &mut JacobianBuilder,
        mut row: usize,
    ) -> usize {
        debug_assert_eq!(row, self.layout.regularization_distortion.start);
        let n_cameras = state.intrinsics.len();

        if !self.layout.regularization_distortion.is_empty() {
            for icam in 0..n_cameras {
                let offset = self.schema.state_index_intrinsics_distortions(icam);
                for (k, scale) in self.regularization.distortion.iter().enumerate() {
                    builder.set_residual(row, scale * state.intrinsics[icam][4 + k]);
                    if let Some(col) = offset {
                        builder.push(row, col + k, *scale);
                    }
                    row += 1;
                }
            }
        }

        if !self.layout.regularization_centering.is_empty() {
            let scale = self.regularization.centering;
            for icam in 0..n_cameras {
                let offset = self.schema.state_index_intrinsics_core(icam);
                for axis in 0..2 {
                    let center = (self.spec.imager_sizes[icam][axis] as f64 - 1.0) / 2.0;
                    builder.set_residual(row, scale * (state.intrinsics[icam][2 + axis] - center));
                    if let Some(col) = offset {
                        builder.push(row, col + 2 + axis, scale);
                    }
                    row += 1;
                }
            }
        }

        if !self.layout.regularization_unity_cam01.is_empty() {
            let weight = self.regularization.unity_cam01;
            let t0 = state.extrinsics[0].t;
            builder.set_residual(row, weight * (t0.norm_squared() - 1.0));
            if let Some(col) = self.schema.state_index_extrinsics(0) {
                builder.push_block(row, col + 3, (t0 * (2.0 * weight)).as_slice());
            }
            row += 1;
        }

        if !self.layout.regularization_point_range.is_empty() {
            let constants = &self.spec.constants;
            let weight = self.regularization.point_range;
            for observation in &self.observations.points {
                let extrinsics = self.camera_pose(state, &observation.camera);
                let p_cam =
                    extrinsics.transform_point_with_gradients(&state.points[observation.point]);
                let distance = p_cam.point.norm();
                let (error, d_error) =
                    point_range_error(distance, constants.point_min_range, constants.point_max_range);
                builder.set_residual(row, weight * error);

                // ∂error/∂p_cam, zero on the unpenalized range
                let de_dp = if distance > 0.0 {
                    p_cam.point.transpose() * (weight * d_error / distance)
                } else {
                    RowVector3::zeros()
                };
                if let Some(col) = self.schema.state_index_camera(&observation.camera) {
                    builder.push_block(row, col, (de_dp * p_cam.d_dr).as_slice());
                    builder.push_block(row, col + 3, de_dp.as_slice());
                }
                if let Some(col) = self.schema.state_index_point(observation.point) {
                    builder.push_block(row, col, (de_dp * p_cam.d_dp).as_slice());
                }
                row += 1;
            }
        }
        row
    }

    fn evaluate_triangulated(
        &self,
        state: &CalibrationState,
        builder: &mut JacobianBuilder,
        mut row: usize,
    ) -> usize {
        debug_assert_eq!(row, self.layout.triangulated.start);
        let observations = &self.observations.triangulated;
        for set in &self.layout.triangulated_sets {
            for i in set.clone() {
                for j in i + 1..set.end {
                    let (oi, oj) = (&observations[i], &observations[j]);
                    let pose_i = self.camera_pose(state, &oi.camera);
                    let pose_j = self.camera_pose(state, &oj.camera);
                    let col_i = self.schema.state_index_camera(&oi.camera);
                    let col_j = self.schema.state_index_camera(&oj.camera);

                    let evaluated = match (&self.rays[i], &self.rays[j]) {
                        (Some(v0), Some(vj)) if !oi.outlier && !oj.outlier => {
                            let geometry = pair_geometry(&pose_i, &pose_j, vj);
                            triangulated_error(v0, &geometry.v1, &geometry.t01)
                                .map(|error| (geometry, error))
                        }
                        _ => None,
                    };

                    let (gradient_i, gradient_j) = match evaluated {
                        Some((geometry, pair)) => {
                            let scale = self.pair_scale(
                                state,
                                oi.camera,
                                oj.camera,
                                oi.px.weight,
                                oj.px.weight,
                            );
                            builder.set_residual(row, scale * pair.error);
                            let dv1 = pair.d_dv1.transpose() * scale;
                            let dt01 = pair.d_dt01.transpose() * scale;
                            let dr_i = dv1 * geometry.dv1_dri + dt01 * geometry.dt01_dri;
                            let dr_j = dv1 * geometry.dv1_drj + dt01 * geometry.dt01_drj;
                            let dt_j = dt01 * geometry.dt01_dtj;
                            (
                                [dr_i[0], dr_i[1], dr_i[2], dt01[0], dt01[1], dt01[2]],
                                [dr_j[0], dr_j[1], dr_j[2], dt_j[0], dt_j[1], dt_j[2]],
                            )
                        }
                        None => ([0.0; 6], [0.0; 6]),
                    };
                    if let Some(col) = col_i {
                        builder.push_block(row, col, &gradient_i);
                    }
                    if let Some(col) = col_j {
                        builder.push_block(row, col, &gradient_j);
                    }
                    row += 1;
                }
            }
        }
        row
    }

    /// Mean weight times mean focal length: turns the angular error of a
    /// pair into pixels
    fn pair_scale(
        &self,
        state: &CalibrationState,
        camera_i: CameraIndex,
        camera_j: CameraIndex,
        weight_i: f64,
        weight_j: f64,
    ) -> f64 {
        let focal = |camera: CameraIndex| {
            let intrinsics = &state.intrinsics[camera.intrinsics];
            (intrinsics[0] + intrinsics[1]) / 2.0
        };
        let mean_focal = (focal(camera_i) + focal(camera_j)) / 2.0;
        (weight_i.abs() + weight_j.abs()) / 2.0 * mean_focal
    }

    /// Whether each triangulated pair, in layout order, diverges at `packed`.
    /// Pairs that cannot be evaluated report `false`.
    pub fn divergent_pairs(&self, packed: &DVector<f64>) -> CoreResult<Vec<bool>> {
        let state = self.unpack(packed)?;
        let observations = &self.observations.triangulated;
        let mut divergent = Vec::with_capacity(self.layout.triangulated.len());
        for set in &self.layout.triangulated_sets {
            for i in set.clone() {
                for j in i + 1..set.end {
                    let flag = match (&self.rays[i], &self.rays[j]) {
                        (Some(v0), Some(vj)) => {
                            let pose_i = self.camera_pose(&state, &observations[i].camera);
                            let pose_j = self.camera_pose(&state, &observations[j].camera);
                            let geometry = pair_geometry(&pose_i, &pose_j, vj);
                            triangulated_error(v0, &geometry.v1, &geometry.t01)
                                .is_some_and(|pair| !pair.convergent)
                        }
                        _ => false,
                    };
                    divergent.push(flag);
                }
            }
        }
        Ok(divergent)
    }

    /// Reference-frame position of each triangulated feature at `packed`,
    /// from its inlier rays. `None` for features with fewer than two usable
    /// rays or degenerate geometry.
    pub fn triangulated_points(&self, packed: &DVector<f64>) -> CoreResult<Vec<Option<Vector3<f64>>>> {
        let state = self.unpack(packed)?;
        let observations = &self.observations.triangulated;
        Ok(self
            .layout
            .triangulated_sets
            .iter()
            .map(|set| {
                let rays: Vec<(Vector3<f64>, Vector3<f64>)> = set
                    .clone()
                    .filter(|&i| !observations[i].outlier)
                    .filter_map(|i| {
                        let v = self.rays[i]?;
                        let camera_from_ref = self.camera_pose(&state, &observations[i].camera);
                        let ref_from_camera = camera_from_ref.inverse();
                        let direction: Vector3<f64> = ref_from_camera.rotation() * v;
                        Some((ref_from_camera.t, direction))
                    })
                    .collect();
                triangulate_rays(&rays)
            })
            .collect())
    }
}
