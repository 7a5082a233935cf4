//! Residual vector and sparse Jacobian accumulation.
//!
//! Rows are written in order. Every entry pushed is kept, explicit zeros
//! included, so outlier rows keep their place in the sparsity pattern.

use crate::core::{CoreError, CoreResult};
use faer::Mat;
use faer::sparse::{Pair, SparseColMat, SymbolicSparseColMat};

/// Builds `x` and `J` for one evaluation of the calibration problem
#[derive(Debug, Clone)]
pub struct JacobianBuilder {
    nrows: usize,
    ncols: usize,
    residuals: Mat<f64>,
    /// Column scale of the packed state, applied to every pushed gradient
    column_scales: Vec<f64>,
    want_jacobian: bool,
    indices: Vec<Pair<usize, usize>>,
    values: Vec<f64>,
}

impl JacobianBuilder {
    pub fn new(
        nrows: usize,
        column_scales: &[f64],
        expected_nonzeros: usize,
        want_jacobian: bool,
    ) -> Self {
        let capacity = if want_jacobian { expected_nonzeros } else { 0 };
        Self {
            nrows,
            ncols: column_scales.len(),
            residuals: Mat::zeros(nrows, 1),
            column_scales: column_scales.to_vec(),
            want_jacobian,
            indices: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn wants_jacobian(&self) -> bool {
        self.want_jacobian
    }

    pub fn set_residual(&mut self, row: usize, value: f64) {
        self.residuals[(row, 0)] = value;
    }

    /// Record `∂x[row]/∂state[col]`, given with respect to the physical value
    pub fn push(&mut self, row: usize, col: usize, gradient: f64) {
        if self.want_jacobian {
            self.indices.push(Pair::new(row, col));
            self.values.push(gradient * self.column_scales[col]);
        }
    }

    /// Record gradients of `row` with respect to consecutive columns
    pub fn push_block(&mut self, row: usize, col: usize, gradients: &[f64]) {
        for (k, gradient) in gradients.iter().enumerate() {
            self.push(row, col + k, *gradient);
        }
    }

    /// Record structural zeros at consecutive columns
    pub fn push_zeros(&mut self, row: usize, col: usize, count: usize) {
        for k in 0..count {
            self.push(row, col + k, 0.0);
        }
    }

    pub fn num_nonzeros(&self) -> usize {
        self.indices.len()
    }

    /// Finish the evaluation. The Jacobian is `None` unless requested.
    pub fn finish(self) -> CoreResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
        if !self.want_jacobian {
            return Ok((self.residuals, None));
        }
        let (pattern, order) =
            SymbolicSparseColMat::try_new_from_indices(self.nrows, self.ncols, &self.indices)
                .map_err(|e| {
                    CoreError::SymbolicStructure(
                        "Failed to build Jacobian sparsity pattern".to_string(),
                    )
                    .log_with_source(e)
                })?;
        let jacobian = SparseColMat::new_from_argsort(pattern, &order, self.values.as_slice())
            .map_err(|e| {
                CoreError::SymbolicStructure("Failed to fill sparse Jacobian".to_string())
                    .log_with_source(e)
            })?;
        Ok((self.residuals, Some(jacobian)))
    }
}

/// Dense copy of a sparse Jacobian, for inspection and gradient checks
pub fn to_dense(jacobian: &SparseColMat<usize, f64>) -> Mat<f64> {
    let mut dense = Mat::zeros(jacobian.nrows(), jacobian.ncols());
    let symbolic = jacobian.symbolic();
    for col in 0..jacobian.ncols() {
        let rows = symbolic.row_idx_of_col_raw(col);
        let values = jacobian.val_of_col(col);
        for (row, value) in rows.iter().zip(values) {
            dense[(*row, col)] += *value;
        }
    }
    dense
}

/// Columns with a stored entry in `row`, explicit zeros included
pub fn row_pattern(jacobian: &SparseColMat<usize, f64>, row: usize) -> Vec<usize> {
    let symbolic = jacobian.symbolic();
    (0..jacobian.ncols())
        .filter(|&col| symbolic.row_idx_of_col_raw(col).contains(&row))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_scaled_entries_and_structural_zeros() -> TestResult {
        let mut builder = JacobianBuilder::new(2, &[2.0, 0.5, 1.0], 4, true);
        builder.set_residual(0, 1.5);
        builder.push_block(0, 0, &[1.0, 4.0]);
        builder.push_zeros(1, 1, 2);
        assert_eq!(builder.num_nonzeros(), 4);

        let (residuals, jacobian) = builder.finish()?;
        let jacobian = jacobian.ok_or("jacobian requested")?;
        assert_eq!(residuals[(0, 0)], 1.5);
        assert_eq!(jacobian.symbolic().compute_nnz(), 4);
        let dense = to_dense(&jacobian);
        assert_eq!(dense[(0, 0)], 2.0);
        assert_eq!(dense[(0, 1)], 2.0);
        assert_eq!(dense[(1, 2)], 0.0);
        assert_eq!(row_pattern(&jacobian, 1), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_residuals_only() -> TestResult {
        let mut builder = JacobianBuilder::new(1, &[1.0], 1, false);
        builder.push(0, 0, 3.0);
        assert_eq!(builder.num_nonzeros(), 0);
        let (_, jacobian) = builder.finish()?;
        assert!(jacobian.is_none());
        Ok(())
    }
}
