use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Sparse Cholesky solver for the calibration normal equations.
///
/// Outliers stay in the Jacobian as explicit zeros, so the sparsity pattern
/// of `JᵀJ` is usually constant across iterations and the symbolic
/// factorization is reused. Splined models move their control-point
/// neighborhoods as the projections move; the pattern is compared on every
/// solve and the symbolic factorization redone when it changed.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,

    /// Cached symbolic factorization, valid as long as the pattern of `JᵀJ` holds.
    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// Column pointers and row indices the cached factorization was built for
    symbolic_pattern: Option<(Vec<usize>, Vec<usize>)>,

    /// `JᵀJ` from the most recent solve
    hessian: Option<SparseColMat<usize, f64>>,

    /// `Jᵀr` from the most recent solve
    gradient: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached symbolic factorization.
    ///
    /// Needed when the Jacobian pattern changes, e.g. between two different
    /// calibration problems solved with the same solver instance.
    pub fn reset_symbolic(&mut self) {
        self.symbolic_factorization = None;
        self.symbolic_pattern = None;
        self.factorizer = None;
    }

    fn pattern_matches(&self, system: &SparseColMat<usize, f64>) -> bool {
        let symbolic = system.symbolic();
        match &self.symbolic_pattern {
            Some((col_ptr, row_idx)) => {
                col_ptr.as_slice() == symbolic.col_ptr() && row_idx.as_slice() == symbolic.row_idx()
            }
            None => false,
        }
    }

    fn normal_equations(
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        let jt = jacobian.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobian.as_ref());
        let gradient = jacobian.as_ref().transpose().mul(residuals);
        Ok((hessian, gradient))
    }

    fn factor_and_solve(
        &mut self,
        system: &SparseColMat<usize, f64>,
        hessian: SparseColMat<usize, f64>,
        gradient: Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        if !self.pattern_matches(system) {
            self.symbolic_factorization = None;
        }
        let sym = match &self.symbolic_factorization {
            // SymbolicLlt is reference counted; the clone is O(1)
            Some(cached) => cached.clone(),
            None => {
                let new_sym = SymbolicLlt::try_new(system.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(
                        "Symbolic Cholesky decomposition failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
                self.symbolic_factorization = Some(new_sym.clone());
                self.symbolic_pattern = Some((
                    system.symbolic().col_ptr().to_vec(),
                    system.symbolic().row_idx().to_vec(),
                ));
                new_sym
            }
        };

        let cholesky = Llt::try_new_with_symbolic(sym, system.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        let dx = cholesky.solve(-&gradient);
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        self.factorizer = Some(cholesky);
        Ok(dx)
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = Self::normal_equations(residuals, jacobian)?;
        let system = hessian.clone();
        self.factor_and_solve(&system, hessian, gradient)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let n = jacobian.ncols();
        let (hessian, gradient) = Self::normal_equations(residuals, jacobian)?;

        // H_aug = H + λI
        let lambda_i_triplets: Vec<Triplet<usize, usize, f64>> =
            (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
        let lambda_i =
            SparseColMat::try_new_from_triplets(n, n, &lambda_i_triplets).map_err(|e| {
                LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
                    .log_with_source(e)
            })?;
        let augmented = &hessian + lambda_i;

        self.factor_and_solve(&augmented, hessian, gradient)
    }

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Overdetermined 4x3 system with a known, well-conditioned normal matrix
    fn create_test_data()
    -> Result<(SparseColMat<usize, f64>, Mat<f64>), faer::sparse::CreationError> {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(1, 2, 1.0),
            Triplet::new(2, 1, 1.0),
            Triplet::new(2, 2, 2.0),
            Triplet::new(3, 0, 1.5),
            Triplet::new(3, 2, 0.5),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(4, 3, &triplets)?;
        let residuals = Mat::from_fn(4, 1, |i, _| [1.0, -2.0, 0.5, 1.2][i]);
        Ok((jacobian, residuals))
    }

    #[test]
    fn test_normal_equation_solves_least_squares() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let step = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert_eq!(step.nrows(), 3);

        // At the least-squares step the gradient of |r + J h|² vanishes: Jᵀ(r + J h) = 0
        let predicted = &residuals + jacobian.as_ref().mul(&step);
        let normal = jacobian.as_ref().transpose().mul(&predicted);
        for i in 0..3 {
            assert!(normal[(i, 0)].abs() < TOLERANCE, "row {i}: {}", normal[(i, 0)]);
        }
        Ok(())
    }

    #[test]
    fn test_symbolic_factorization_is_reused() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let first = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert!(solver.symbolic_factorization.is_some());
        let second = solver.solve_normal_equation(&residuals, &jacobian)?;

        for i in 0..first.nrows() {
            assert!((first[(i, 0)] - second[(i, 0)]).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_changed_pattern_refreshes_symbolic() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;
        solver.solve_normal_equation(&residuals, &jacobian)?;

        // Diagonal Jacobian: JᵀJ loses its off-diagonal entries
        let triplets: Vec<_> = (0..3).map(|i| Triplet::new(i, i, 2.0)).collect();
        let diagonal = SparseColMat::try_new_from_triplets(4, 3, &triplets)?;
        let step = solver.solve_normal_equation(&residuals, &diagonal)?;
        for i in 0..3 {
            assert!((step[(i, 0)] + residuals[(i, 0)] / 2.0).abs() < TOLERANCE);
        }
        let (col_ptr, _) = solver.symbolic_pattern.as_ref().ok_or("no cached pattern")?;
        assert_eq!(col_ptr.as_slice(), diagonal.symbolic().col_ptr());
        Ok(())
    }

    #[test]
    fn test_damping_shrinks_step() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let small = solver.solve_augmented_equation(&residuals, &jacobian, 1e-6)?;
        let large = solver.solve_augmented_equation(&residuals, &jacobian, 1e3)?;
        assert!(large.norm_l2() < small.norm_l2());
        assert!(solver.get_gradient().is_some());
        assert!(solver.get_hessian().is_some());
        Ok(())
    }

    #[test]
    fn test_structural_zero_column_needs_damping() -> TestResult {
        // Column 1 is present in the pattern but all-zero: JᵀJ is singular, JᵀJ + λI is not
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 0.0),
            Triplet::new(1, 0, 2.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| i as f64 + 1.0);

        let mut undamped = SparseCholeskySolver::new();
        assert!(undamped.solve_normal_equation(&residuals, &jacobian).is_err());

        let mut damped = SparseCholeskySolver::new();
        let step = damped.solve_augmented_equation(&residuals, &jacobian, 1e-3)?;
        assert!(step[(1, 0)].abs() < TOLERANCE);
        Ok(())
    }
}
