//! Levenberg-Marquardt algorithm implementation.
//!
//! Solves nonlinear least squares problems of the form:
//!
//! ```text
//! min f(p) = ½||x(p)||² = ½Σᵢ xᵢ(p)²
//! ```
//!
//! where `x: ℝⁿ → ℝᵐ` is the residual vector returned by the problem callback.
//!
//! # Algorithm Overview
//!
//! Each iteration solves the damped normal equations:
//!
//! ```text
//! (J^T·J + λI)·h = -J^T·x
//! ```
//!
//! where:
//! - `J` is the sparse Jacobian (m × n)
//! - `x` is the residual vector (m × 1)
//! - `h` is the step (n × 1)
//! - `λ` is the adaptive damping parameter
//!
//! ## Step Acceptance and Damping Update
//!
//! The step is judged by the gain ratio:
//!
//! ```text
//! ρ = [f(pₖ) - f(pₖ + h)] / [f(pₖ) - L(h)]
//! ```
//!
//! where `L(h)` is the local quadratic model. A step with `ρ > 0` is accepted
//! and the damping follows Nielsen's formula:
//!
//! ```text
//! λₖ₊₁ = λₖ · max(1/3, 1 - (2ρ - 1)³)
//! ```
//!
//! A rejected step multiplies λ by a doubling factor ν.
//!
//! ## Sparsity
//!
//! Calibration problems keep outliers as explicit zeros, so the pattern of
//! `JᵀJ` rarely changes and the symbolic Cholesky factorization is reused
//! across iterations. See [`SparseCholeskySolver`].
//!
//! # Examples
//!
//! ```
//! use apex_calib::optimizer::levenberg_marquardt::LevenbergMarquardtConfig;
//!
//! let config = LevenbergMarquardtConfig::new()
//!     .with_max_iterations(100)
//!     .with_cost_tolerance(1e-10)
//!     .with_damping(1e-3)
//!     .with_damping_bounds(1e-12, 1e12)
//!     .with_jacobi_scaling(true);
//! ```
//!
//! # References
//!
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least Squares Problems* (2nd ed.). Chapter 3.
//! - Nielsen, H. B. (1999). "Damping Parameter in Marquardt's Method". Technical Report IMM-REP-1999-05.

use crate::error::ApexCalibResult;
use crate::linalg::{SparseCholeskySolver, SparseLinearSolver};
use crate::optimizer::{
    ConvergenceInfo, LeastSquaresProblem, OptimizationStatus, OptimizerError, SolverResult,
    check_evaluation, compute_cost,
};

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::debug;
use web_time::{Duration, Instant};

/// End-of-solve report, logged at DEBUG level
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Steps that lowered the cost
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// λ when the solve stopped
    pub final_damping: f64,
    pub final_gradient_norm: f64,
    pub final_step_norm: f64,
    pub largest_step_norm: f64,
    pub total_time: Duration,
    pub status: OptimizationStatus,
}

impl Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let verdict = if self.status.is_converged() {
            "converged"
        } else {
            "stopped"
        };
        writeln!(f, "LM {verdict}: {}", self.status)?;
        writeln!(
            f,
            "  cost        {:.6e} -> {:.6e} (rms residual {:.3e} -> {:.3e})",
            self.initial_cost,
            self.final_cost,
            self.initial_cost.max(0.0).sqrt(),
            self.final_cost.max(0.0).sqrt()
        )?;
        writeln!(
            f,
            "  iterations  {} ({} accepted, {} rejected), λ = {:.2e}",
            self.iterations, self.accepted_steps, self.rejected_steps, self.final_damping
        )?;
        writeln!(
            f,
            "  last step   |g| = {:.2e}, |h| = {:.2e}, largest |h| = {:.2e}",
            self.final_gradient_norm, self.final_step_norm, self.largest_step_norm
        )?;
        write!(f, "  time        {:.1} ms", self.total_time.as_secs_f64() * 1e3)
    }
}

/// One row of the DEBUG iteration table
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    /// Cost after the step, or the unchanged cost if it was rejected
    pub cost: f64,
    pub cost_change: f64,
    /// `‖Jᵀx‖` at the linearization point
    pub gradient_norm: f64,
    pub step_norm: f64,
    /// Gain ratio ρ
    pub rho: f64,
    /// λ after the damping update
    pub damping: f64,
    pub elapsed_ms: f64,
    pub accepted: bool,
}

impl IterationStats {
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>11}  {:>10}  {:>10}  {:>9}  {:>9}  {:>10}  {:>3}",
            "iter", "cost", "Δcost", "|g|", "|h|", "ρ", "λ", "elapsed", "ok"
        );
    }

    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>13.6e}  {:>11.3e}  {:>10.3e}  {:>10.3e}  {:>9.2e}  {:>9.2e}  {:>8.1}ms  {:>3}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.rho,
            self.damping,
            self.elapsed_ms,
            if self.accepted { "y" } else { "n" }
        );
    }
}

/// Solver settings.
///
/// A solve stops at the first of:
///
/// - a non-finite cost, gradient or step
/// - `timeout` or `max_iterations`
/// - `‖Jᵀx‖ < gradient_tolerance`
/// - an accepted step with `‖h‖ ≤ parameter_tolerance · (‖p‖ + parameter_tolerance)`
/// - an accepted step changing the cost by less than `cost_tolerance · cost`
/// - a cost below `min_cost_threshold`
/// - a rejected step with λ already at `damping_max`
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    pub max_iterations: usize,
    /// Relative
    pub cost_tolerance: f64,
    /// Relative to the norm of the packed state
    pub parameter_tolerance: f64,
    /// Absolute
    pub gradient_tolerance: f64,
    pub timeout: Option<Duration>,
    /// Initial λ
    pub damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    pub min_cost_threshold: Option<f64>,
    /// Rescale Jacobian columns to unit norm before each solve. The schema
    /// already unit-scales calibration states, so this is off by default.
    pub use_jacobi_scaling: bool,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-10,
            parameter_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            timeout: None,
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            min_cost_threshold: None,
            use_jacobi_scaling: false,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Clamp λ to `[min, max]`
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Stop as soon as the cost drops below `min_cost`
    pub fn with_min_cost_threshold(mut self, min_cost: f64) -> Self {
        self.min_cost_threshold = Some(min_cost);
        self
    }

    pub fn with_jacobi_scaling(mut self, use_jacobi_scaling: bool) -> Self {
        self.use_jacobi_scaling = use_jacobi_scaling;
        self
    }

    /// Log the settings at DEBUG level
    pub fn print_configuration(&self) {
        debug!(
            "LM settings: max {} iterations, tolerances cost {:.1e} / step {:.1e} / gradient {:.1e}, timeout {:?}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
        );
        debug!(
            "LM damping: λ₀ = {:.1e} in [{:.1e}, {:.1e}], Jacobi scaling {}",
            self.damping,
            self.damping_min,
            self.damping_max,
            if self.use_jacobi_scaling { "on" } else { "off" },
        );
    }
}

/// Result from step computation
struct StepResult {
    /// Step in the problem's own parameters
    step: Mat<f64>,
    gradient_norm: f64,
    predicted_reduction: f64,
}

/// Result from step evaluation
struct StepEvaluation {
    accepted: bool,
    cost_before: f64,
    rho: f64,
}

/// Levenberg-Marquardt solver driving a [`LeastSquaresProblem`] callback.
///
/// The damping state lives in the solver and carries over between calls to
/// [`optimize`](Self::optimize); create a fresh solver per independent solve.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    damping: f64,
    damping_nu: f64,
    /// Diagonal of the Jacobi scaling, `1 / (1 + ‖J_col‖)`
    jacobi_scaling: Option<(SparseColMat<usize, f64>, Vec<f64>)>,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        Self {
            damping: config.damping,
            damping_nu: 2.0,
            config,
            jacobi_scaling: None,
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Update damping parameter based on step quality.
    /// Reference: Introduction to Optimization and Data Fitting, Algorithm 6.18
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > 0.0 {
            let coff = 2.0 * rho - 1.0;
            self.damping *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            self.damping = self.damping.max(self.config.damping_min);
            self.damping_nu = 2.0;
            true
        } else {
            self.damping *= self.damping_nu;
            self.damping_nu *= 2.0;
            self.damping = self.damping.min(self.config.damping_max);
            false
        }
    }

    /// Compute step quality ratio (actual vs predicted reduction)
    fn compute_step_quality(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    /// Predicted cost reduction of the linear model: `½hᵀ(λh − g)`
    fn compute_predicted_reduction(&self, step: &Mat<f64>, gradient: &Mat<f64>) -> f64 {
        let diff = self.damping * step - gradient;
        (0.5 * step.transpose() * &diff)[(0, 0)]
    }

    /// Check convergence after one iteration.
    ///
    /// Numerical breakdowns, timeout, iteration count and the gradient are
    /// checked on every iteration; the step and cost criteria only after
    /// accepted steps.
    #[allow(clippy::too_many_arguments)]
    fn check_convergence(
        &self,
        iteration: usize,
        cost_before: f64,
        new_cost: f64,
        parameter_norm: f64,
        parameter_update_norm: f64,
        gradient_norm: f64,
        elapsed: Duration,
        step_accepted: bool,
    ) -> Option<OptimizationStatus> {
        if !new_cost.is_finite() || !parameter_update_norm.is_finite() || !gradient_norm.is_finite()
        {
            return Some(OptimizationStatus::InvalidNumericalValues);
        }

        if let Some(timeout) = self.config.timeout
            && elapsed >= timeout
        {
            return Some(OptimizationStatus::Timeout);
        }

        if iteration + 1 >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }

        // Already stationary where the step was computed
        if gradient_norm < self.config.gradient_tolerance {
            return Some(OptimizationStatus::GradientToleranceReached);
        }

        if !step_accepted {
            if self.damping >= self.config.damping_max {
                return Some(OptimizationStatus::DampingTooLarge);
            }
            return None;
        }

        let relative_step_tolerance =
            self.config.parameter_tolerance * (parameter_norm + self.config.parameter_tolerance);
        if parameter_update_norm <= relative_step_tolerance {
            return Some(OptimizationStatus::ParameterToleranceReached);
        }

        let cost_change = (cost_before - new_cost).abs();
        if cost_change < self.config.cost_tolerance * cost_before.max(1e-300) {
            return Some(OptimizationStatus::CostToleranceReached);
        }

        if let Some(min_cost) = self.config.min_cost_threshold
            && new_cost < min_cost
        {
            return Some(OptimizationStatus::MinCostThresholdReached);
        }

        None
    }

    /// Column scaling `1/(1 + ‖J_c‖)` from the first Jacobian of a solve.
    ///
    /// Kept fixed for the rest of the solve: the packed state is already
    /// scaled by the schema, so this only evens out what is left.
    fn create_jacobi_scaling(
        jacobian: &SparseColMat<usize, f64>,
    ) -> Result<(SparseColMat<usize, f64>, Vec<f64>), OptimizerError> {
        let cols = jacobian.ncols();
        let diagonal: Vec<f64> = (0..cols)
            .map(|c| {
                let col_norm = jacobian
                    .val_of_col(c)
                    .iter()
                    .map(|v| v * v)
                    .sum::<f64>()
                    .sqrt();
                1.0 / (1.0 + col_norm)
            })
            .collect();
        let triplets: Vec<Triplet<usize, usize, f64>> = diagonal
            .iter()
            .enumerate()
            .map(|(c, &s)| Triplet::new(c, c, s))
            .collect();

        let scaling = SparseColMat::try_new_from_triplets(cols, cols, &triplets)
            .map_err(|e| OptimizerError::JacobiScalingCreation(e.to_string()).log_with_source(e))?;
        Ok((scaling, diagonal))
    }

    /// Compute optimization step by solving the augmented system
    fn compute_levenberg_marquardt_step(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: SparseColMat<usize, f64>,
        iteration: usize,
        linear_solver: &mut SparseCholeskySolver,
    ) -> Result<StepResult, OptimizerError> {
        let scaled_jacobian = if self.config.use_jacobi_scaling {
            if iteration == 0 || self.jacobi_scaling.is_none() {
                self.jacobi_scaling = Some(Self::create_jacobi_scaling(&jacobian)?);
            }
            let (scaling, _) = self
                .jacobi_scaling
                .as_ref()
                .ok_or_else(|| OptimizerError::JacobiScalingNotInitialized.log())?;
            &jacobian * scaling
        } else {
            jacobian
        };

        let scaled_step = linear_solver
            .solve_augmented_equation(residuals, &scaled_jacobian, self.damping)
            .map_err(|e| OptimizerError::LinearSolveFailed(e.to_string()).log_with_source(e))?;
        let gradient = linear_solver.get_gradient().ok_or_else(|| {
            OptimizerError::NumericalInstability("Gradient not available".into()).log()
        })?;
        let gradient_norm = gradient.norm_l2();
        let predicted_reduction = self.compute_predicted_reduction(&scaled_step, gradient);

        let step = match (&self.jacobi_scaling, self.config.use_jacobi_scaling) {
            (Some((_, diagonal)), true) => {
                Mat::from_fn(scaled_step.nrows(), 1, |i, _| scaled_step[(i, 0)] * diagonal[i])
            }
            _ => scaled_step,
        };

        Ok(StepResult {
            step,
            gradient_norm,
            predicted_reduction,
        })
    }

    fn evaluate_cost(problem: &dyn LeastSquaresProblem, x: &DVector<f64>) -> ApexCalibResult<f64> {
        let (residuals, _) = problem.evaluate(x, false)?;
        check_evaluation(problem, &residuals, None)?;
        Ok(compute_cost(&residuals))
    }

    /// Try a step; on acceptance `x` and `current_cost` move to the new point
    fn evaluate_and_apply_step(
        &mut self,
        step_result: &StepResult,
        x: &mut DVector<f64>,
        current_cost: &mut f64,
        problem: &dyn LeastSquaresProblem,
    ) -> ApexCalibResult<StepEvaluation> {
        let step = &step_result.step;
        let candidate = DVector::from_fn(x.len(), |i, _| x[i] + step[(i, 0)]);
        let new_cost = Self::evaluate_cost(problem, &candidate)?;

        let rho = if new_cost.is_finite() {
            Self::compute_step_quality(*current_cost, new_cost, step_result.predicted_reduction)
        } else {
            -1.0
        };
        let accepted = self.update_damping(rho);
        let cost_before = *current_cost;
        if accepted {
            *x = candidate;
            *current_cost = new_cost;
        }
        Ok(StepEvaluation {
            accepted,
            cost_before,
            rho,
        })
    }

    /// Minimize `½‖x(p)‖²` starting from `initial`
    pub fn optimize(
        &mut self,
        problem: &dyn LeastSquaresProblem,
        initial: &DVector<f64>,
    ) -> ApexCalibResult<SolverResult<DVector<f64>>> {
        let start_time = Instant::now();
        if initial.len() != problem.num_states() {
            return Err(OptimizerError::DimensionMismatch(format!(
                "initial state has {} entries, problem has {} states",
                initial.len(),
                problem.num_states()
            ))
            .log()
            .into());
        }

        let mut x = initial.clone();
        let mut current_cost = Self::evaluate_cost(problem, &x)?;
        let initial_cost = current_cost;
        let mut cost_evaluations = 1;

        if problem.num_states() == 0 {
            debug!("Nothing to optimize");
            return Ok(SolverResult {
                parameters: x,
                status: OptimizationStatus::Converged,
                initial_cost,
                final_cost: current_cost,
                iterations: 0,
                elapsed_time: start_time.elapsed(),
                convergence_info: None,
            });
        }

        let mut linear_solver = SparseCholeskySolver::new();
        let mut iteration = 0;
        let mut jacobian_evaluations = 0;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;
        let mut largest_step_norm: f64 = 0.0;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        // The Jacobian is only recomputed after an accepted step
        let mut linearization: Option<(Mat<f64>, SparseColMat<usize, f64>)> = None;

        loop {
            let (residuals, jacobian) = match linearization.take() {
                Some(cached) => cached,
                None => {
                    let (residuals, jacobian) = problem.evaluate(&x, true)?;
                    jacobian_evaluations += 1;
                    let jacobian = jacobian.ok_or_else(|| {
                        OptimizerError::NumericalInstability(
                            "callback returned no Jacobian".to_string(),
                        )
                        .log()
                    })?;
                    check_evaluation(problem, &residuals, Some(&jacobian))?;
                    (residuals, jacobian)
                }
            };

            let step_result = self.compute_levenberg_marquardt_step(
                &residuals,
                jacobian.clone(),
                iteration,
                &mut linear_solver,
            )?;
            let step_norm = step_result.step.norm_l2();
            largest_step_norm = largest_step_norm.max(step_norm);

            let step_eval =
                self.evaluate_and_apply_step(&step_result, &mut x, &mut current_cost, problem)?;
            cost_evaluations += 1;
            if step_eval.accepted {
                accepted_steps += 1;
            } else {
                rejected_steps += 1;
                linearization = Some((residuals, jacobian));
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                IterationStats {
                    iteration,
                    cost: current_cost,
                    cost_change: step_eval.cost_before - current_cost,
                    gradient_norm: step_result.gradient_norm,
                    step_norm,
                    rho: step_eval.rho,
                    damping: self.damping,
                    elapsed_ms: start_time.elapsed().as_secs_f64() * 1e3,
                    accepted: step_eval.accepted,
                }
                .print_line();
            }

            let elapsed = start_time.elapsed();
            if let Some(status) = self.check_convergence(
                iteration,
                step_eval.cost_before,
                current_cost,
                x.norm(),
                step_norm,
                step_result.gradient_norm,
                elapsed,
                step_eval.accepted,
            ) {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let summary = LevenbergMarquardtSummary {
                        initial_cost,
                        final_cost: current_cost,
                        iterations: iteration + 1,
                        accepted_steps,
                        rejected_steps,
                        final_damping: self.damping,
                        final_gradient_norm: step_result.gradient_norm,
                        final_step_norm: step_norm,
                        largest_step_norm,
                        total_time: elapsed,
                        status: status.clone(),
                    };
                    debug!("{}", summary);
                }

                return Ok(SolverResult {
                    parameters: x,
                    status,
                    initial_cost,
                    final_cost: current_cost,
                    iterations: iteration + 1,
                    elapsed_time: elapsed,
                    convergence_info: Some(ConvergenceInfo {
                        final_gradient_norm: step_result.gradient_norm,
                        final_parameter_update_norm: step_norm,
                        cost_evaluations,
                        jacobian_evaluations,
                    }),
                });
            }

            iteration += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    /// Rosenbrock as least squares: x₀ = 10(p₁ − p₀²), x₁ = 1 − p₀
    struct Rosenbrock;

    impl LeastSquaresProblem for Rosenbrock {
        fn num_states(&self) -> usize {
            2
        }

        fn num_measurements(&self) -> usize {
            2
        }

        fn num_jacobian_nonzeros(&self) -> usize {
            3
        }

        fn evaluate(
            &self,
            p: &DVector<f64>,
            want_jacobian: bool,
        ) -> ApexCalibResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
            let residuals = Mat::from_fn(2, 1, |i, _| match i {
                0 => 10.0 * (p[1] - p[0] * p[0]),
                _ => 1.0 - p[0],
            });
            let jacobian = if want_jacobian {
                let triplets = [
                    Triplet::new(0, 0, -20.0 * p[0]),
                    Triplet::new(0, 1, 10.0),
                    Triplet::new(1, 0, -1.0),
                ];
                Some(
                    SparseColMat::try_new_from_triplets(2, 2, &triplets)
                        .map_err(|e| OptimizerError::InvalidParameters(e.to_string()))?,
                )
            } else {
                None
            };
            Ok((residuals, jacobian))
        }
    }

    /// Announces three residuals but returns two
    struct Misreported;

    impl LeastSquaresProblem for Misreported {
        fn num_states(&self) -> usize {
            2
        }

        fn num_measurements(&self) -> usize {
            3
        }

        fn num_jacobian_nonzeros(&self) -> usize {
            0
        }

        fn evaluate(
            &self,
            p: &DVector<f64>,
            want_jacobian: bool,
        ) -> ApexCalibResult<(Mat<f64>, Option<SparseColMat<usize, f64>>)> {
            Rosenbrock.evaluate(p, want_jacobian)
        }
    }

    #[test]
    fn test_rosenbrock_optimization() -> Result<(), Box<dyn std::error::Error>> {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(200)
            .with_cost_tolerance(1e-14)
            .with_parameter_tolerance(1e-12)
            .with_gradient_tolerance(1e-12);

        let mut solver = LevenbergMarquardt::with_config(config);
        let result = solver.optimize(&Rosenbrock, &dvector![-1.2, 1.0])?;

        assert!(result.status.is_converged(), "status: {}", result.status);
        assert!((result.parameters[0] - 1.0).abs() < 1e-4);
        assert!((result.parameters[1] - 1.0).abs() < 1e-4);
        assert!(result.final_cost < 1e-8, "final cost {}", result.final_cost);
        assert!(result.final_cost < result.initial_cost);
        Ok(())
    }

    #[test]
    fn test_jacobi_scaling_converges() -> Result<(), Box<dyn std::error::Error>> {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(200)
            .with_jacobi_scaling(true);
        let mut solver = LevenbergMarquardt::with_config(config);
        let result = solver.optimize(&Rosenbrock, &dvector![-1.2, 1.0])?;
        assert!((result.parameters[0] - 1.0).abs() < 1e-4);
        assert!((result.parameters[1] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_jacobi_scaling_comes_from_the_first_jacobian() -> Result<(), Box<dyn std::error::Error>> {
        let initial = dvector![-1.2, 1.0];
        let (_, jacobian) = Rosenbrock.evaluate(&initial, true)?;
        let (_, expected) = LevenbergMarquardt::create_jacobi_scaling(&jacobian.ok_or("no jacobian")?)?;

        let config = LevenbergMarquardtConfig::new().with_jacobi_scaling(true);
        let mut solver = LevenbergMarquardt::with_config(config);
        let result = solver.optimize(&Rosenbrock, &initial)?;
        assert!(result.iterations > 1);
        let (_, used) = solver.jacobi_scaling.as_ref().ok_or("scaling not built")?;
        assert_eq!(used, &expected);
        Ok(())
    }

    #[test]
    fn test_wrong_residual_size_is_an_error() {
        let mut solver = LevenbergMarquardt::new();
        let result = solver.optimize(&Misreported, &dvector![0.0, 0.0]);
        assert!(result.is_err());
        let result = solver.optimize(&Rosenbrock, &dvector![0.0, 0.0, 0.0]);
        assert!(result.is_err());
    }
}
