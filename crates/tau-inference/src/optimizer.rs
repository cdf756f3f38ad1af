//! Minimization of a [`LikelihoodModel`] with argmin's L-BFGS.
//!
//! Frozen parameters are removed from the problem: the solver only sees the
//! free subspace and every evaluation is expanded back to the full vector.
//! Box constraints are applied by clamping and by projecting the gradient.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tau_core::{Error, LikelihoodModel, Result};

/// Configuration for the L-BFGS minimizer
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance for gradient norm
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

/// Result of a minimization, parameters in full model order
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Parameters at the minimum (frozen ones at their fixed values)
    pub parameters: Vec<f64>,
    /// NLL at the minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective evaluations
    pub n_fev: usize,
    /// Number of gradient evaluations
    pub n_gev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Seam to the minimizer used by the fit driver.
pub trait Minimizer: Send + Sync {
    /// Minimize `model` from `init` within `bounds`, keeping parameters with
    /// `fixed[i] == true` at `init[i]`.
    fn minimize(
        &self,
        model: &dyn LikelihoodModel,
        init: &[f64],
        bounds: &[(f64, f64)],
        fixed: &[bool],
    ) -> Result<OptimizationResult>;
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

/// The model restricted to its free parameters.
struct FreeSubspace<'a> {
    model: &'a dyn LikelihoodModel,
    full: Vec<f64>,
    free: Vec<usize>,
    bounds: Vec<(f64, f64)>,
    counts: Arc<FuncCounts>,
}

impl FreeSubspace<'_> {
    fn expand(&self, x: &[f64]) -> Vec<f64> {
        let mut full = self.full.clone();
        for (k, &i) in self.free.iter().enumerate() {
            let (lo, hi) = self.bounds[k];
            full[i] = x[k].clamp(lo, hi);
        }
        full
    }
}

impl CostFunction for FreeSubspace<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        self.model.nll(&self.expand(params)).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for FreeSubspace<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let full = self.expand(params);
        let g_full = self.model.gradient(&full).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        let mut g: Vec<f64> = self.free.iter().map(|&i| g_full[i]).collect();

        // At a bound, a gradient pointing outward is zeroed.
        const EPS: f64 = 1e-12;
        for (k, &i) in self.free.iter().enumerate() {
            let (lo, hi) = self.bounds[k];
            let x = full[i];
            if (x <= lo + EPS && g[k] > 0.0) || (x >= hi - EPS && g[k] < 0.0) {
                g[k] = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS minimizer with box constraints
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Create a minimizer with the given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl Default for LbfgsbOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl Minimizer for LbfgsbOptimizer {
    fn minimize(
        &self,
        model: &dyn LikelihoodModel,
        init: &[f64],
        bounds: &[(f64, f64)],
        fixed: &[bool],
    ) -> Result<OptimizationResult> {
        if init.len() != bounds.len() || init.len() != fixed.len() {
            return Err(Error::Validation(format!(
                "parameter, bounds and fixed-mask lengths differ: {} / {} / {}",
                init.len(),
                bounds.len(),
                fixed.len()
            )));
        }
        let full = clamp_params(init, bounds);
        let free: Vec<usize> = (0..full.len()).filter(|&i| !fixed[i]).collect();

        if free.is_empty() {
            let fval = model.nll(&full)?;
            return Ok(OptimizationResult {
                parameters: full,
                fval,
                n_iter: 0,
                n_fev: 1,
                n_gev: 0,
                converged: true,
                message: "no free parameters".into(),
            });
        }

        let counts = Arc::new(FuncCounts::default());
        let start: Vec<f64> = free.iter().map(|&i| full[i]).collect();
        let problem = FreeSubspace {
            model,
            bounds: free.iter().map(|&i| bounds[i]).collect(),
            full,
            free,
            counts: counts.clone(),
        };
        let free_idx = problem.free.clone();
        let mut best_full = problem.full.clone();

        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Validation(format!("invalid optimizer configuration (tol): {e}")))?
            .with_tolerance_cost(tol_cost)
            .map_err(|e| Error::Validation(format!("invalid optimizer configuration (tol_cost): {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Fit(format!("minimization failed: {e}")))?;

        let state = res.state();
        let best = state.get_best_param().ok_or_else(|| Error::Fit("no best parameters found".into()))?;
        for (k, &i) in free_idx.iter().enumerate() {
            let (lo, hi) = bounds[i];
            best_full[i] = best[k].clamp(lo, hi);
        }
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(OptimizationResult {
            parameters: best_full,
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.grad.load(Ordering::Relaxed),
            converged,
            message: termination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)^2 + (y - 3)^2
    struct Quadratic;

    impl LikelihoodModel for Quadratic {
        fn n_parameters(&self) -> usize {
            2
        }
        fn parameter_names(&self) -> Vec<String> {
            vec!["x".into(), "y".into()]
        }
        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(-10.0, 10.0); 2]
        }
        fn parameter_init(&self) -> Vec<f64> {
            vec![0.0; 2]
        }
        fn nll(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] - 2.0).powi(2) + (p[1] - 3.0).powi(2))
        }
        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (p[0] - 2.0), 2.0 * (p[1] - 3.0)])
        }
    }

    fn minimize(init: &[f64], bounds: &[(f64, f64)], fixed: &[bool]) -> OptimizationResult {
        LbfgsbOptimizer::new(OptimizerConfig { max_iter: 100, tol: 1e-6, m: 10 })
            .minimize(&Quadratic, init, bounds, fixed)
            .unwrap()
    }

    #[test]
    fn test_optimizer_quadratic() {
        let result = minimize(&[0.0, 0.0], &[(-10.0, 10.0); 2], &[false, false]);
        assert!(result.converged, "{result}");
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_optimizer_with_bounds() {
        let result = minimize(&[0.0, 0.0], &[(-10.0, 1.0), (-10.0, 10.0)], &[false, false]);
        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn test_fixed_parameter_stays() {
        let result = minimize(&[0.5, 0.0], &[(-10.0, 10.0); 2], &[true, false]);
        assert_eq!(result.parameters[0], 0.5);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 2.25, epsilon = 1e-6);
    }

    #[test]
    fn test_all_fixed_evaluates_once() {
        let result = minimize(&[2.0, 3.0], &[(-10.0, 10.0); 2], &[true, true]);
        assert!(result.converged);
        assert_eq!(result.n_fev, 1);
        assert_eq!(result.fval, 0.0);
    }

    #[test]
    fn test_length_mismatch() {
        let err = LbfgsbOptimizer::default().minimize(&Quadratic, &[0.0], &[(-1.0, 1.0); 2], &[false; 2]);
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
