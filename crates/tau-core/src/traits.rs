//! Core traits for taufit
//!
//! Inference code depends only on these traits, not on the concrete
//! datacard-backed model.

use crate::Result;

/// Binned likelihood model seen by the minimizer.
pub trait LikelihoodModel: Send + Sync {
    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Parameter names
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max)
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Initial parameter values
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-likelihood at `params`
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of the NLL (central finite differences by default)
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut p = params.to_vec();
        for i in 0..params.len() {
            let h = 1e-6 * params[i].abs().max(1.0);
            p[i] = params[i] + h;
            let up = self.nll(&p)?;
            p[i] = params[i] - h;
            let down = self.nll(&p)?;
            p[i] = params[i];
            grad[i] = (up - down) / (2.0 * h);
        }
        Ok(grad)
    }

    /// Index of the parameter named `name`
    fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_names().iter().position(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Parabola;

    impl LikelihoodModel for Parabola {
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
            Ok((p[0] - 1.0).powi(2) + 3.0 * p[1].powi(2))
        }
    }

    #[test]
    fn test_default_gradient() {
        let g = Parabola.gradient(&[0.0, 1.0]).unwrap();
        assert_relative_eq!(g[0], -2.0, epsilon = 1e-5);
        assert_relative_eq!(g[1], 6.0, epsilon = 1e-5);
        assert_eq!(Parabola.parameter_index("y"), Some(1));
    }
}
