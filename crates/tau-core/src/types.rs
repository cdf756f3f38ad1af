//! Common data types for taufit

use serde::{Deserialize, Serialize};

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Parameter names, in model order
    pub names: Vec<String>,

    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Whether the covariance came from a positive-definite Hessian.
    ///
    /// When `false` the uncertainties are diagonal estimates and correlations
    /// must not be displayed.
    pub covariance_valid: bool,

    /// Negative log-likelihood at minimum
    pub nll: f64,

    /// Convergence status
    pub converged: bool,

    /// Number of function evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Create a new fit result without covariance
    pub fn new(
        names: Vec<String>,
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        nll: f64,
        converged: bool,
        n_evaluations: usize,
    ) -> Self {
        Self {
            names,
            parameters,
            uncertainties,
            covariance: None,
            covariance_valid: false,
            nll,
            converged,
            n_evaluations,
        }
    }

    /// Attach a covariance matrix
    pub fn with_covariance(mut self, covariance: Vec<f64>, valid: bool) -> Self {
        self.covariance = Some(covariance);
        self.covariance_valid = valid;
        self
    }

    /// Index of a parameter by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Best-fit value of a parameter by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|i| self.parameters[i])
    }

    /// Uncertainty of a parameter by name
    pub fn error(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|i| self.uncertainties[i])
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable
    /// or was not obtained from a positive-definite Hessian.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        if !self.covariance_valid {
            return None;
        }
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        if i == j {
            return Some(1.0);
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }

    /// Correlation of every parameter with parameter `poi`.
    pub fn correlations_with(&self, poi: usize) -> Option<Vec<f64>> {
        (0..self.parameters.len()).map(|j| self.correlation(poi, j)).collect()
    }
}

/// Asymmetric measurement `value -err_down +err_up`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Central value
    pub value: f64,
    /// Lower error (positive number)
    pub err_down: f64,
    /// Upper error (positive number)
    pub err_up: f64,
}

impl Measurement {
    /// Create a measurement
    pub fn new(value: f64, err_down: f64, err_up: f64) -> Self {
        Self { value, err_down, err_up }
    }

    /// Symmetric error: the mean of the two sides
    pub fn symmetric_error(&self) -> f64 {
        0.5 * (self.err_down + self.err_up)
    }

    /// Lower edge of the interval
    pub fn lower(&self) -> f64 {
        self.value - self.err_down
    }

    /// Upper edge of the interval
    pub fn upper(&self) -> f64 {
        self.value + self.err_up
    }
}
