//! # tau-inference
//!
//! Fitting and unfolding for taufit.
//!
//! This crate provides:
//! - the binned likelihood built from a datacard and its shapes
//! - the fit driver: POI scan, best fit with covariance, post-fit shapes, toys
//! - the parabola fit of a likelihood scan
//! - iterative Bayesian unfolding of the Z-pT response
//!
//! The minimizer is reached through the [`Minimizer`] trait only.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Fit driver modes and their artifacts.
pub mod fit;
/// Binned likelihood model.
pub mod model;
/// L-BFGS minimizer with frozen parameters and box constraints.
pub mod optimizer;
/// Interval from a likelihood scan.
pub mod parabola;
/// Columnar fit-result tree.
pub mod tree;
/// Response tensor and Bayesian unfolding.
pub mod unfolding;

pub use fit::{BestFit, FitDriver, FitOptions, ToyResults, poisson_from_expected};
pub use model::{BinnedModel, Parameter, ParameterKind, ShapeStore, load_shapes};
pub use optimizer::{LbfgsbOptimizer, Minimizer, OptimizationResult, OptimizerConfig};
pub use parabola::{IntervalMethod, ParabolaOptions, ParabolaResult, fit_parabola, measure_crossings, widened_range};
pub use tree::ScanTree;
pub use unfolding::{
    Prior, ResponseTensor, UnfoldMethod, Unfolder, UnfoldingConfig, UnfoldingInput, UnfoldingResult, WEIGHT_RANGE,
};
