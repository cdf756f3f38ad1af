//! Fit driver: POI scan, best fit with covariance, post-fit shapes and toys.
//!
//! Every mode starts from an unconditional minimization of the model. Scan
//! points are independent conditional fits seeded from the best fit; a
//! failed point is recorded and skipped, the scan aborts only when failures
//! exceed [`FitOptions::max_failed_fraction`].

use std::path::Path;

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use tau_core::{CancelToken, Error, FitResult, LikelihoodModel, Measurement, Result};
use tau_hist::{DATA_OBS, Hist1D, RegionShapes, ShapeFile, ShapeMeta};

use crate::model::BinnedModel;
use crate::optimizer::{LbfgsbOptimizer, Minimizer, OptimizationResult};
use crate::tree::{BEST_FIT_QUANTILE, SCAN_QUANTILE, ScanTree};

/// Options shared by every fit mode.
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Parameters kept constant, at the given value or their initial one.
    pub frozen: Vec<(String, Option<f64>)>,
    /// Parameter ranges overriding the card's.
    pub ranges: Vec<(String, f64, f64)>,
    /// Fit the expectation at the initial parameters instead of the data.
    pub asimov: bool,
    /// Largest tolerated fraction of failed scan points.
    pub max_failed_fraction: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self { frozen: Vec::new(), ranges: Vec::new(), asimov: false, max_failed_fraction: 0.2 }
    }
}

/// Best fit of a POI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestFit {
    /// POI name.
    pub poi: String,
    /// Profile-likelihood 68% interval of the POI.
    pub interval: Measurement,
    /// Full fit result.
    pub result: FitResult,
    /// Correlation of every parameter with the POI; empty when the
    /// covariance is not positive definite.
    pub correlations: Vec<(String, f64)>,
}

impl BestFit {
    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Read a best-fit file.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::input("postfit", path.display().to_string(), format!("cannot read fit result: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// POI values of Poisson toys fitted at a fixed truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToyResults {
    /// POI name.
    pub poi: String,
    /// First seed; toy `i` uses `seed + i`.
    pub seed: u64,
    /// Fitted POI per toy.
    pub values: Vec<f64>,
    /// Convergence per toy.
    pub converged: Vec<bool>,
}

impl ToyResults {
    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Sample one Poisson-fluctuated dataset from expectations.
pub fn poisson_from_expected(expected: &[Vec<f64>], seed: u64) -> Vec<Vec<f64>> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    expected
        .iter()
        .map(|bin| {
            bin.iter()
                .map(|&lam| {
                    if !lam.is_finite() || lam <= 0.0 {
                        return 0.0;
                    }
                    match Poisson::new(lam) {
                        Ok(p) => p.sample(&mut rng),
                        Err(_) => 0.0,
                    }
                })
                .collect()
        })
        .collect()
}

/// Runs the fit modes on one model.
pub struct FitDriver {
    model: BinnedModel,
    fixed: Vec<bool>,
    options: FitOptions,
    minimizer: Box<dyn Minimizer>,
    cancel: Option<CancelToken>,
}

impl FitDriver {
    /// Apply ranges, frozen values and Asimov replacement to `model`.
    pub fn new(mut model: BinnedModel, options: FitOptions) -> Result<Self> {
        for (name, lo, hi) in &options.ranges {
            model.set_range(name, *lo, *hi)?;
        }
        let mut fixed = vec![false; model.n_parameters()];
        for (name, value) in &options.frozen {
            let i = model
                .parameter_index(name)
                .ok_or_else(|| Error::Config(format!("cannot freeze unknown parameter '{name}'")))?;
            if let Some(v) = value {
                model.set_init(name, *v)?;
            }
            fixed[i] = true;
        }
        if options.asimov {
            tracing::info!("fitting Asimov pseudo-data");
            model = model.asimov(&model.parameter_init())?;
        }
        Ok(Self { model, fixed, options, minimizer: Box::new(LbfgsbOptimizer::default()), cancel: None })
    }

    /// Use another minimizer.
    pub fn with_minimizer(mut self, minimizer: Box<dyn Minimizer>) -> Self {
        self.minimizer = minimizer;
        self
    }

    /// Poll `token` between scan points and toys.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The model being fitted.
    pub fn model(&self) -> &BinnedModel {
        &self.model
    }

    fn poi_index(&self, poi: &str) -> Result<usize> {
        self.model.parameter_index(poi).ok_or_else(|| {
            Error::Config(format!("POI '{poi}' is not a parameter of the model ({:?})", self.model.parameter_names()))
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn minimize(&self, model: &BinnedModel, init: &[f64], fixed: &[bool]) -> Result<OptimizationResult> {
        self.minimizer.minimize(model, init, &model.parameter_bounds(), fixed)
    }

    fn unconditional(&self) -> Result<OptimizationResult> {
        let res = self.minimize(&self.model, &self.model.parameter_init(), &self.fixed)?;
        if !res.converged {
            tracing::warn!(message = %res.message, "best fit did not converge");
        }
        Ok(res)
    }

    fn conditional(&self, model: &BinnedModel, start: &[f64], poi: usize, value: f64) -> Result<OptimizationResult> {
        let mut init = start.to_vec();
        init[poi] = value;
        let mut fixed = self.fixed.clone();
        fixed[poi] = true;
        self.minimize(model, &init, &fixed)
    }

    /// Scan `poi` over `points` values spanning `range` (its bounds by default).
    pub fn scan(&self, poi: &str, points: usize, range: Option<(f64, f64)>) -> Result<ScanTree> {
        let ip = self.poi_index(poi)?;
        if points == 0 {
            return Err(Error::Config("a scan needs at least one point".into()));
        }
        let (lo, hi) = range.unwrap_or(self.model.parameter_bounds()[ip]);
        let grid: Vec<f64> = if points == 1 {
            vec![0.5 * (lo + hi)]
        } else {
            (0..points).map(|k| lo + (hi - lo) * k as f64 / (points - 1) as f64).collect()
        };
        let span = tracing::info_span!("scan", poi);
        let _guard = span.enter();

        let names = self.model.parameter_names();
        let tracked_idx: Vec<usize> = (0..names.len()).filter(|&i| i != ip).collect();
        let mut tree = ScanTree::new(poi, tracked_idx.iter().map(|&i| names[i].clone()).collect());
        let tracked = |p: &[f64]| -> Vec<f64> { tracked_idx.iter().map(|&i| p[i]).collect() };

        let best = self.unconditional()?;
        tree.push_row(best.parameters[ip], 0.0, BEST_FIT_QUANTILE, &tracked(&best.parameters))?;

        let mut attempted = 0usize;
        for &x in &grid {
            if self.cancelled() {
                tracing::warn!(done = attempted, total = grid.len(), "scan cancelled, tree marked incomplete");
                tree.complete = false;
                break;
            }
            attempted += 1;
            match self.conditional(&self.model, &best.parameters, ip, x) {
                Ok(res) if res.converged => {
                    tree.push_row(x, res.fval - best.fval, SCAN_QUANTILE, &tracked(&res.parameters))?;
                }
                Ok(res) => {
                    tracing::warn!(poi = x, message = %res.message, "scan point did not converge");
                    tree.invalid_points.push(x);
                }
                Err(e) => {
                    tracing::warn!(poi = x, error = %e, "scan point failed");
                    tree.invalid_points.push(x);
                }
            }
        }

        let failed = tree.invalid_points.len();
        if attempted > 0 && failed as f64 > self.options.max_failed_fraction * attempted as f64 {
            return Err(Error::Fit(format!(
                "{failed} of {attempted} scan points of '{poi}' failed (tolerated fraction {})",
                self.options.max_failed_fraction
            )));
        }
        tracing::info!(rows = tree.n_rows(), failed, "scan finished");
        Ok(tree)
    }

    /// Unconditional fit with covariance and the profile interval of `poi`.
    pub fn best_fit(&self, poi: &str) -> Result<BestFit> {
        let ip = self.poi_index(poi)?;
        let best = self.unconditional()?;
        let names = self.model.parameter_names();
        let n = names.len();
        let free: Vec<usize> = (0..n).filter(|&i| !self.fixed[i]).collect();

        let hessian = compute_hessian(&self.model, &best.parameters, &free)?;
        let (cov_free, valid) = match invert_hessian(&hessian) {
            Some((c, valid)) => (Some(c), valid),
            None => (None, false),
        };
        if !valid {
            tracing::warn!(poi, "covariance is not positive definite, correlations suppressed");
        }
        let mut uncertainties = vec![0.0; n];
        let mut covariance = vec![0.0; n * n];
        match &cov_free {
            Some(c) => {
                for (a, &i) in free.iter().enumerate() {
                    uncertainties[i] = c[(a, a)].abs().sqrt();
                    for (b, &j) in free.iter().enumerate() {
                        covariance[i * n + j] = c[(a, b)];
                    }
                }
            }
            None => {
                for (a, &i) in free.iter().enumerate() {
                    uncertainties[i] = 1.0 / hessian[(a, a)].abs().max(1e-12).sqrt();
                }
            }
        }

        let result = FitResult::new(
            names.clone(),
            best.parameters.clone(),
            uncertainties.clone(),
            best.fval,
            best.converged,
            best.n_fev,
        )
        .with_covariance(covariance, valid);
        let correlations = match result.correlations_with(ip) {
            Some(c) => names.iter().cloned().zip(c).collect(),
            None => Vec::new(),
        };
        let interval = if self.fixed[ip] {
            Measurement::new(best.parameters[ip], 0.0, 0.0)
        } else {
            self.profile_interval(ip, &best, uncertainties[ip])?
        };
        tracing::info!(
            poi,
            value = interval.value,
            err_down = interval.err_down,
            err_up = interval.err_up,
            "best fit"
        );
        Ok(BestFit { poi: poi.to_string(), interval, result, correlations })
    }

    /// Points where `2*(nll_profile - nll_min) = 1`, by stepping out from the
    /// minimum and bisecting. A side that reaches its bound reports the
    /// distance to the bound.
    fn profile_interval(&self, ip: usize, best: &OptimizationResult, sigma: f64) -> Result<Measurement> {
        let theta = best.parameters[ip];
        let (lo, hi) = self.model.parameter_bounds()[ip];
        let step = if sigma.is_finite() && sigma > 0.0 { sigma } else { 1e-2 * (hi - lo) };
        let q = |x: f64| -> Result<f64> {
            let res = self.conditional(&self.model, &best.parameters, ip, x)?;
            Ok(2.0 * (res.fval - best.fval))
        };

        let mut errors = [0.0; 2];
        for (side, dir) in [(0usize, -1.0f64), (1, 1.0)] {
            let bound = if dir < 0.0 { lo } else { hi };
            let mut inside = theta;
            let mut outside = None;
            for k in 1..=10 {
                let x = (theta + dir * step * k as f64).clamp(lo, hi);
                if q(x)? >= 1.0 {
                    outside = Some(x);
                    break;
                }
                inside = x;
                if x == bound {
                    break;
                }
            }
            errors[side] = match outside {
                None => {
                    tracing::warn!(side = if dir < 0.0 { "down" } else { "up" }, "no 68% crossing before the bound");
                    (bound - theta).abs()
                }
                Some(mut out) => {
                    for _ in 0..30 {
                        let mid = 0.5 * (inside + out);
                        if q(mid)? >= 1.0 {
                            out = mid;
                        } else {
                            inside = mid;
                        }
                    }
                    (0.5 * (inside + out) - theta).abs()
                }
            };
        }
        Ok(Measurement::new(theta, errors[0], errors[1]))
    }

    /// Pre-fit (`<bin>_prefit`) and post-fit (`<bin>_postfit`) yields per
    /// process, with `TotalSig`, `TotalBkg`, `TotalProcs` and `data_obs`.
    /// `sumw2` carries the propagated variance.
    pub fn postfit_shapes(&self, fit: &FitResult) -> Result<ShapeFile> {
        let n = self.model.n_parameters();
        let free: Vec<usize> = (0..n).filter(|&i| !self.fixed[i]).collect();

        let prefit = self.model.parameter_init();
        let prior_cov: Vec<f64> = (0..n * n)
            .map(|k| {
                let (i, j) = (k / n, k % n);
                if i != j || self.fixed[i] {
                    return 0.0;
                }
                match self.model.parameters()[i].kind {
                    crate::model::ParameterKind::Gaussian { sigma, .. } => sigma * sigma,
                    crate::model::ParameterKind::PoissonStat { tau } => 1.0 / tau,
                    crate::model::ParameterKind::Free => 0.0,
                }
            })
            .collect();
        let post_cov: Vec<f64> = match (&fit.covariance, fit.covariance_valid) {
            (Some(c), true) => c.clone(),
            _ => (0..n * n).map(|k| if k / n == k % n { fit.uncertainties[k / n].powi(2) } else { 0.0 }).collect(),
        };

        let mut file = ShapeFile::new(ShapeMeta { analysis: "postfit".into(), ..ShapeMeta::default() });
        for (suffix, params, cov) in [("prefit", &prefit, &prior_cov), ("postfit", &fit.parameters, &post_cov)] {
            for region in self.yield_regions(suffix, params, cov, &free)? {
                file.put_region(region);
            }
        }
        Ok(file)
    }

    fn yield_regions(&self, suffix: &str, params: &[f64], cov: &[f64], free: &[usize]) -> Result<Vec<RegionShapes>> {
        let n = params.len();
        let central = summarize(&self.model, &self.model.expected_by_process(params)?);
        let mut derivatives = Vec::with_capacity(free.len());
        for &j in free {
            let (lo, hi) = self.model.parameter_bounds()[j];
            let eps = 1e-4 * params[j].abs().max(1.0);
            let mut p = params.to_vec();
            let h = if params[j] + eps <= hi { eps } else { -eps.min(params[j] - lo) };
            if h == 0.0 {
                derivatives.push(None);
                continue;
            }
            p[j] += h;
            let shifted = summarize(&self.model, &self.model.expected_by_process(&p)?);
            derivatives.push(Some(diff(&shifted, &central, h)));
        }

        let mut regions = Vec::new();
        for (b, (names, values)) in central.iter().enumerate() {
            let edges = self.model.bin_edges(b).to_vec();
            let mut region = RegionShapes::new(format!("{}_{suffix}", self.model.bin_names()[b]));
            region.put(Hist1D::from_content(DATA_OBS, edges.clone(), self.model.observed(b).to_vec(), None)?);
            for (q, (name, content)) in names.iter().zip(values).enumerate() {
                let mut var = vec![0.0; content.len()];
                for (a, &i) in free.iter().enumerate() {
                    let Some(di) = &derivatives[a] else { continue };
                    for (c, &j) in free.iter().enumerate() {
                        let Some(dj) = &derivatives[c] else { continue };
                        let cij = cov[i * n + j];
                        if cij == 0.0 {
                            continue;
                        }
                        for (k, v) in var.iter_mut().enumerate() {
                            *v += di[b][q][k] * dj[b][q][k] * cij;
                        }
                    }
                }
                region.put(Hist1D::from_content(name.clone(), edges.clone(), content.clone(), Some(var))?);
            }
            regions.push(region);
        }
        Ok(regions)
    }

    /// Fit `n_toys` Poisson toys generated at `params`.
    pub fn toys(&self, poi: &str, params: &[f64], n_toys: usize, seed: u64) -> Result<ToyResults> {
        let ip = self.poi_index(poi)?;
        let expected = self.model.expected(params)?;
        let mut out = ToyResults { poi: poi.to_string(), seed, values: Vec::new(), converged: Vec::new() };
        for t in 0..n_toys {
            if self.cancelled() {
                tracing::warn!(done = t, "toys cancelled");
                break;
            }
            let toy = self.model.with_observed(poisson_from_expected(&expected, seed.wrapping_add(t as u64)))?;
            match self.minimize(&toy, params, &self.fixed) {
                Ok(res) => {
                    out.values.push(res.parameters[ip]);
                    out.converged.push(res.converged);
                }
                Err(e) => tracing::warn!(toy = t, error = %e, "toy fit failed"),
            }
        }
        Ok(out)
    }
}

type Summary = Vec<(Vec<String>, Vec<Vec<f64>>)>;

/// Per card bin: process yields followed by `TotalSig`, `TotalBkg`, `TotalProcs`.
fn summarize(model: &BinnedModel, per_process: &[Vec<Vec<f64>>]) -> Summary {
    per_process
        .iter()
        .enumerate()
        .map(|(b, yields)| {
            let procs = model.processes(b);
            let nb = model.observed(b).len();
            let mut names: Vec<String> = procs.iter().map(|(p, _)| p.to_string()).collect();
            let mut values = yields.clone();
            let mut sig = vec![0.0; nb];
            let mut bkg = vec![0.0; nb];
            for ((_, signal), y) in procs.iter().zip(yields) {
                let target = if *signal { &mut sig } else { &mut bkg };
                for (t, v) in target.iter_mut().zip(y) {
                    *t += v;
                }
            }
            let total: Vec<f64> = sig.iter().zip(&bkg).map(|(a, b)| a + b).collect();
            for (name, v) in [("TotalSig", sig), ("TotalBkg", bkg), ("TotalProcs", total)] {
                names.push(name.to_string());
                values.push(v);
            }
            (names, values)
        })
        .collect()
}

fn diff(shifted: &Summary, central: &Summary, h: f64) -> Vec<Vec<Vec<f64>>> {
    shifted
        .iter()
        .zip(central)
        .map(|((_, s), (_, c))| {
            s.iter().zip(c).map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y) / h).collect()).collect()
        })
        .collect()
}

/// Hessian over the free parameters by forward differences of the gradient.
fn compute_hessian(model: &BinnedModel, best: &[f64], free: &[usize]) -> Result<DMatrix<f64>> {
    let m = free.len();
    let bounds = model.parameter_bounds();
    let grad_center = model.gradient(best)?;
    let mut hessian = DMatrix::zeros(m, m);
    for (b, &j) in free.iter().enumerate() {
        let (lo, hi) = bounds[j];
        let eps = 1e-4 * best[j].abs().max(1.0);
        let h = if best[j] + eps <= hi { eps } else { -eps.min(best[j] - lo) };
        if h == 0.0 {
            continue;
        }
        let mut p = best.to_vec();
        p[j] += h;
        let grad = model.gradient(&p)?;
        for (a, &i) in free.iter().enumerate() {
            hessian[(a, b)] = (grad[i] - grad_center[i]) / h;
        }
    }
    let ht = hessian.transpose();
    Ok((&hessian + &ht) * 0.5)
}

/// Covariance from the Hessian, with a damped Cholesky and an LU fallback.
///
/// The flag is true only when the undamped Hessian is positive definite.
fn invert_hessian(hessian: &DMatrix<f64>) -> Option<(DMatrix<f64>, bool)> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;
    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            return Some((chol.solve(&identity), attempt == 0));
        }
        if attempt + 1 == max_attempts {
            break;
        }
        let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        for i in 0..n {
            h_damped[(i, i)] += next - damping;
        }
        damping = next;
    }

    let cov = h_damped.lu().try_inverse()?;
    if (0..n).any(|i| !(cov[(i, i)].is_finite() && cov[(i, i)] > 0.0)) {
        return None;
    }
    Some((cov, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::toy_card;
    use approx::assert_relative_eq;

    fn driver(data: &[f64], options: FitOptions) -> FitDriver {
        let (card, store) = toy_card(data);
        FitDriver::new(BinnedModel::from_card(&card, &store).unwrap(), options).unwrap()
    }

    // Expectation a quarter of the way from the 1.000 to the 1.020 template.
    fn shifted_data() -> Vec<f64> {
        vec![28.5, 59.5, 50.5, 31.5]
    }

    #[test]
    fn test_invert_hessian_diagonal() {
        let h = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 1.0]);
        let (cov, valid) = invert_hessian(&h).unwrap();
        assert!(valid);
        assert_relative_eq!(cov[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 1.0, epsilon = 1e-12);
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert!(!invert_hessian(&indefinite).is_some_and(|(_, v)| v));
    }

    #[test]
    fn test_best_fit_recovers_nominal() {
        let d = driver(&[30.0, 60.0, 50.0, 30.0], FitOptions::default());
        let fit = d.best_fit("tes_DM0").unwrap();
        assert_relative_eq!(fit.interval.value, 1.0, epsilon = 2e-3);
        assert!(fit.interval.err_down > 0.0 && fit.interval.err_up > 0.0);
        assert!(fit.result.covariance_valid);
        assert_eq!(fit.correlations.len(), 3);
        assert_relative_eq!(fit.result.value("lumi").unwrap(), 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_scan_rows_ordered_with_best_fit_first() {
        let d = driver(&shifted_data(), FitOptions::default());
        let tree = d.scan("tes_DM0", 5, None).unwrap();
        assert_eq!(tree.n_rows(), 6);
        assert_eq!(tree.best_fit_row(), Some(0));
        let poi = tree.poi_values().unwrap();
        assert!(poi[1..].windows(2).all(|w| w[1] > w[0]));
        assert_relative_eq!(poi[1], 0.98, epsilon = 1e-12);
        assert_relative_eq!(poi[5], 1.02, epsilon = 1e-12);
        let dnll = tree.delta_nll().unwrap();
        assert!(dnll[1..].iter().all(|v| *v >= -1e-6));
        assert_eq!(tree.tracked, vec!["lumi", "shape_dy"]);
        assert!(tree.complete);
    }

    #[test]
    fn test_cancelled_scan_is_incomplete() {
        let token = CancelToken::new();
        token.cancel();
        let d = driver(&shifted_data(), FitOptions::default()).cancel_token(token);
        let tree = d.scan("tes_DM0", 5, None).unwrap();
        assert!(!tree.complete);
        assert_eq!(tree.n_rows(), 1);
    }

    #[test]
    fn test_frozen_and_unknown_parameters() {
        let opts = FitOptions { frozen: vec![("lumi".into(), Some(1.0))], ..FitOptions::default() };
        let d = driver(&shifted_data(), opts);
        let fit = d.best_fit("tes_DM0").unwrap();
        assert_eq!(fit.result.value("lumi"), Some(1.0));
        assert_eq!(fit.result.error("lumi"), Some(0.0));

        let (card, store) = toy_card(&shifted_data());
        let model = BinnedModel::from_card(&card, &store).unwrap();
        let opts = FitOptions { frozen: vec![("nope".into(), None)], ..FitOptions::default() };
        assert!(matches!(FitDriver::new(model, opts), Err(Error::Config(_))));
        assert!(matches!(d.scan("nope", 3, None), Err(Error::Config(_))));
    }

    #[test]
    fn test_asimov_fit_is_exact() {
        let opts = FitOptions { asimov: true, ..FitOptions::default() };
        let d = driver(&shifted_data(), opts);
        assert_eq!(d.model().observed(0), &[30.0, 60.0, 50.0, 30.0]);
        let tree = d.scan("tes_DM0", 3, None).unwrap();
        let dnll = tree.delta_nll().unwrap();
        // the 1.000 point is the truth
        assert!(dnll[2].abs() < 1e-4);
    }

    #[test]
    fn test_postfit_shapes_totals() {
        let d = driver(&shifted_data(), FitOptions::default());
        let fit = d.best_fit("tes_DM0").unwrap();
        let shapes = d.postfit_shapes(&fit.result).unwrap();
        let post = shapes.region("DM0_postfit").unwrap();
        let pre = shapes.region("DM0_prefit").unwrap();
        let total = post.get("TotalProcs").unwrap();
        let sum = post.get("ZTT").unwrap().integral() + post.get("ZL").unwrap().integral();
        assert_relative_eq!(total.integral(), sum, epsilon = 1e-9);
        assert_relative_eq!(pre.get("TotalProcs").unwrap().integral(), 170.0, epsilon = 1e-9);
        assert!(pre.get("ZL").unwrap().sumw2.iter().all(|v| *v > 0.0));
        assert_eq!(post.get("data_obs").unwrap().content, shifted_data());
    }

    #[test]
    fn test_toys_reproducible() {
        let d = driver(&shifted_data(), FitOptions::default());
        let init = d.model().parameter_init();
        let a = d.toys("tes_DM0", &init, 3, 42).unwrap();
        let b = d.toys("tes_DM0", &init, 3, 42).unwrap();
        assert_eq!(a.values, b.values);
        assert_eq!(poisson_from_expected(&[vec![0.0, -1.0]], 1), vec![vec![0.0, 0.0]]);
    }
}
