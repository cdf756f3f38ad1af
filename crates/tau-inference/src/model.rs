//! Binned likelihood built from a datacard and its shapes files.
//!
//! Expected yield of process `p` in histogram bin `i`:
//!
//! ```text
//! nu_pi = prod_r r * prod_k f_k(theta_k) * (t_pi + sum_s delta_s(theta_s))
//! ```
//!
//! where `r` are normalization rate parameters, `f_k` the lnN factors and
//! `delta_s` the shape morphs. Processes whose `shapes` line carries `$MASS`
//! interpolate linearly between neighbouring grid templates in the grid
//! parameter. Bin-by-bin statistical parameters then act on the summed
//! yield of each histogram bin.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use statrs::function::gamma::ln_gamma;
use tau_core::{Error, LikelihoodModel, Result};
use tau_hist::{Hist1D, ShapeFile};
use tau_translate::datacard::{EffectValue, MASS_KEY, RowKind};
use tau_translate::Datacard;

const STAGE: &str = "fit";
const MIN_YIELD: f64 = 1e-10;

/// Shapes files referenced by a card, keyed by the file name written in its `shapes` lines.
pub type ShapeStore = HashMap<String, ShapeFile>;

/// Read every shapes file referenced by `card`, relative to `base`.
pub fn load_shapes(card: &Datacard, base: &Path) -> Result<ShapeStore> {
    let mut store = ShapeStore::new();
    for line in &card.shapes {
        if store.contains_key(&line.file) {
            continue;
        }
        let path = base.join(&line.file);
        tracing::debug!(file = %path.display(), "loading shapes");
        store.insert(line.file.clone(), ShapeFile::read(&path)?);
    }
    Ok(store)
}

/// Constraint attached to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ParameterKind {
    /// Unconstrained.
    Free,
    /// Gaussian constraint `N(mean, sigma)`.
    Gaussian {
        /// Constraint mean.
        mean: f64,
        /// Constraint width.
        sigma: f64,
    },
    /// Poisson constraint of a bin-by-bin scale with `tau` effective events.
    PoissonStat {
        /// Effective number of MC events.
        tau: f64,
    },
}

/// A model parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    /// Name.
    pub name: String,
    /// Constraint.
    pub kind: ParameterKind,
    /// Initial value.
    pub init: f64,
    /// Allowed range.
    pub bounds: (f64, f64),
}

impl Parameter {
    fn constraint(&self, x: f64) -> f64 {
        match self.kind {
            ParameterKind::Free => 0.0,
            ParameterKind::Gaussian { mean, sigma } => 0.5 * ((x - mean) / sigma).powi(2),
            ParameterKind::PoissonStat { tau } => {
                let g = x.max(MIN_YIELD);
                tau * (g - 1.0 - g.ln())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ShapeDelta {
    param: usize,
    scale: f64,
    up: Vec<f64>,
    down: Vec<f64>,
}

#[derive(Debug, Clone)]
struct TemplatePoint {
    nominal: Vec<f64>,
    shapes: Vec<ShapeDelta>,
}

impl TemplatePoint {
    fn evaluate(&self, params: &[f64]) -> Vec<f64> {
        let mut out = self.nominal.clone();
        for s in &self.shapes {
            let alpha = params[s.param] * s.scale;
            for (i, v) in out.iter_mut().enumerate() {
                *v += histosys_code4p_delta(alpha, s.down[i], self.nominal[i], s.up[i]);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Morph {
    param: usize,
    values: Vec<f64>,
}

#[derive(Debug, Clone)]
struct ModelSample {
    process: String,
    signal: bool,
    in_stat: bool,
    morph: Option<Morph>,
    points: Vec<TemplatePoint>,
    norms: Vec<(usize, EffectValue)>,
    rate_params: Vec<usize>,
}

impl ModelSample {
    fn yields(&self, params: &[f64]) -> Vec<f64> {
        let template = match &self.morph {
            None => self.points[0].evaluate(params),
            Some(m) => {
                let (k, t) = grid_position(&m.values, params[m.param]);
                let lo = self.points[k].evaluate(params);
                if t == 0.0 {
                    lo
                } else {
                    let hi = self.points[k + 1].evaluate(params);
                    lo.iter().zip(&hi).map(|(a, b)| a + t * (b - a)).collect()
                }
            }
        };
        let mut norm: f64 = self.rate_params.iter().map(|&r| params[r]).product();
        for (p, effect) in &self.norms {
            norm *= match *effect {
                EffectValue::Sym(kappa) => lnn_factor(params[*p], kappa),
                EffectValue::Asym(lo, hi) => normsys_code4(params[*p], hi, lo),
            };
        }
        template.into_iter().map(|v| (v * norm).max(0.0)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum StatMode {
    Gaussian { sigma: f64 },
    Poisson,
}

#[derive(Debug, Clone, Copy)]
struct BinStat {
    param: usize,
    mode: StatMode,
}

#[derive(Debug, Clone)]
struct ModelBin {
    name: String,
    edges: Vec<f64>,
    observed: Vec<f64>,
    ln_factorials: f64,
    samples: Vec<ModelSample>,
    stats: Vec<Option<BinStat>>,
}

impl ModelBin {
    fn process_yields(&self, params: &[f64]) -> Vec<Vec<f64>> {
        let mut yields: Vec<Vec<f64>> = self.samples.iter().map(|s| s.yields(params)).collect();
        for (i, stat) in self.stats.iter().enumerate() {
            let Some(stat) = stat else { continue };
            let included: f64 = self.samples.iter().zip(&yields).filter(|(s, _)| s.in_stat).map(|(_, y)| y[i]).sum();
            let factor = match stat.mode {
                StatMode::Poisson => params[stat.param],
                StatMode::Gaussian { sigma } if included > 0.0 => {
                    ((included + params[stat.param] * sigma) / included).max(0.0)
                }
                StatMode::Gaussian { .. } => 1.0,
            };
            for (s, y) in self.samples.iter().zip(yields.iter_mut()) {
                if s.in_stat {
                    y[i] *= factor;
                }
            }
        }
        yields
    }
}

/// Binned Poisson likelihood of one or more card bins.
#[derive(Debug, Clone)]
pub struct BinnedModel {
    parameters: Vec<Parameter>,
    bins: Vec<ModelBin>,
}

fn lookup<'a>(store: &'a ShapeStore, file: &str, default_region: &str, path: &str) -> Option<&'a Hist1D> {
    let (region, name) = path.split_once('/').unwrap_or((default_region, path));
    store.get(file)?.get(region, name)
}

impl BinnedModel {
    /// Build the model of `card` from its shapes files.
    ///
    /// A card whose observation row sums to zero is a configuration error.
    pub fn from_card(card: &Datacard, store: &ShapeStore) -> Result<Self> {
        let total: f64 = card.observations.iter().map(|(_, o)| o).sum();
        if total <= 0.0 {
            return Err(Error::Config(format!(
                "observation row sums to {total}; nothing to fit in bins {:?}",
                card.bins()
            )));
        }

        let mut parameters: Vec<Parameter> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in &card.nuisances {
            if index.contains_key(&row.name) {
                continue;
            }
            index.insert(row.name.clone(), parameters.len());
            parameters.push(Parameter {
                name: row.name.clone(),
                kind: ParameterKind::Gaussian { mean: 0.0, sigma: 1.0 },
                init: 0.0,
                bounds: (-5.0, 5.0),
            });
        }
        for rp in &card.rate_params {
            if index.contains_key(&rp.name) {
                continue;
            }
            let bounds = rp.range.unwrap_or((0.0, rp.init.abs().max(1.0) * 10.0));
            index.insert(rp.name.clone(), parameters.len());
            parameters.push(Parameter { name: rp.name.clone(), kind: ParameterKind::Free, init: rp.init, bounds });
        }
        for line in &card.params {
            let Some(&i) = index.get(&line.name) else {
                tracing::warn!(parameter = %line.name, "param line for unknown parameter ignored");
                continue;
            };
            parameters[i].kind = ParameterKind::Gaussian { mean: line.mean, sigma: line.sigma };
        }

        let mut bins = Vec::new();
        for (bin, _) in &card.observations {
            let span = tracing::debug_span!("model", region = %bin);
            let _guard = span.enter();

            let data_line = card
                .shapes_for(bin, tau_hist::DATA_OBS)
                .ok_or_else(|| Error::input(STAGE, bin.clone(), "no shapes line for data_obs"))?;
            let data_path = data_line.nominal_path(bin, tau_hist::DATA_OBS, None);
            let data = lookup(store, &data_line.file, bin, &data_path)
                .ok_or_else(|| Error::input(STAGE, bin.clone(), format!("missing histogram '{data_path}'")))?;

            let mut samples = Vec::new();
            for (col, column) in card.columns.iter().enumerate().filter(|(_, c)| &c.bin == bin) {
                let sample = build_sample(card, store, col, &index, &mut parameters, data)?;
                tracing::debug!(process = %column.process, points = sample.points.len(), "sample");
                samples.push(sample);
            }

            let mut model_bin = ModelBin {
                name: bin.clone(),
                edges: data.edges.clone(),
                ln_factorials: data.content.iter().map(|n| ln_gamma(n + 1.0)).sum(),
                observed: data.content.clone(),
                samples,
                stats: vec![None; data.n_bins()],
            };
            if let Some(auto) = card.auto_mc_stats.iter().find(|a| &a.bin == bin || a.bin == "*") {
                add_bin_stats(card, store, &mut model_bin, auto.threshold, auto.include_signal != 0, &mut parameters)?;
            }
            bins.push(model_bin);
        }

        tracing::info!(
            bins = bins.len(),
            parameters = parameters.len(),
            "built binned model"
        );
        Ok(Self { parameters, bins })
    }

    /// Parameters in model order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Card bin names.
    pub fn bin_names(&self) -> Vec<&str> {
        self.bins.iter().map(|b| b.name.as_str()).collect()
    }

    /// Histogram edges of card bin `b`.
    pub fn bin_edges(&self, b: usize) -> &[f64] {
        &self.bins[b].edges
    }

    /// Observed counts of card bin `b`.
    pub fn observed(&self, b: usize) -> &[f64] {
        &self.bins[b].observed
    }

    /// `(process, is_signal)` of every sample in card bin `b`.
    pub fn processes(&self, b: usize) -> Vec<(&str, bool)> {
        self.bins[b].samples.iter().map(|s| (s.process.as_str(), s.signal)).collect()
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.parameter_index(name)
            .ok_or_else(|| Error::Validation(format!("unknown parameter '{name}'")))
    }

    /// Change the initial value of a parameter.
    pub fn set_init(&mut self, name: &str, value: f64) -> Result<()> {
        let i = self.require(name)?;
        let (lo, hi) = self.parameters[i].bounds;
        if value < lo || value > hi {
            return Err(Error::Validation(format!("{name}={value} outside [{lo}, {hi}]")));
        }
        self.parameters[i].init = value;
        Ok(())
    }

    /// Change the range of a parameter; the initial value is clamped into it.
    pub fn set_range(&mut self, name: &str, lo: f64, hi: f64) -> Result<()> {
        if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
            return Err(Error::Validation(format!("empty range [{lo}, {hi}] for {name}")));
        }
        let i = self.require(name)?;
        let p = &mut self.parameters[i];
        p.bounds = (lo, hi);
        p.init = p.init.clamp(lo, hi);
        Ok(())
    }

    /// Expected yields per card bin, per process.
    pub fn expected_by_process(&self, params: &[f64]) -> Result<Vec<Vec<Vec<f64>>>> {
        self.check_len(params)?;
        Ok(self.bins.iter().map(|b| b.process_yields(params)).collect())
    }

    /// Total expected yields per card bin.
    pub fn expected(&self, params: &[f64]) -> Result<Vec<Vec<f64>>> {
        Ok(self.expected_by_process(params)?.into_iter().map(|per| sum_columns(&per)).collect())
    }

    /// Copy of the model with new observations, one vector per card bin.
    pub fn with_observed(&self, observed: Vec<Vec<f64>>) -> Result<Self> {
        if observed.len() != self.bins.len()
            || observed.iter().zip(&self.bins).any(|(o, b)| o.len() != b.observed.len())
        {
            return Err(Error::Validation("observation shape differs from the model's bins".into()));
        }
        let mut out = self.clone();
        for (b, obs) in out.bins.iter_mut().zip(observed) {
            b.ln_factorials = obs.iter().map(|n| ln_gamma(n + 1.0)).sum();
            b.observed = obs;
        }
        Ok(out)
    }

    /// Asimov copy: observations replaced by the expectation at `params`.
    pub fn asimov(&self, params: &[f64]) -> Result<Self> {
        self.with_observed(self.expected(params)?)
    }

    fn check_len(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.parameters.len() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                self.parameters.len(),
                params.len()
            )));
        }
        Ok(())
    }
}

impl LikelihoodModel for BinnedModel {
    fn n_parameters(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.parameters.iter().map(|p| p.bounds).collect()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.init).collect()
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        self.check_len(params)?;
        let mut nll = 0.0;
        for b in &self.bins {
            let total = sum_columns(&b.process_yields(params));
            for (nu, n) in total.iter().zip(&b.observed) {
                let nu = nu.max(MIN_YIELD);
                nll += nu - n * nu.ln();
            }
            nll += b.ln_factorials;
        }
        for (p, x) in self.parameters.iter().zip(params) {
            nll += p.constraint(*x);
        }
        Ok(nll)
    }

    /// Central differences, one-sided at the parameter bounds.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut p = params.to_vec();
        for (i, param) in self.parameters.iter().enumerate() {
            let (lo, hi) = param.bounds;
            let h = 1e-6 * params[i].abs().max(1.0);
            let a = (params[i] - h).max(lo);
            let b = (params[i] + h).min(hi);
            if b <= a {
                continue;
            }
            p[i] = b;
            let up = self.nll(&p)?;
            p[i] = a;
            let down = self.nll(&p)?;
            p[i] = params[i];
            grad[i] = (up - down) / (b - a);
        }
        Ok(grad)
    }
}

fn sum_columns(per_process: &[Vec<f64>]) -> Vec<f64> {
    let n = per_process.first().map_or(0, Vec::len);
    (0..n).map(|i| per_process.iter().map(|y| y[i]).sum()).collect()
}

fn grid_position(values: &[f64], x: f64) -> (usize, f64) {
    let last = values.len() - 1;
    if x <= values[0] {
        return (0, 0.0);
    }
    if x >= values[last] {
        return (last, 0.0);
    }
    let k = values.partition_point(|v| *v <= x) - 1;
    (k, (x - values[k]) / (values[k + 1] - values[k]))
}

fn build_sample(
    card: &Datacard,
    store: &ShapeStore,
    col: usize,
    index: &HashMap<String, usize>,
    parameters: &mut [Parameter],
    data: &Hist1D,
) -> Result<ModelSample> {
    let column = &card.columns[col];
    let (bin, process) = (column.bin.as_str(), column.process.as_str());
    let context = format!("{bin}/{process}");
    let line = card
        .shapes_for(bin, process)
        .ok_or_else(|| Error::input(STAGE, context.clone(), "no shapes line"))?;

    let shape_rows: Vec<(usize, f64, &str)> = card
        .nuisances
        .iter()
        .filter(|r| r.kind == RowKind::Shape)
        .filter_map(|r| match r.effects.get(col).copied().flatten() {
            Some(EffectValue::Sym(s)) => Some((index[&r.name], s, r.name.as_str())),
            _ => None,
        })
        .collect();

    let fetch = |path: String| -> Result<&Hist1D> {
        let h = lookup(store, &line.file, bin, &path)
            .ok_or_else(|| Error::input(STAGE, context.clone(), format!("missing histogram '{path}'")))?;
        if !h.same_binning(data) {
            return Err(Error::template(bin, format!("binning of '{path}' differs from data_obs")));
        }
        Ok(h)
    };
    let point = |mass: Option<&str>| -> Result<(TemplatePoint, f64)> {
        let nominal = fetch(line.nominal_path(bin, process, mass))?;
        let mut shapes = Vec::with_capacity(shape_rows.len());
        for &(param, scale, name) in &shape_rows {
            let up = fetch(line.systematic_path(bin, process, &format!("{name}Up"), mass))?;
            let down = fetch(line.systematic_path(bin, process, &format!("{name}Down"), mass))?;
            shapes.push(ShapeDelta { param, scale, up: up.content.clone(), down: down.content.clone() });
        }
        Ok((TemplatePoint { nominal: nominal.content.clone(), shapes }, nominal.integral()))
    };

    let morph_param = card.morph_parameter(bin, process);
    let (mut points, reference, morph) = match morph_param {
        None => {
            let (p, integral) = point(None)?;
            (vec![p], integral, None)
        }
        Some(rp) => {
            let grid = grid_labels(store, &line.file, &line.nominal_path(bin, process, None), bin);
            if grid.len() < 2 {
                return Err(Error::template(bin, format!("'{process}' needs at least two grid templates")));
            }
            let param = index[&rp.name];
            let mut points = Vec::with_capacity(grid.len());
            let mut reference = (f64::INFINITY, 0.0);
            for (value, label) in &grid {
                let (p, integral) = point(Some(label.as_str()))?;
                let dist = (value - rp.init).abs();
                if dist < reference.0 {
                    reference = (dist, integral);
                }
                points.push(p);
            }
            let values: Vec<f64> = grid.iter().map(|(v, _)| *v).collect();
            let (lo, hi) = parameters[param].bounds;
            let (lo, hi) = (lo.max(values[0]), hi.min(values[values.len() - 1]));
            if lo < hi {
                parameters[param].bounds = (lo, hi);
                parameters[param].init = parameters[param].init.clamp(lo, hi);
            }
            (points, reference.1, Some(Morph { param, values }))
        }
    };

    if column.rate >= 0.0 && reference > 0.0 && ((column.rate / reference) - 1.0).abs() > 1e-6 {
        let s = column.rate / reference;
        tracing::debug!(process, scale = s, "templates rescaled to the card rate");
        for p in &mut points {
            p.nominal.iter_mut().for_each(|v| *v *= s);
            for d in &mut p.shapes {
                d.up.iter_mut().for_each(|v| *v *= s);
                d.down.iter_mut().for_each(|v| *v *= s);
            }
        }
    }

    let norms = card
        .nuisances
        .iter()
        .filter(|r| r.kind == RowKind::LnN)
        .filter_map(|r| r.effects.get(col).copied().flatten().map(|e| (index[&r.name], e)))
        .collect();
    let morph_name = morph_param.map(|r| r.name.as_str());
    let mut rate_params = Vec::new();
    for rp in card.norm_parameters(bin, process) {
        let i = index[&rp.name];
        if Some(rp.name.as_str()) != morph_name && !rate_params.contains(&i) {
            rate_params.push(i);
        }
    }

    Ok(ModelSample {
        process: process.to_string(),
        signal: column.id <= 0,
        in_stat: true,
        morph,
        points,
        norms,
        rate_params,
    })
}

/// `(value, label)` of every grid template matching a `$MASS` pattern, sorted by value.
fn grid_labels(store: &ShapeStore, file: &str, pattern: &str, bin: &str) -> Vec<(f64, String)> {
    let (region, name) = pattern.split_once('/').unwrap_or((bin, pattern));
    let Some((prefix, suffix)) = name.split_once(MASS_KEY) else {
        return Vec::new();
    };
    let Some(shapes) = store.get(file).and_then(|f| f.region(region)) else {
        return Vec::new();
    };
    let mut grid: Vec<(f64, String)> = shapes
        .names()
        .filter_map(|n| {
            let label = n.strip_prefix(prefix)?.strip_suffix(suffix)?;
            let value: f64 = label.parse().ok()?;
            Some((value, label.to_string()))
        })
        .collect();
    grid.sort_by(|a, b| a.0.total_cmp(&b.0));
    grid.dedup_by(|a, b| a.0 == b.0);
    grid
}

fn add_bin_stats(
    card: &Datacard,
    store: &ShapeStore,
    model_bin: &mut ModelBin,
    threshold: u32,
    include_signal: bool,
    parameters: &mut Vec<Parameter>,
) -> Result<()> {
    for s in &mut model_bin.samples {
        s.in_stat = include_signal || !s.signal;
    }
    let n = model_bin.observed.len();
    let mut sum = vec![0.0; n];
    let mut err2 = vec![0.0; n];
    for s in model_bin.samples.iter().filter(|s| s.in_stat) {
        let line = card
            .shapes_for(&model_bin.name, &s.process)
            .ok_or_else(|| Error::input(STAGE, format!("{}/{}", model_bin.name, s.process), "no shapes line"))?;
        let hist = match &s.morph {
            None => lookup(store, &line.file, &model_bin.name, &line.nominal_path(&model_bin.name, &s.process, None)),
            Some(m) => {
                let (k, _) = grid_position(&m.values, parameters[m.param].init);
                let grid = grid_labels(store, &line.file, &line.nominal_path(&model_bin.name, &s.process, None), &model_bin.name);
                grid.get(k).and_then(|(_, label)| {
                    let path = line.nominal_path(&model_bin.name, &s.process, Some(label.as_str()));
                    lookup(store, &line.file, &model_bin.name, &path)
                })
            }
        };
        let Some(hist) = hist else { continue };
        for i in 0..n {
            sum[i] += hist.content[i];
            err2[i] += hist.sumw2[i];
        }
    }
    for i in 0..n {
        if sum[i] <= 0.0 || err2[i] <= 0.0 {
            continue;
        }
        let n_eff = sum[i] * sum[i] / err2[i];
        let name = format!("prop_bin{}_bin{i}", model_bin.name);
        let (kind, init, bounds, mode) = if n_eff >= f64::from(threshold) {
            let sigma = err2[i].sqrt();
            (ParameterKind::Gaussian { mean: 0.0, sigma: 1.0 }, 0.0, (-5.0, 5.0), StatMode::Gaussian { sigma })
        } else {
            let upper = 1.0 + 10.0 / n_eff.sqrt();
            (ParameterKind::PoissonStat { tau: n_eff }, 1.0, (1e-6, upper), StatMode::Poisson)
        };
        model_bin.stats[i] = Some(BinStat { param: parameters.len(), mode });
        parameters.push(Parameter { name, kind, init, bounds });
    }
    Ok(())
}

/// `kappa^theta`, linear for non-positive kappa.
fn lnn_factor(theta: f64, kappa: f64) -> f64 {
    if kappa > 0.0 { kappa.powf(theta) } else { (1.0 + theta * (kappa - 1.0)).max(0.0) }
}

fn normsys_code4_coeffs(hi: f64, lo: f64) -> [f64; 6] {
    const A_INV: [[f64; 6]; 6] = [
        [15.0 / 16.0, -15.0 / 16.0, -7.0 / 16.0, -7.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [3.0 / 2.0, 3.0 / 2.0, -9.0 / 16.0, 9.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
        [-5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, -1.0 / 8.0, 1.0 / 8.0],
        [-3.0 / 2.0, -3.0 / 2.0, 7.0 / 8.0, -7.0 / 8.0, -1.0 / 8.0, -1.0 / 8.0],
        [3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [1.0 / 2.0, 1.0 / 2.0, -5.0 / 16.0, 5.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
    ];
    let b = [
        hi - 1.0,
        lo - 1.0,
        hi * hi.ln(),
        -lo * lo.ln(),
        hi * hi.ln().powi(2),
        lo * lo.ln().powi(2),
    ];
    let mut a = [0.0; 6];
    for (r, row) in A_INV.iter().enumerate() {
        a[r] = row.iter().zip(&b).map(|(x, y)| x * y).sum();
    }
    a
}

/// Asymmetric log-normal factor: exponential outside `|theta| < 1`,
/// a sixth-order polynomial inside.
fn normsys_code4(theta: f64, hi: f64, lo: f64) -> f64 {
    if hi <= 0.0 || lo <= 0.0 {
        return if theta >= 0.0 { 1.0 + theta * (hi - 1.0) } else { 1.0 - theta * (1.0 - lo) };
    }
    if theta.abs() >= 1.0 {
        let base = if theta >= 0.0 { hi } else { lo };
        return (theta.abs() * base.ln()).exp();
    }
    let c = normsys_code4_coeffs(hi, lo);
    1.0 + c.iter().enumerate().map(|(k, ck)| ck * theta.powi(k as i32 + 1)).sum::<f64>()
}

/// Additive shape morph: linear outside `|alpha| <= 1`, a smooth polynomial inside.
fn histosys_code4p_delta(alpha: f64, down: f64, nom: f64, up: f64) -> f64 {
    let delta_up = up - nom;
    let delta_dn = nom - down;
    if alpha > 1.0 {
        return delta_up * alpha;
    }
    if alpha < -1.0 {
        return delta_dn * alpha;
    }
    let s = 0.5 * (delta_up + delta_dn);
    let a = 0.0625 * (delta_up - delta_dn);
    let asq = alpha * alpha;
    alpha * s + asq * (asq * (3.0 * asq - 10.0) + 15.0) * a
}
