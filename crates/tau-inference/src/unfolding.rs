//! Z-pT unfolding: 4D response tensor, iterative Bayesian unfolding and the
//! per-event weight `w(pT_gen, m_gen)`.
//!
//! 2D histograms are linearized with `k = (i - 1) * ny + j` (1-indexed), which
//! is the row-major layout of [`Hist2D`]. The response matrix `R[k_reco, k_gen]`
//! holds event counts; its column sums are the generated yields.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};
use tau_hist::{ColumnTable, CompiledExpr, Hist1D, Hist2D, fold_bin};

use crate::fit::write_json;

/// Default clipping range of the weights.
pub const WEIGHT_RANGE: (f64, f64) = (0.3, 1.7);

/// 4D response `(reco x, reco y, gen x, gen y)` with flows folded into the edge bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseTensor {
    /// Reco-level x edges (pT).
    pub reco_x_edges: Vec<f64>,
    /// Reco-level y edges (mass).
    pub reco_y_edges: Vec<f64>,
    /// Gen-level x edges.
    pub gen_x_edges: Vec<f64>,
    /// Gen-level y edges.
    pub gen_y_edges: Vec<f64>,
    /// Contents, `content[k_reco * n_gen + k_gen]` with 0-based flat indices.
    pub content: Vec<f64>,
}

impl ResponseTensor {
    /// Empty tensor.
    pub fn new(reco_x: Vec<f64>, reco_y: Vec<f64>, gen_x: Vec<f64>, gen_y: Vec<f64>) -> Result<Self> {
        // Edge validation is shared with the 2D histogram.
        Hist2D::new("reco", reco_x.clone(), reco_y.clone())?;
        Hist2D::new("gen", gen_x.clone(), gen_y.clone())?;
        let n = n_bins(&reco_x) * n_bins(&reco_y) * n_bins(&gen_x) * n_bins(&gen_y);
        Ok(Self { reco_x_edges: reco_x, reco_y_edges: reco_y, gen_x_edges: gen_x, gen_y_edges: gen_y, content: vec![0.0; n] })
    }

    /// Number of flattened reco bins.
    pub fn n_reco(&self) -> usize {
        n_bins(&self.reco_x_edges) * n_bins(&self.reco_y_edges)
    }

    /// Number of flattened gen bins.
    pub fn n_gen(&self) -> usize {
        n_bins(&self.gen_x_edges) * n_bins(&self.gen_y_edges)
    }

    /// Validate the binning and the content length.
    pub fn check(&self) -> Result<()> {
        for (axis, edges) in [
            ("reco x", &self.reco_x_edges),
            ("reco y", &self.reco_y_edges),
            ("gen x", &self.gen_x_edges),
            ("gen y", &self.gen_y_edges),
        ] {
            if edges.len() < 2 || edges.windows(2).any(|w| !(w[1] > w[0])) {
                return Err(Error::Validation(format!("response {axis} edges must be increasing with at least one bin")));
            }
        }
        if self.content.len() != self.n_reco() * self.n_gen() {
            return Err(Error::Validation(format!(
                "response has {} entries, binning needs {}x{}",
                self.content.len(),
                self.n_reco(),
                self.n_gen()
            )));
        }
        Ok(())
    }

    /// Fill one event. NaN coordinates are dropped, and so is every event on
    /// a malformed tensor.
    pub fn fill(&mut self, reco: (f64, f64), generated: (f64, f64), w: f64) {
        if self.n_reco() * self.n_gen() != self.content.len() || self.content.is_empty() {
            return;
        }
        let bins = (
            fold_bin(&self.reco_x_edges, reco.0),
            fold_bin(&self.reco_y_edges, reco.1),
            fold_bin(&self.gen_x_edges, generated.0),
            fold_bin(&self.gen_y_edges, generated.1),
        );
        let (Some(rx), Some(ry), Some(gx), Some(gy)) = bins else {
            return;
        };
        let k_reco = rx * (self.reco_y_edges.len() - 1) + ry;
        let k_gen = gx * (self.gen_y_edges.len() - 1) + gy;
        let n_gen = self.n_gen();
        self.content[k_reco * n_gen + k_gen] += w;
    }

    /// Fill from an event table: `branches` are `[reco x, reco y, gen x, gen y]`.
    pub fn fill_table(&mut self, table: &ColumnTable, branches: [&str; 4], weight: Option<&CompiledExpr>) -> Result<()> {
        self.check()?;
        let cols = branches
            .iter()
            .map(|b| {
                table.column(b).ok_or_else(|| {
                    Error::input("unfolding", table.name().to_string(), format!("missing branch '{b}'"))
                })
            })
            .collect::<Result<Vec<&[f64]>>>()?;
        let weights = match weight {
            Some(expr) => expr.eval_table(table)?,
            None => vec![1.0; table.n_rows()],
        };
        for (i, w) in weights.iter().enumerate() {
            self.fill((cols[0][i], cols[1][i]), (cols[2][i], cols[3][i]), *w);
        }
        Ok(())
    }

    /// Flat reco bin holding the center of flat gen bin `g`.
    pub fn reco_bin_of_gen(&self, g: usize) -> Option<usize> {
        let ny = n_bins(&self.gen_y_edges);
        if ny == 0 || g >= self.n_gen() || self.n_reco() == 0 {
            return None;
        }
        let (gx, gy) = (g / ny, g % ny);
        let x = 0.5 * (self.gen_x_edges[gx] + self.gen_x_edges[gx + 1]);
        let y = 0.5 * (self.gen_y_edges[gy] + self.gen_y_edges[gy + 1]);
        let rx = fold_bin(&self.reco_x_edges, x)?;
        let ry = fold_bin(&self.reco_y_edges, y)?;
        Some(rx * n_bins(&self.reco_y_edges) + ry)
    }

    /// Response matrix `R[k_reco, k_gen]` (0-based flat indices).
    pub fn matrix(&self) -> Result<DMatrix<f64>> {
        self.check()?;
        Ok(DMatrix::from_row_slice(self.n_reco(), self.n_gen(), &self.content))
    }

    /// Sum over the gen indices: the simulated reco-level distribution.
    pub fn reco_projection(&self, name: &str) -> Result<Hist2D> {
        let m = self.matrix()?;
        let mut h = Hist2D::new(name, self.reco_x_edges.clone(), self.reco_y_edges.clone())?;
        for (k, row) in m.row_iter().enumerate() {
            h.content[k] = row.sum();
        }
        Ok(h)
    }

    /// Sum over the reco indices: the simulated gen-level distribution.
    pub fn gen_projection(&self, name: &str) -> Result<Hist2D> {
        let m = self.matrix()?;
        let mut h = Hist2D::new(name, self.gen_x_edges.clone(), self.gen_y_edges.clone())?;
        for (k, col) in m.column_iter().enumerate() {
            h.content[k] = col.sum();
        }
        Ok(h)
    }
}

fn n_bins(edges: &[f64]) -> usize {
    edges.len().saturating_sub(1)
}

/// Unfolding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnfoldMethod {
    /// Iterative Bayesian (D'Agostini).
    #[default]
    Bayes,
    /// Ratio of simulated gen to reco per bin.
    BinByBin,
}

impl std::str::FromStr for UnfoldMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bayes" => Ok(Self::Bayes),
            "bin-by-bin" | "binbybin" => Ok(Self::BinByBin),
            other => Err(Error::Config(format!("unknown unfolding method '{other}'"))),
        }
    }
}

/// Starting distribution of the Bayesian iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Prior {
    /// The simulated gen-level distribution.
    #[default]
    Simulation,
    /// Flat, normalized to the observed yield.
    Uniform,
}

/// Unfolding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnfoldingConfig {
    /// Method.
    #[serde(default)]
    pub method: UnfoldMethod,
    /// Number of Bayesian iterations (a regularization, not a convergence criterion).
    pub iterations: i32,
    /// Prior.
    #[serde(default)]
    pub prior: Prior,
    /// Weight clipping range.
    pub weight_range: (f64, f64),
}

impl Default for UnfoldingConfig {
    fn default() -> Self {
        Self { method: UnfoldMethod::Bayes, iterations: 4, prior: Prior::Simulation, weight_range: WEIGHT_RANGE }
    }
}

/// Inputs of one unfolding, as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnfoldingInput {
    /// Prefix of the output histogram names.
    pub name: String,
    /// Observed reco-level 2D distribution.
    pub observed: Hist2D,
    /// Expected background, subtracted from `observed`.
    #[serde(default)]
    pub background: Option<Hist2D>,
    /// Simulated reco-level distribution; the response projection when absent.
    #[serde(default)]
    pub sim_reco: Option<Hist2D>,
    /// Simulated gen-level distribution; the response projection when absent.
    #[serde(default)]
    pub sim_gen: Option<Hist2D>,
    /// Response tensor of the same simulation.
    pub response: ResponseTensor,
}

impl UnfoldingInput {
    /// Read from JSON.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::input("unfolding", path.display().to_string(), format!("cannot read input: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write as JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

/// Weights and control histograms of one unfolding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnfoldingResult {
    /// Method used.
    pub method: UnfoldMethod,
    /// Iterations run (0 for bin-by-bin).
    pub iterations: i32,
    /// Per-event weight in (gen x, gen y).
    pub weight: Hist2D,
    /// Unrolled weight.
    pub weight_1d: Hist1D,
    /// Unfolded distribution, unrolled.
    pub unfolded: Hist1D,
    /// Unfolded distribution rolled up.
    pub unfolded_2d: Hist2D,
    /// Per reco bin, the fraction of its events from the same gen bin.
    pub purity: Vec<f64>,
    /// Per gen bin, the fraction of its events reconstructed in the same bin.
    pub stability: Vec<f64>,
    /// Weights that hit the clipping range.
    pub n_clipped: usize,
    /// Control histograms by name.
    pub controls: BTreeMap<String, Hist1D>,
    /// 2D control histograms by name.
    pub controls_2d: BTreeMap<String, Hist2D>,
    /// Response matrix rows (reco) by columns (gen).
    pub response: Vec<Vec<f64>>,
}

impl UnfoldingResult {
    /// Write as JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Read from JSON.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::input("unfolding", path.display().to_string(), format!("cannot read result: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Runs the unfolding.
#[derive(Debug, Clone, Default)]
pub struct Unfolder {
    config: UnfoldingConfig,
}

impl Unfolder {
    /// Unfolder with the given settings.
    pub fn new(config: UnfoldingConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &UnfoldingConfig {
        &self.config
    }

    /// Unfold `input` and derive the weights.
    pub fn run(&self, input: &UnfoldingInput) -> Result<UnfoldingResult> {
        let cfg = &self.config;
        if cfg.iterations < 0 {
            return Err(Error::Unfolding(format!("negative iteration count {}", cfg.iterations)));
        }
        let (w_lo, w_hi) = cfg.weight_range;
        if !(w_lo > 0.0 && w_lo <= 1.0 && w_hi >= 1.0) {
            return Err(Error::Config(format!("weight range [{w_lo}, {w_hi}] must contain 1")));
        }

        let response = &input.response;
        let r = response.matrix()?;
        let sim_reco = match &input.sim_reco {
            Some(h) => h.clone(),
            None => response.reco_projection(&format!("{}_dy_reco2D", input.name))?,
        };
        let sim_gen = match &input.sim_gen {
            Some(h) => h.clone(),
            None => response.gen_projection(&format!("{}_dy_gen2D", input.name))?,
        };
        let reco_frame = Hist2D::new("reco", response.reco_x_edges.clone(), response.reco_y_edges.clone())?;
        let gen_frame = Hist2D::new("gen", response.gen_x_edges.clone(), response.gen_y_edges.clone())?;
        for (h, frame) in [(&input.observed, &reco_frame), (&sim_reco, &reco_frame), (&sim_gen, &gen_frame)] {
            if !h.same_binning(frame) {
                return Err(Error::Validation(format!("binning of '{}' differs from the response", h.name)));
            }
        }

        let mut signal = input.observed.clone();
        if let Some(bkg) = &input.background {
            signal.subtract(bkg)?;
        }
        let obs = signal.flatten();
        let gen_flat = sim_gen.flatten();
        let reco_flat = sim_reco.flatten();

        let (n_reco, n_gen) = (r.nrows(), r.ncols());
        let row_sums: Vec<f64> = r.row_iter().map(|row| row.sum()).collect();
        let col_sums: Vec<f64> = r.column_iter().map(|col| col.sum()).collect();
        for k in 0..n_reco {
            if row_sums[k] <= 0.0 && obs.content[k] != 0.0 {
                return Err(Error::Unfolding(format!(
                    "reco bin {} has observed content {} but no response from any gen bin",
                    k + 1,
                    obs.content[k]
                )));
            }
        }
        for (g, sum) in col_sums.iter().enumerate() {
            let Some(k) = response.reco_bin_of_gen(g) else { continue };
            if *sum <= 0.0 && obs.content[k] != 0.0 {
                return Err(Error::Unfolding(format!(
                    "gen bin {} has no response but its reco bin {} has observed content {}",
                    g + 1,
                    k + 1,
                    obs.content[k]
                )));
            }
        }

        tracing::info!(
            stage = "unfolding",
            name = %input.name,
            method = ?cfg.method,
            iterations = cfg.iterations,
            n_reco,
            n_gen,
            "unfolding"
        );

        let (mut unfolded, variance, iterations) = match cfg.method {
            UnfoldMethod::Bayes => {
                let prior = match cfg.prior {
                    Prior::Simulation => gen_flat.content.clone(),
                    Prior::Uniform => vec![obs.integral().max(0.0) / n_gen as f64; n_gen],
                };
                let (p, var) = bayes(&r, &col_sums, &obs, prior, cfg.iterations as usize);
                (p, var, cfg.iterations)
            }
            UnfoldMethod::BinByBin => {
                if n_reco != n_gen {
                    return Err(Error::Unfolding(format!(
                        "bin-by-bin unfolding needs as many reco as gen bins, got {n_reco} and {n_gen}"
                    )));
                }
                let (p, var) = bin_by_bin(&obs, &reco_flat, &gen_flat)?;
                (p, var, 0)
            }
        };
        for (k, v) in unfolded.iter_mut().enumerate() {
            if *v < 0.0 {
                tracing::debug!(bin = k + 1, value = *v, "clipping negative unfolded yield");
                *v = 0.0;
            }
        }

        let total: f64 = unfolded.iter().sum();
        if total <= 0.0 {
            return Err(Error::Unfolding("unfolded distribution is empty".into()));
        }
        let live: Vec<bool> = (0..n_gen).map(|g| gen_flat.content[g] > 0.0 && col_sums[g] > 0.0).collect();
        let (weights, n_clipped) = clipped_weights(&unfolded, &gen_flat.content, &live, cfg.weight_range);
        if n_clipped > 0 {
            tracing::warn!(n_clipped, "unfolding weights clipped to [{w_lo}, {w_hi}]");
        }

        let name = &input.name;
        let unfolded_1d = Hist1D::from_content(format!("{name}_dy_unfold"), gen_flat.edges.clone(), unfolded.clone(), Some(variance))?;
        let weight_1d = Hist1D::from_content(format!("{name}_weight_1D"), gen_flat.edges.clone(), weights.clone(), Some(vec![0.0; n_gen]))?;
        let weight_2d = sim_gen.roll_up(format!("{name}_weight"), &weights)?;
        let unfolded_2d = sim_gen.roll_up(format!("{name}_dy_unfold_2D"), &unfolded)?;
        let (purity, stability) = purity_stability(&r, &row_sums, &col_sums);

        let mut expected = reco_flat.clone();
        if let Some(bkg) = &input.background {
            expected.add(&bkg.flatten())?;
        }

        let mut controls = BTreeMap::new();
        let mut put = |h: Hist1D, suffix: &str| {
            let key = format!("{name}_{suffix}");
            controls.insert(key.clone(), h.renamed(key));
        };
        put(input.observed.flatten(), "obs_reco");
        put(expected, "exp_reco");
        if let Some(bkg) = &input.background {
            put(bkg.flatten(), "bkg_reco");
        }
        put(obs.clone(), "obsdy_reco");
        put(reco_flat, "dy_reco");
        put(gen_flat, "dy_gen");
        let mut controls_2d = BTreeMap::new();
        for (h, suffix) in [(&sim_reco, "dy_reco2D"), (&sim_gen, "dy_gen2D")] {
            let key = format!("{name}_{suffix}");
            let mut h = h.clone();
            h.name = key.clone();
            controls_2d.insert(key, h);
        }

        Ok(UnfoldingResult {
            method: cfg.method,
            iterations,
            weight: weight_2d,
            weight_1d,
            unfolded: unfolded_1d,
            unfolded_2d,
            purity,
            stability,
            n_clipped,
            controls,
            controls_2d,
            response: r.row_iter().map(|row| row.iter().copied().collect()).collect(),
        })
    }
}

/// `unfolded / gen` per live gen bin, 1 elsewhere, clipped to `range`.
///
/// What clipping removes from `sum(w * gen)` is spread over the unclipped
/// bins, so the reweighted simulation keeps the unfolded yield whenever the
/// range allows it.
fn clipped_weights(unfolded: &[f64], generated: &[f64], live: &[bool], range: (f64, f64)) -> (Vec<f64>, usize) {
    let (lo, hi) = range;
    let mut weights: Vec<f64> =
        (0..generated.len()).map(|g| if live[g] { unfolded[g] / generated[g] } else { 1.0 }).collect();
    let mut clipped: Vec<bool> = weights.iter().zip(live).map(|(w, l)| *l && !(lo..=hi).contains(w)).collect();
    let target: f64 = (0..generated.len()).filter(|&g| live[g]).map(|g| unfolded[g]).sum();

    for _ in 0..generated.len() {
        for (w, c) in weights.iter_mut().zip(&clipped) {
            if *c {
                *w = w.clamp(lo, hi);
            }
        }
        let (mut fixed, mut free) = (0.0, 0.0);
        for g in (0..generated.len()).filter(|&g| live[g]) {
            if clipped[g] {
                fixed += weights[g] * generated[g];
            } else {
                free += weights[g] * generated[g];
            }
        }
        if free <= 0.0 {
            break;
        }
        let scale = (target - fixed) / free;
        if (scale - 1.0).abs() < 1e-12 {
            break;
        }
        let mut moved = false;
        for g in 0..generated.len() {
            if !(live[g] && !clipped[g]) {
                continue;
            }
            weights[g] *= scale;
            if !(lo..=hi).contains(&weights[g]) {
                clipped[g] = true;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    for (w, c) in weights.iter_mut().zip(&clipped) {
        if *c {
            *w = w.clamp(lo, hi);
        }
    }
    let reweighted: f64 = (0..generated.len()).filter(|&g| live[g]).map(|g| weights[g] * generated[g]).sum();
    if target > 0.0 && (reweighted / target - 1.0).abs() > 1e-3 {
        tracing::warn!(target, reweighted, "clipped weights cannot keep the unfolded yield");
    }
    (weights, clipped.iter().filter(|c| **c).count())
}

/// D'Agostini iterations on the column-normalized response.
///
/// Returns the unfolded yields and their variance from the last unfolding
/// matrix, with the observation treated as Poisson.
fn bayes(r: &DMatrix<f64>, col_sums: &[f64], obs: &Hist1D, prior: Vec<f64>, n_iter: usize) -> (Vec<f64>, Vec<f64>) {
    let (n_reco, n_gen) = (r.nrows(), r.ncols());
    let prob = DMatrix::from_fn(n_reco, n_gen, |i, g| if col_sums[g] > 0.0 { r[(i, g)] / col_sums[g] } else { 0.0 });
    let mut p: Vec<f64> = prior.iter().enumerate().map(|(g, v)| if col_sums[g] > 0.0 { v.max(0.0) } else { 0.0 }).collect();
    let mut variance = vec![0.0; n_gen];

    for it in 0..n_iter {
        let mut next = vec![0.0; n_gen];
        let mut var = vec![0.0; n_gen];
        for i in 0..n_reco {
            let denom: f64 = (0..n_gen).map(|g| prob[(i, g)] * p[g]).sum();
            if denom <= 0.0 {
                continue;
            }
            let o = obs.content[i];
            let o_var = obs.sumw2[i];
            for g in 0..n_gen {
                let m = prob[(i, g)] * p[g] / denom;
                next[g] += m * o;
                var[g] += m * m * o_var;
            }
        }
        tracing::trace!(iteration = it + 1, total = next.iter().sum::<f64>(), "bayes iteration");
        p = next;
        variance = var;
    }
    // Empty gen columns keep their prior out of the result.
    for g in 0..n_gen {
        if col_sums[g] <= 0.0 {
            p[g] = 0.0;
        }
    }
    (p, variance)
}

fn bin_by_bin(obs: &Hist1D, reco: &Hist1D, generated: &Hist1D) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut p = Vec::with_capacity(obs.n_bins());
    let mut var = Vec::with_capacity(obs.n_bins());
    for k in 0..obs.n_bins() {
        if reco.content[k] <= 0.0 {
            if obs.content[k] != 0.0 && generated.content[k] > 0.0 {
                return Err(Error::Unfolding(format!("reco bin {} is empty in simulation", k + 1)));
            }
            p.push(0.0);
            var.push(0.0);
            continue;
        }
        let factor = generated.content[k] / reco.content[k];
        p.push(obs.content[k] * factor);
        var.push(obs.sumw2[k] * factor * factor);
    }
    Ok((p, var))
}

fn purity_stability(r: &DMatrix<f64>, row_sums: &[f64], col_sums: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = r.nrows().min(r.ncols());
    let purity = (0..r.nrows())
        .map(|i| if i < n && row_sums[i] > 0.0 { r[(i, i)] / row_sums[i] } else { 0.0 })
        .collect();
    let stability = (0..r.ncols())
        .map(|g| if g < n && col_sums[g] > 0.0 { r[(g, g)] / col_sums[g] } else { 0.0 })
        .collect();
    (purity, stability)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn edges(n: usize) -> Vec<f64> {
        (0..=n).map(|i| i as f64 * 10.0).collect()
    }

    /// 3x3 reco and gen bins with 20% migration to the next pT bin.
    pub(crate) fn smeared_input() -> UnfoldingInput {
        let mut t = ResponseTensor::new(edges(3), edges(3), edges(3), edges(3)).unwrap();
        for gx in 0..3 {
            for gy in 0..3 {
                let n = 100.0 * (3 - gx) as f64 + 20.0 * gy as f64;
                let (x, y) = (gx as f64 * 10.0 + 5.0, gy as f64 * 10.0 + 5.0);
                let stay = if gx == 2 { 1.0 } else { 0.8 };
                t.fill((x, y), (x, y), stay * n);
                if gx < 2 {
                    t.fill((x + 10.0, y), (x, y), 0.2 * n);
                }
            }
        }
        let reco = t.reco_projection("sim_reco").unwrap();
        UnfoldingInput { name: "zpt".into(), observed: reco, background: None, sim_reco: None, sim_gen: None, response: t }
    }

    #[test]
    fn test_response_projections() {
        let input = smeared_input();
        let gen_h = input.response.gen_projection("gen").unwrap();
        assert_relative_eq!(gen_h.get(0, 0), 300.0);
        assert_relative_eq!(gen_h.get(2, 2), 140.0);
        let reco = input.response.reco_projection("reco").unwrap();
        // 80% of 300 stays, nothing migrates into the first pT bin
        assert_relative_eq!(reco.get(0, 0), 240.0);
        assert_relative_eq!(reco.get(1, 0), 0.8 * 200.0 + 0.2 * 300.0);
        assert_relative_eq!(reco.integral(), gen_h.integral(), epsilon = 1e-9);
    }

    #[test]
    fn test_fill_folds_flows() {
        let mut t = ResponseTensor::new(edges(2), edges(2), edges(2), edges(2)).unwrap();
        t.fill((-5.0, 50.0), (5.0, 5.0), 1.0);
        t.fill((f64::NAN, 5.0), (5.0, 5.0), 1.0);
        let m = t.matrix().unwrap();
        // reco (0, 1) is flat bin 1, gen (0, 0) is flat bin 0
        assert_eq!(m[(1, 0)], 1.0);
        assert_eq!(m.sum(), 1.0);
    }

    #[test]
    fn test_closure() {
        let input = smeared_input();
        let res = Unfolder::default().run(&input).unwrap();
        let gen_h = input.response.gen_projection("gen").unwrap();
        for k in 0..9 {
            assert_relative_eq!(res.unfolded.content[k], gen_h.content[k], max_relative = 1e-9);
            assert_relative_eq!(res.weight_1d.content[k], 1.0, epsilon = 1e-9);
        }
        assert_eq!(res.n_clipped, 0);
    }

    #[test]
    fn test_bayes_corrects_migration() {
        let mut input = smeared_input();
        // 10% more events in the highest gen pT bins, observed after smearing
        let mut t = input.response.clone();
        let n_gen = t.n_gen();
        for k_reco in 0..t.n_reco() {
            for k_gen in 6..9 {
                t.content[k_reco * n_gen + k_gen] *= 1.1;
            }
        }
        input.observed = t.reco_projection("obs").unwrap();
        let res = Unfolder::new(UnfoldingConfig { iterations: 50, ..UnfoldingConfig::default() }).run(&input).unwrap();
        let w = &res.weight;
        assert!(w.get(2, 0) > w.get(0, 0));
        for v in &res.weight.content {
            assert!((0.3..=1.7).contains(v));
        }
    }

    #[test]
    fn test_zero_iterations_return_prior() {
        let mut input = smeared_input();
        for v in input.observed.content.iter_mut() {
            *v *= 2.0;
        }
        let cfg = UnfoldingConfig { iterations: 0, ..UnfoldingConfig::default() };
        let res = Unfolder::new(cfg).run(&input).unwrap();
        assert_relative_eq!(res.unfolded.integral(), input.response.gen_projection("g").unwrap().integral());
    }

    #[test]
    fn test_negative_iterations_fatal() {
        let cfg = UnfoldingConfig { iterations: -1, ..UnfoldingConfig::default() };
        assert!(matches!(Unfolder::new(cfg).run(&smeared_input()), Err(Error::Unfolding(_))));
    }

    #[test]
    fn test_unobservable_reco_bin_fatal() {
        let mut input = smeared_input();
        // reco bin (0, 0) keeps its observed content but loses its response row
        let n_gen = input.response.n_gen();
        for k in 0..n_gen {
            input.response.content[k] = 0.0;
        }
        input.sim_reco = Some(input.observed.clone());
        let err = Unfolder::default().run(&input).unwrap_err();
        assert!(matches!(err, Error::Unfolding(_)), "{err}");
    }

    #[test]
    fn test_empty_gen_bin_weight_is_one() {
        let mut input = smeared_input();
        let n_gen = input.response.n_gen();
        for k_reco in 0..input.response.n_reco() {
            input.response.content[k_reco * n_gen + 8] = 0.0;
        }
        input.observed = input.response.reco_projection("obs").unwrap();
        // the migration from gen (1, 2) is not observed either
        input.observed.set(2, 2, 0.0);
        let res = Unfolder::default().run(&input).unwrap();
        assert_eq!(res.weight.get(2, 2), 1.0);
        assert_eq!(res.unfolded.content[8], 0.0);
    }

    #[test]
    fn test_empty_gen_column_with_observation_fatal() {
        let mut input = smeared_input();
        let n_gen = input.response.n_gen();
        for k_reco in 0..input.response.n_reco() {
            input.response.content[k_reco * n_gen + 8] = 0.0;
        }
        input.sim_reco = Some(input.observed.clone());
        assert_eq!(input.response.reco_bin_of_gen(8), Some(8));
        let err = Unfolder::default().run(&input).unwrap_err();
        assert!(matches!(err, Error::Unfolding(_)), "{err}");
        assert!(err.to_string().contains("gen bin 9"), "{err}");
    }

    #[test]
    fn test_weights_keep_unfolded_yield() {
        let mut input = smeared_input();
        for v in input.observed.content.iter_mut() {
            *v *= 1.25;
        }
        let res = Unfolder::default().run(&input).unwrap();
        let gen_h = input.response.gen_projection("gen").unwrap();
        for k in 0..9 {
            assert_relative_eq!(res.weight_1d.content[k], 1.25, max_relative = 1e-9);
        }
        let reweighted: f64 = res.weight_1d.content.iter().zip(&gen_h.content).map(|(w, g)| w * g).sum();
        assert_relative_eq!(reweighted, res.unfolded.integral(), max_relative = 1e-3);
        assert_relative_eq!(res.unfolded.integral(), 1.25 * gen_h.integral(), max_relative = 1e-9);
    }

    #[test]
    fn test_clipped_weights_spread_the_remainder() {
        let generated = [100.0, 100.0, 100.0, 100.0];
        let unfolded = [300.0, 100.0, 100.0, 100.0];
        let (w, n) = clipped_weights(&unfolded, &generated, &[true; 4], WEIGHT_RANGE);
        assert_eq!(n, 1);
        assert_relative_eq!(w[0], 1.7);
        let reweighted: f64 = w.iter().zip(&generated).map(|(a, b)| a * b).sum();
        assert_relative_eq!(reweighted, 600.0, max_relative = 1e-12);
        assert!(w.iter().all(|v| (0.3..=1.7).contains(v)));

        // nothing to spread over: the range wins
        let (w, n) = clipped_weights(&[500.0, 500.0], &[100.0, 100.0], &[true; 2], WEIGHT_RANGE);
        assert_eq!((w, n), (vec![1.7, 1.7], 2));
        let (w, _) = clipped_weights(&[0.0, 50.0], &[0.0, 100.0], &[false, true], WEIGHT_RANGE);
        assert_eq!(w, vec![1.0, 0.5]);
    }

    #[test]
    fn test_malformed_tensor_is_a_validation_error() {
        let json = r#"{"reco_x_edges":[],"reco_y_edges":[0.0,1.0],"gen_x_edges":[0.0,1.0],"gen_y_edges":[0.0,1.0],"content":[]}"#;
        let mut t: ResponseTensor = serde_json::from_str(json).unwrap();
        assert_eq!(t.n_reco(), 0);
        assert!(matches!(t.check(), Err(Error::Validation(_))));
        assert!(matches!(t.matrix(), Err(Error::Validation(_))));
        t.fill((0.5, 0.5), (0.5, 0.5), 1.0);
        assert_eq!(t.reco_bin_of_gen(0), None);

        let mut input = smeared_input();
        input.response.gen_y_edges = vec![0.0];
        assert!(matches!(Unfolder::default().run(&input), Err(Error::Validation(_))));
    }

    #[test]
    fn test_background_subtraction_and_controls() {
        let mut input = smeared_input();
        let mut bkg = input.observed.clone();
        bkg.name = "bkg".into();
        for v in bkg.content.iter_mut() {
            *v *= 0.5;
        }
        for (o, b) in input.observed.content.iter_mut().zip(&bkg.content) {
            *o += b;
        }
        input.background = Some(bkg);
        let res = Unfolder::default().run(&input).unwrap();
        for k in 0..9 {
            assert_relative_eq!(res.weight_1d.content[k], 1.0, epsilon = 1e-9);
        }
        assert!(res.controls.contains_key("zpt_bkg_reco"));
        let expected = &res.controls["zpt_exp_reco"];
        assert_eq!(expected.name, "zpt_exp_reco");
        assert_relative_eq!(expected.integral(), input.observed.integral(), max_relative = 1e-12);
        assert!(res.controls.contains_key("zpt_obsdy_reco"));
        assert!(res.controls_2d.contains_key("zpt_dy_gen2D"));
    }

    #[test]
    fn test_bin_by_bin() {
        let input = smeared_input();
        let cfg = UnfoldingConfig { method: UnfoldMethod::BinByBin, ..UnfoldingConfig::default() };
        let res = Unfolder::new(cfg).run(&input).unwrap();
        assert_eq!(res.iterations, 0);
        let gen_h = input.response.gen_projection("gen").unwrap();
        for k in 0..9 {
            assert_relative_eq!(res.unfolded.content[k], gen_h.content[k], max_relative = 1e-9);
        }
    }

    #[test]
    fn test_purity_stability() {
        let res = Unfolder::default().run(&smeared_input()).unwrap();
        assert_relative_eq!(res.stability[0], 0.8);
        assert_relative_eq!(res.purity[0], 1.0);
        assert_relative_eq!(res.stability[8], 1.0);
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("bin-by-bin".parse::<UnfoldMethod>().unwrap(), UnfoldMethod::BinByBin);
        assert!(matches!("svd".parse::<UnfoldMethod>(), Err(Error::Config(_))));
    }
}
