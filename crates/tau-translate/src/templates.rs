//! Template builder: fills every (region, process, variation) histogram of
//! one observable and assembles them into a [`ShapeFile`].
//!
//! Work is split into independent fill jobs, one per template. Jobs of a
//! region run on a bounded rayon pool, each re-opening its inputs through the
//! [`EventSource`], and their histograms are put back in the fixed write
//! order afterwards: `data_obs`, signals (each followed by its energy-scale
//! grid), backgrounds, shape variations, grid variations.

use rayon::prelude::*;
use tau_core::{CancelToken, Context, Error, Result};
use tau_hist::{EventSource, Hist1D, HistogramSpec, RegionShapes, ShapeFile, ShapeMeta, fill_histograms};

use crate::config::{AnalysisSetup, Effect, ShiftMode, SystematicSetup, is_signal, join_cuts};
use crate::samples::{SampleArena, SampleId};

const STAGE: &str = "templates";
const QCD: &str = "QCD";

/// Name of the energy-scale shifted template, e.g. `ZTT_TES0.970`.
pub fn tes_template_name(process: &str, value: f64) -> String {
    format!("{process}_TES{value:.3}")
}

/// Input suffix of a shifted input in [`ShiftMode::Suffix`], e.g. `_TES0p970`.
pub fn tes_input_suffix(value: f64) -> String {
    format!("_TES{value:.3}").replace('.', "p")
}

/// Shift value encoded in `<process>_TES<value>`, if `name` is exactly such a template.
pub fn parse_tes_value(name: &str, process: &str) -> Option<f64> {
    let rest = name.strip_prefix(process)?.strip_prefix("_TES")?;
    if rest.contains('_') {
        return None;
    }
    rest.parse().ok()
}

/// Sorted grid with points that print identically (`{:.3}`) merged.
///
/// A non-uniform step is logged: the fit interpolates linearly between
/// neighbouring points, so uneven spacing changes the morphing resolution.
pub fn tes_grid(values: &[f64]) -> Vec<f64> {
    let mut grid: Vec<f64> = values.to_vec();
    grid.sort_by(f64::total_cmp);
    grid.dedup_by(|a, b| format!("{a:.3}") == format!("{b:.3}"));
    if grid.len() > 2 {
        let step = grid[1] - grid[0];
        if grid.windows(2).any(|w| ((w[1] - w[0]) - step).abs() > 1e-6) {
            tracing::warn!(stage = STAGE, n_points = grid.len(), "energy-scale grid has a non-uniform step");
        }
    }
    grid
}

fn rounds_to_one(value: f64) -> bool {
    format!("{value:.3}") == "1.000"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Template,
    QcdData,
    QcdMc,
}

#[derive(Debug, Clone)]
struct FillJob {
    name: String,
    sample: SampleId,
    selection: String,
    role: Role,
    clip: bool,
}

#[derive(Debug, Clone)]
enum Slot {
    Fill(usize),
    Alias { name: String, of: String },
    Qcd,
}

/// Fill plan of one region.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    /// Region name.
    pub region: String,
    /// Full opposite-sign selection.
    pub selection: String,
    jobs: Vec<FillJob>,
    slots: Vec<Slot>,
}

impl RegionPlan {
    /// Template names in write order.
    pub fn template_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| match s {
                Slot::Fill(i) => self.jobs[*i].name.clone(),
                Slot::Alias { name, .. } => name.clone(),
                Slot::Qcd => QCD.to_string(),
            })
            .collect()
    }

    /// Number of histograms that will actually be filled.
    pub fn n_fills(&self) -> usize {
        self.jobs.len()
    }
}

/// Fill plan of one observable.
#[derive(Debug, Clone)]
pub struct TemplatePlan {
    /// Observable name.
    pub observable: String,
    /// Expression filled.
    pub expr: String,
    /// Bin edges shared by every template.
    pub edges: Vec<f64>,
    /// Per-region plans in declared order.
    pub regions: Vec<RegionPlan>,
    arena: SampleArena,
}

/// Builds the shapes file of one observable.
pub struct TemplateBuilder<'a> {
    setup: &'a AnalysisSetup,
    ctx: &'a Context,
    source: &'a dyn EventSource,
    threads: usize,
    cancel: CancelToken,
}

impl<'a> TemplateBuilder<'a> {
    /// Builder over a validated setup.
    pub fn new(setup: &'a AnalysisSetup, ctx: &'a Context, source: &'a dyn EventSource) -> Self {
        Self { setup, ctx, source, threads: 0, cancel: CancelToken::new() }
    }

    /// Worker threads (0 = rayon's default).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Cancellation token polled between regions.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Output file name for `observable`.
    pub fn file_name(&self, observable: &str) -> String {
        ShapeFile::file_name(
            &self.setup.analysis,
            self.ctx.channel.short(),
            observable,
            &self.ctx.era_label(),
            &self.setup.tag,
        )
    }

    /// Work out every template to fill without touching any input.
    pub fn plan(&self, observable: &str) -> Result<TemplatePlan> {
        let setup = self.setup;
        let obs = setup
            .observables
            .get(observable)
            .ok_or_else(|| Error::Config(format!("unknown observable '{observable}'")))?;
        let edges = obs.bin_edges(observable)?;
        let mut arena = SampleArena::from_setup(setup, self.ctx)?;
        let data = arena.require(&setup.samples.data)?;

        let grid = setup.tes_variations.as_ref().map(|t| tes_grid(&t.values)).unwrap_or_default();
        let tes_mode = setup.tes_variations.as_ref().map(|t| t.mode).unwrap_or_default();
        let on_grid = |p: &str| setup.tes_variations.as_ref().is_some_and(|t| t.processes.iter().any(|q| q == p));
        let mc: Vec<&str> = setup
            .processes
            .iter()
            .map(String::as_str)
            .filter(|p| *p != QCD && *p != setup.samples.data)
            .collect();
        let with_qcd = setup.processes.iter().any(|p| p == QCD);

        let mut regions = Vec::with_capacity(setup.regions.len());
        for region in setup.regions.keys() {
            let selection = setup.region_selection(region)?;
            let mut jobs = Vec::new();
            let mut slots = Vec::new();
            let push = |jobs: &mut Vec<FillJob>, slots: &mut Vec<Slot>, name: String, sample: SampleId, role: Role| {
                let clip = role == Role::Template && name != setup.samples.data;
                let sel = if role == Role::Template {
                    selection.clone()
                } else {
                    selection.replace(&setup.qcd.os_cut, &setup.qcd.ss_cut)
                };
                jobs.push(FillJob { name, sample, selection: sel, role, clip });
                if role == Role::Template {
                    slots.push(Slot::Fill(jobs.len() - 1));
                }
            };

            push(&mut jobs, &mut slots, setup.samples.data.clone(), data, Role::Template);

            for p in setup.signals() {
                let id = arena.require(p)?;
                push(&mut jobs, &mut slots, p.to_string(), id, Role::Template);
                if !on_grid(p) {
                    continue;
                }
                for &v in &grid {
                    let name = tes_template_name(p, v);
                    if rounds_to_one(v) {
                        slots.push(Slot::Alias { name, of: p.to_string() });
                        continue;
                    }
                    let shifted = shift_for_grid(&mut arena, id, v, tes_mode);
                    push(&mut jobs, &mut slots, name, shifted, Role::Template);
                }
            }

            for p in setup.backgrounds() {
                if p == QCD {
                    slots.push(Slot::Qcd);
                    continue;
                }
                let id = arena.require(p)?;
                push(&mut jobs, &mut slots, p.to_string(), id, Role::Template);
            }

            if with_qcd {
                if !selection.contains(&setup.qcd.os_cut) {
                    return Err(Error::Config(format!(
                        "region '{region}': selection has no opposite-sign cut '{}' to invert for QCD",
                        setup.qcd.os_cut
                    )));
                }
                push(&mut jobs, &mut slots, format!("{QCD}:ss:{}", setup.samples.data), data, Role::QcdData);
                for p in &mc {
                    let id = arena.require(p)?;
                    push(&mut jobs, &mut slots, format!("{QCD}:ss:{p}"), id, Role::QcdMc);
                }
            }

            let shape_systs = setup.systematics.iter().filter(|(_, s)| s.effect == Effect::Shape);
            let mut grid_variations = Vec::new();
            for (key, sys) in shape_systs {
                let nuisance = sys.nuisance_name(key);
                for p in &mc {
                    if !sys.processes.iter().any(|q| q == p) {
                        continue;
                    }
                    let id = arena.require(p)?;
                    for (var, idx) in ordered_variations(&sys.variations) {
                        let suffix = format!("_{nuisance}{var}");
                        let varied = vary(&mut arena, id, sys, idx, &suffix);
                        push(&mut jobs, &mut slots, format!("{p}{suffix}"), varied, Role::Template);
                        if on_grid(p) {
                            grid_variations.push((p.to_string(), id, key.to_string(), idx, suffix));
                        }
                    }
                }
            }
            for (p, id, key, idx, suffix) in grid_variations {
                let Some(sys) = setup.systematics.get(&key) else { continue };
                for &v in &grid {
                    let name = format!("{}{suffix}", tes_template_name(&p, v));
                    if rounds_to_one(v) {
                        slots.push(Slot::Alias { name, of: format!("{p}{suffix}") });
                        continue;
                    }
                    let shifted = shift_for_grid(&mut arena, id, v, tes_mode);
                    let varied = vary(&mut arena, shifted, sys, idx, &suffix);
                    push(&mut jobs, &mut slots, name, varied, Role::Template);
                }
            }

            regions.push(RegionPlan { region: region.to_string(), selection, jobs, slots });
        }

        Ok(TemplatePlan {
            observable: observable.to_string(),
            expr: obs.expression(observable).to_string(),
            edges,
            regions,
            arena,
        })
    }

    /// Plan and fill every region of `observable`.
    ///
    /// A region whose inputs are missing or whose templates are unusable is
    /// skipped and recorded in the file header; the build fails only if no
    /// region succeeds. Cancellation keeps the regions done so far and marks
    /// the file incomplete.
    pub fn build(&self, observable: &str) -> Result<ShapeFile> {
        let plan = self.plan(observable)?;
        self.execute(&plan)
    }

    /// Fill a previously computed plan.
    pub fn execute(&self, plan: &TemplatePlan) -> Result<ShapeFile> {
        let mut file = ShapeFile::new(ShapeMeta {
            analysis: self.setup.analysis.clone(),
            channel: self.ctx.channel.short().to_string(),
            observable: plan.observable.clone(),
            era: self.ctx.era.clone(),
            tag: self.setup.tag.clone(),
            complete: true,
            skipped: Vec::new(),
        });

        let pool = if self.threads > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.threads)
                    .build()
                    .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?,
            )
        } else {
            None
        };

        for region in &plan.regions {
            if self.cancel.is_cancelled() {
                tracing::warn!(stage = STAGE, region = %region.region, "cancelled, remaining regions not built");
                file.meta.complete = false;
                break;
            }
            tracing::info!(stage = STAGE, region = %region.region, n_fills = region.n_fills(), "filling region");
            let run = || self.fill_region(plan, region);
            let result = match &pool {
                Some(pool) => pool.install(run),
                None => run(),
            };
            match result {
                Ok(shapes) => {
                    shapes.check_binning()?;
                    file.put_region(shapes);
                }
                Err(e) if e.is_region_local() => {
                    tracing::error!(stage = STAGE, region = %region.region, error = %e, "region skipped");
                    file.meta.skipped.push((region.region.clone(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        if file.regions.is_empty() && file.meta.complete {
            return Err(Error::input(STAGE, plan.observable.clone(), "no region could be built"));
        }
        if !file.meta.skipped.is_empty() {
            tracing::warn!(stage = STAGE, skipped = file.meta.skipped.len(), "some regions were skipped");
        }
        Ok(file)
    }

    fn fill_region(&self, plan: &TemplatePlan, region: &RegionPlan) -> Result<RegionShapes> {
        let filled = region
            .jobs
            .par_iter()
            .map(|job| self.fill_job(plan, &region.region, job))
            .collect::<Result<Vec<Hist1D>>>()?;

        let mut shapes = RegionShapes::new(region.region.clone());
        for slot in &region.slots {
            let hist = match slot {
                Slot::Fill(i) => filled[*i].clone(),
                Slot::Alias { name, of } => shapes
                    .get(of)
                    .map(|h| h.renamed(name.clone()))
                    .ok_or_else(|| Error::template(region.region.clone(), format!("{name}: no template '{of}'")))?,
                Slot::Qcd => self.qcd_estimate(&region.region, &region.jobs, &filled)?,
            };
            self.check_template(&region.region, &hist)?;
            shapes.put(hist);
        }
        Ok(shapes)
    }

    fn check_template(&self, region: &str, hist: &Hist1D) -> Result<()> {
        let is_nominal = self.setup.processes.iter().any(|p| *p == hist.name);
        if !is_nominal || hist.name == self.setup.samples.data {
            return Ok(());
        }
        if hist.integral() <= 0.0 {
            if is_signal(&hist.name) {
                return Err(Error::template(region, format!("signal template '{}' is empty", hist.name)));
            }
            tracing::warn!(stage = STAGE, region, process = %hist.name, "empty background template");
        }
        Ok(())
    }

    fn fill_job(&self, plan: &TemplatePlan, region: &str, job: &FillJob) -> Result<Hist1D> {
        let sample = plan.arena.get(job.sample);
        let context = format!("{region}/{}", job.name);
        let mut total = Hist1D::new(job.name.clone(), plan.edges.clone())?;
        for c in &sample.components {
            if !self.source.exists(&c.input) {
                return Err(Error::input(STAGE, context, format!("missing input '{}'", c.input)));
            }
            let mut table = self.source.open(&c.input)?;
            if sample.scale != 1.0 {
                let branches = self.setup.tes_variations.as_ref().map(|t| t.branches.as_slice()).unwrap_or(&[]);
                table = table.scaled(branches, sample.scale)?;
            }
            let selection = join_cuts(&job.selection, &c.cut);
            let spec =
                HistogramSpec::new(job.name.clone(), &plan.expr, &selection, &c.weight.to_expr(), plan.edges.clone())
                    .map_err(|e| Error::input(STAGE, context.clone(), e.to_string()))?;
            let filled = fill_histograms(std::slice::from_ref(&spec), &table)?;
            for f in &filled {
                if f.negative_weight_entries > 0 {
                    tracing::debug!(stage = STAGE, region, process = %job.name, input = %c.input,
                        n = f.negative_weight_entries, "negative-weight entries");
                }
                total.add_scaled(&f.histogram, c.norm)?;
            }
        }
        if job.clip && !sample.is_data {
            let n = total.clip_negative();
            if n > 0 {
                tracing::warn!(stage = STAGE, region, process = %job.name, bins = n, "clipped negative bins");
            }
        }
        Ok(total)
    }

    fn qcd_estimate(&self, region: &str, jobs: &[FillJob], filled: &[Hist1D]) -> Result<Hist1D> {
        let mut qcd: Option<Hist1D> = None;
        for (job, hist) in jobs.iter().zip(filled) {
            if job.role == Role::QcdData {
                qcd = Some(hist.renamed(QCD));
            }
        }
        let mut qcd = qcd.ok_or_else(|| Error::template(region, "no same-sign data for QCD"))?;
        for (job, hist) in jobs.iter().zip(filled) {
            if job.role == Role::QcdMc {
                qcd.subtract(hist)?;
            }
        }
        qcd.scale(self.setup.qcd.ratio);
        let n = qcd.clip_negative();
        if n > 0 {
            tracing::warn!(stage = STAGE, region, process = QCD, bins = n, "clipped negative QCD bins");
        }
        Ok(qcd)
    }
}

fn shift_for_grid(arena: &mut SampleArena, id: SampleId, value: f64, mode: ShiftMode) -> SampleId {
    let name_suffix = format!("_TES{value:.3}");
    match mode {
        ShiftMode::Suffix => arena.shift(id, &tes_input_suffix(value), &name_suffix, 1.0),
        ShiftMode::Scale => arena.shift(id, "", &name_suffix, value),
    }
}

fn vary(arena: &mut SampleArena, id: SampleId, sys: &SystematicSetup, idx: usize, suffix: &str) -> SampleId {
    let mut out = id;
    if let Some(append) = sys.sample_append.get(idx) {
        out = arena.shift(out, append, "", 1.0);
    }
    if let Some(alt) = sys.alt_weights.get(idx) {
        out = arena.reweight(out, &sys.nom_weight, alt, suffix);
    }
    out
}

/// `(variation, index)` with `Up` first.
fn ordered_variations(variations: &[String]) -> Vec<(&str, usize)> {
    ["Up", "Down"]
        .into_iter()
        .filter_map(|v| variations.iter().position(|x| x == v).map(|i| (v, i)))
        .collect()
}

/// Integrity of one shape nuisance on one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeCheck {
    /// Region.
    pub region: String,
    /// Process.
    pub process: String,
    /// Nuisance.
    pub nuisance: String,
    /// Nominal integral.
    pub nominal: f64,
    /// Up integral (`None` if the template is missing).
    pub up: Option<f64>,
    /// Down integral.
    pub down: Option<f64>,
    /// Up/Down bracket the nominal in at least one bin.
    pub brackets: bool,
}

impl ShapeCheck {
    /// `|∫var − ∫nom| / ∫nom`, infinite for a missing template or empty nominal.
    pub fn relative(&self, var: Option<f64>) -> f64 {
        match var {
            Some(v) if self.nominal > 0.0 => (v - self.nominal).abs() / self.nominal,
            _ => f64::INFINITY,
        }
    }

    /// Whether either variation has zero integral (the nuisance is dropped for this process).
    pub fn has_empty_variation(&self) -> bool {
        self.up.is_some_and(|v| v == 0.0) || self.down.is_some_and(|v| v == 0.0)
    }

    /// Both templates present, relative shifts at most 1, and bracketing.
    pub fn passed(&self) -> bool {
        self.relative(self.up) <= 1.0 && self.relative(self.down) <= 1.0 && self.brackets
    }
}

/// Check every `<process>_<nuisance>Up/Down` pair found in a shapes file.
///
/// Variations are discovered from the names: any template `<P>_<N>Up` or
/// `<P>_<N>Down` where `<P>` is another template of the region. The longest
/// matching `<P>` wins, so grid variations (`ZTT_TES0.970_<N>Up`) are checked
/// against their own shifted nominal.
pub fn check_shapes(file: &ShapeFile) -> Vec<ShapeCheck> {
    let mut out = Vec::new();
    for region in &file.regions {
        let mut seen: Vec<(String, String)> = Vec::new();
        for h in &region.histograms {
            let Some(stem) = h.name.strip_suffix("Up").or_else(|| h.name.strip_suffix("Down")) else {
                continue;
            };
            let Some(process) = region
                .names()
                .filter(|p| stem.len() > p.len() + 1 && stem.starts_with(p) && stem[p.len()..].starts_with('_'))
                .max_by_key(|p| p.len())
            else {
                continue;
            };
            let nuisance = stem[process.len() + 1..].to_string();
            let key = (process.to_string(), nuisance.clone());
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let Some(nom) = region.get(process) else { continue };
            let up = region.get(&format!("{process}_{nuisance}Up"));
            let down = region.get(&format!("{process}_{nuisance}Down"));
            let brackets = match (up, down) {
                (Some(u), Some(d)) => (0..nom.n_bins()).any(|i| {
                    let (lo, hi) = (u.content[i].min(d.content[i]), u.content[i].max(d.content[i]));
                    lo <= nom.content[i] && nom.content[i] <= hi
                }),
                _ => false,
            };
            out.push(ShapeCheck {
                region: region.name.clone(),
                process: process.to_string(),
                nuisance,
                nominal: nom.integral(),
                up: up.map(Hist1D::integral),
                down: down.map(Hist1D::integral),
                brackets,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{SETUP, setup};
    use approx::assert_relative_eq;
    use tau_core::Channel;
    use tau_hist::{ColumnTable, MemorySource};

    fn table(name: &str, n: usize, genmatch: f64) -> ColumnTable {
        let m2: Vec<f64> = (0..n).map(|i| 0.1 + 1.8 * i as f64 / n as f64).collect();
        let cols = vec![
            ("m_2".to_string(), m2),
            ("q_1".to_string(), (0..n).map(|_| 1.0).collect()),
            ("q_2".to_string(), (0..n).map(|i| if i % 4 == 0 { 1.0 } else { -1.0 }).collect()),
            ("iso_1".to_string(), vec![0.05; n]),
            ("dm_2".to_string(), (0..n).map(|i| (i % 2) as f64).collect()),
            ("genmatch_2".to_string(), vec![genmatch; n]),
            ("genweight".to_string(), vec![1.0; n]),
            ("zptweight".to_string(), vec![1.2; n]),
        ];
        ColumnTable::from_columns(name, cols).unwrap()
    }

    fn source() -> MemorySource {
        let mut src = MemorySource::new();
        src.insert("SingleMuon", table("SingleMuon", 400, 0.0));
        src.insert("DYJets", table("DYJets", 200, 5.0));
        src.insert("TTTo2L2Nu", table("TTTo2L2Nu", 40, 0.0));
        src.insert("WW", table("WW", 20, 0.0));
        src.insert("WZ", table("WZ", 20, 0.0));
        src
    }

    fn ctx() -> Context {
        Context::new("UL2018", 59.5, Channel::Mt)
    }

    #[test]
    fn grid_merges_points_printing_the_same() {
        let values: Vec<f64> = (0..=60).map(|i| 0.94 + 0.002 * i as f64).collect();
        let grid = tes_grid(&values);
        assert_eq!(grid.len(), 61);
        assert_eq!(grid.iter().filter(|v| rounds_to_one(**v)).count(), 1);
        assert_eq!(tes_grid(&[1.0, 1.0004, 0.99]).len(), 2);
    }

    #[test]
    fn tes_names_round_trip() {
        assert_eq!(tes_template_name("ZTT", 0.97), "ZTT_TES0.970");
        assert_eq!(tes_input_suffix(0.97), "_TES0p970");
        assert_eq!(parse_tes_value("ZTT_TES1.020", "ZTT"), Some(1.02));
        assert_eq!(parse_tes_value("ZTT_TES1.020_shape_dyUp", "ZTT"), None);
        assert_eq!(parse_tes_value("ZTTX_TES1.020", "ZTT"), None);
    }

    #[test]
    fn plan_orders_templates() {
        let setup = setup();
        let ctx = ctx();
        let src = source();
        let plan = TemplateBuilder::new(&setup, &ctx, &src).plan("m_2").unwrap();
        let names = plan.regions[0].template_names();
        assert_eq!(&names[..7], ["data_obs", "ZTT", "ZTT_TES0.980", "ZTT_TES0.990", "ZTT_TES1.000", "ZTT_TES1.010", "ZTT_TES1.020"]);
        assert_eq!(&names[7..12], ["ZL", "ZJ", "TTT", "VV", "QCD"]);
        assert_eq!(&names[12..16], ["ZTT_shape_dyUp", "ZTT_shape_dyDown", "ZL_shape_dyUp", "ZL_shape_dyDown"]);
        assert_eq!(names[16], "ZTT_TES0.980_shape_dyUp");
        assert_eq!(names.len(), 16 + 2 * 5);
    }

    #[test]
    fn build_fills_every_region() {
        let setup = setup();
        let ctx = ctx();
        let src = source();
        let file = TemplateBuilder::new(&setup, &ctx, &src).threads(2).build("m_2").unwrap();
        assert!(file.meta.complete);
        assert_eq!(file.regions.len(), 2);
        let dm0 = file.region("DM0").unwrap();
        assert!(dm0.get("ZTT").unwrap().integral() > 0.0);
        assert_eq!(dm0.get("ZTT_TES1.000").unwrap().content, dm0.get("ZTT").unwrap().content);
        assert!(dm0.get("QCD").unwrap().content.iter().all(|c| *c >= 0.0));
        let up = dm0.get("ZTT_shape_dyUp").unwrap().integral();
        let nom = dm0.get("ZTT").unwrap().integral();
        assert_relative_eq!(up / nom, 1.2, epsilon = 1e-9);
        assert!(check_shapes(&file).iter().filter(|c| c.nuisance == "shape_dy").all(|c| c.up.is_some() && c.down.is_some()));
    }

    #[test]
    fn scale_mode_shifts_the_observable() {
        let setup = setup();
        let ctx = ctx();
        let src = source();
        let file = TemplateBuilder::new(&setup, &ctx, &src).build("m_2").unwrap();
        let dm1 = file.region("DM1").unwrap();
        let mean = |h: &Hist1D| {
            let centres: Vec<f64> = h.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
            centres.iter().zip(&h.content).map(|(c, v)| c * v).sum::<f64>() / h.integral()
        };
        assert!(mean(dm1.get("ZTT_TES1.020").unwrap()) >= mean(dm1.get("ZTT_TES0.980").unwrap()));
    }

    #[test]
    fn missing_input_fails_when_no_region_survives() {
        let setup = setup();
        let ctx = ctx();
        let full = source();
        let mut src = MemorySource::new();
        for name in ["SingleMuon", "TTTo2L2Nu", "WW", "WZ"] {
            src.insert(name, full.open(name).unwrap());
        }
        let err = TemplateBuilder::new(&setup, &ctx, &src).build("m_2").unwrap_err();
        assert!(matches!(err, Error::Input { .. }));
    }

    #[test]
    fn cancelled_build_is_incomplete() {
        let setup = setup();
        let ctx = ctx();
        let src = source();
        let token = CancelToken::new();
        token.cancel();
        let file = TemplateBuilder::new(&setup, &ctx, &src).cancel_token(token).build("m_2").unwrap();
        assert!(!file.meta.complete);
        assert!(file.regions.is_empty());
    }

    #[test]
    fn qcd_without_os_cut_is_config_error() {
        let text = SETUP.replace("baselineCuts: \"q_1*q_2<0 && iso_1<0.15\"", "baselineCuts: \"iso_1<0.15\"");
        let setup = AnalysisSetup::from_yaml_str(&text).unwrap();
        let ctx = ctx();
        let src = source();
        let err = TemplateBuilder::new(&setup, &ctx, &src).plan("m_2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn shape_check_flags_large_shifts() {
        let mut region = RegionShapes::new("DM0");
        let edges = vec![0.0, 1.0, 2.0];
        region.put(Hist1D::from_content("ZTT", edges.clone(), vec![10.0, 10.0], None).unwrap());
        region.put(Hist1D::from_content("ZTT_xUp", edges.clone(), vec![11.0, 9.5], None).unwrap());
        region.put(Hist1D::from_content("ZTT_xDown", edges.clone(), vec![9.0, 10.5], None).unwrap());
        region.put(Hist1D::from_content("ZTT_yUp", edges.clone(), vec![30.0, 30.0], None).unwrap());
        region.put(Hist1D::from_content("ZTT_yDown", edges, vec![0.0, 0.0], None).unwrap());
        let mut file = ShapeFile::default();
        file.put_region(region);
        let checks = check_shapes(&file);
        assert_eq!(checks.len(), 2);
        assert!(checks[0].passed());
        assert!(!checks[1].passed());
        assert!(checks[1].has_empty_variation());
    }
}
