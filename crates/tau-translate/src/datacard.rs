//! Combine-style text datacards: model, assembly from a region's templates,
//! writing, parsing and combination.
//!
//! The energy-scale POI is a `rateParam` named `tes_<region>` on a process
//! whose `shapes` line uses the `$MASS` key (`DM0/ZTT_TES$MASS`); such a
//! parameter selects among the shifted templates instead of scaling the
//! normalization.

use std::collections::HashSet;
use std::fmt::Write as _;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};
use tau_hist::RegionShapes;

use crate::config::{AnalysisSetup, Effect, is_signal};
use crate::templates::parse_tes_value;

const STAGE: &str = "datacard";
const SEPARATOR: &str =
    "----------------------------------------------------------------------------------------------------";

/// Key substituted with the grid value in a `shapes` pattern.
pub const MASS_KEY: &str = "$MASS";

/// `shapes <process> <bin> <file> <nominal> <systematic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapesLine {
    /// Process or `*`.
    pub process: String,
    /// Bin or `*`.
    pub bin: String,
    /// Shapes file.
    pub file: String,
    /// Nominal histogram pattern (`$PROCESS`, `$MASS`).
    pub nominal: String,
    /// Variation pattern (`$SYSTEMATIC`).
    pub systematic: String,
}

impl ShapesLine {
    /// Whether the line applies to `(bin, process)`.
    pub fn matches(&self, bin: &str, process: &str) -> bool {
        (self.bin == "*" || self.bin == bin) && (self.process == "*" || self.process == process)
    }

    /// Histogram path of the nominal template, `$MASS` replaced by `mass`.
    pub fn nominal_path(&self, bin: &str, process: &str, mass: Option<&str>) -> String {
        expand(&self.nominal, bin, process, "", mass)
    }

    /// Histogram path of a variation (`nuisance` followed by `Up`/`Down`).
    pub fn systematic_path(&self, bin: &str, process: &str, systematic: &str, mass: Option<&str>) -> String {
        expand(&self.systematic, bin, process, systematic, mass)
    }

    /// Whether the patterns use the grid key.
    pub fn is_morphed(&self) -> bool {
        self.nominal.contains(MASS_KEY)
    }
}

fn expand(pattern: &str, bin: &str, process: &str, systematic: &str, mass: Option<&str>) -> String {
    let mut s = pattern.replace("$BIN", bin).replace("$PROCESS", process).replace("$SYSTEMATIC", systematic);
    if let Some(m) = mass {
        s = s.replace(MASS_KEY, m);
    }
    s
}

/// One `bin`/`process`/`rate` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessColumn {
    /// Bin name.
    pub bin: String,
    /// Process name.
    pub process: String,
    /// Integer process ID (`<= 0` for signals).
    pub id: i32,
    /// Nominal yield.
    pub rate: f64,
}

/// Effect of a table nuisance on one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EffectValue {
    /// Symmetric kappa (lnN) or shape scale.
    Sym(f64),
    /// Asymmetric lnN `kappa_down/kappa_up`.
    Asym(f64, f64),
}

impl EffectValue {
    fn render(&self) -> String {
        match self {
            EffectValue::Sym(v) => v.to_string(),
            EffectValue::Asym(lo, hi) => format!("{lo}/{hi}"),
        }
    }

    fn parse(s: &str) -> Option<Option<EffectValue>> {
        if s == "-" {
            return Some(None);
        }
        match s.split_once('/') {
            Some((lo, hi)) => Some(Some(EffectValue::Asym(lo.parse().ok()?, hi.parse().ok()?))),
            None => Some(Some(EffectValue::Sym(s.parse().ok()?))),
        }
    }
}

/// Table row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    /// Log-normal normalization.
    LnN,
    /// Template morphing.
    Shape,
}

impl RowKind {
    fn as_str(&self) -> &'static str {
        match self {
            RowKind::LnN => "lnN",
            RowKind::Shape => "shape",
        }
    }
}

/// A row of the nuisance table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NuisanceRow {
    /// Nuisance name.
    pub name: String,
    /// Row type.
    pub kind: RowKind,
    /// One entry per process column, `None` for `-`.
    pub effects: Vec<Option<EffectValue>>,
}

/// `<name> rateParam <bin> <process> <init> [lo,hi]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateParam {
    /// Parameter name.
    pub name: String,
    /// Bin or `*`.
    pub bin: String,
    /// Process or `*`.
    pub process: String,
    /// Initial value.
    pub init: f64,
    /// Optional range.
    pub range: Option<(f64, f64)>,
}

impl RateParam {
    /// Whether the parameter applies to `(bin, process)`.
    pub fn matches(&self, bin: &str, process: &str) -> bool {
        (self.bin == "*" || self.bin == bin) && (self.process == "*" || self.process == process)
    }
}

/// `<name> param <mean> <sigma>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamLine {
    /// Parameter name.
    pub name: String,
    /// Constraint mean.
    pub mean: f64,
    /// Constraint width.
    pub sigma: f64,
}

/// `<bin> autoMCStats <threshold> <include_signal> <hist_mode>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMcStats {
    /// Bin or `*`.
    pub bin: String,
    /// Effective-event threshold.
    pub threshold: u32,
    /// Whether signal counts toward the per-bin yield.
    pub include_signal: u32,
    /// Hist mode.
    pub hist_mode: u32,
}

/// A parsed or assembled datacard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datacard {
    /// `shapes` lines, most specific last.
    pub shapes: Vec<ShapesLine>,
    /// `(bin, observation)`.
    pub observations: Vec<(String, f64)>,
    /// Process columns.
    pub columns: Vec<ProcessColumn>,
    /// lnN and shape rows.
    pub nuisances: Vec<NuisanceRow>,
    /// Rate parameters.
    pub rate_params: Vec<RateParam>,
    /// Gaussian constraints.
    pub params: Vec<ParamLine>,
    /// Bin-by-bin statistics directives.
    pub auto_mc_stats: Vec<AutoMcStats>,
    /// Nuisance groups.
    pub groups: Vec<(String, Vec<String>)>,
}

impl Datacard {
    /// Bin names in order.
    pub fn bins(&self) -> Vec<&str> {
        self.observations.iter().map(|(b, _)| b.as_str()).collect()
    }

    /// Distinct process names in column order.
    pub fn processes(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for c in &self.columns {
            if !out.contains(&c.process.as_str()) {
                out.push(&c.process);
            }
        }
        out
    }

    /// The `shapes` line used for `(bin, process)`: the last matching one
    /// with an explicit process wins over wildcards.
    pub fn shapes_for(&self, bin: &str, process: &str) -> Option<&ShapesLine> {
        let matching = || self.shapes.iter().filter(|s| s.matches(bin, process));
        matching().filter(|s| s.process != "*").last().or_else(|| matching().last())
    }

    /// The grid parameter morphing `(bin, process)`, if any.
    pub fn morph_parameter(&self, bin: &str, process: &str) -> Option<&RateParam> {
        if !self.shapes_for(bin, process).is_some_and(ShapesLine::is_morphed) {
            return None;
        }
        self.rate_params.iter().find(|r| r.name.starts_with("tes") && r.matches(bin, process))
    }

    /// Rate parameters scaling the normalization of `(bin, process)`.
    pub fn norm_parameters(&self, bin: &str, process: &str) -> Vec<&RateParam> {
        let morph = self.morph_parameter(bin, process).map(|r| r.name.as_str());
        self.rate_params.iter().filter(|r| r.matches(bin, process) && Some(r.name.as_str()) != morph).collect()
    }

    /// Names of every floating parameter: table rows, then rate parameters, deduplicated.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.nuisances
            .iter()
            .map(|n| n.name.clone())
            .chain(self.rate_params.iter().map(|r| r.name.clone()))
            .filter(|n| seen.insert(n.clone()))
            .collect()
    }

    /// Render the card text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let n_proc = self.processes().len();
        let _ = writeln!(out, "imax {} number of bins", self.observations.len());
        let _ = writeln!(out, "jmax {} number of processes minus 1", n_proc.saturating_sub(1));
        let _ = writeln!(out, "kmax * number of nuisance parameters");
        let _ = writeln!(out, "{SEPARATOR}");
        for s in &self.shapes {
            let _ = writeln!(out, "shapes {} {} {} {} {}", s.process, s.bin, s.file, s.nominal, s.systematic);
        }
        let _ = writeln!(out, "{SEPARATOR}");

        let label = self.nuisances.iter().map(|n| n.name.len()).max().unwrap_or(0).max("observation".len());
        let kind = "shape".len();
        let head = label + 1 + kind;
        let obs_cells: Vec<String> = self.observations.iter().map(|(_, v)| v.to_string()).collect();
        let obs_bins: Vec<String> = self.observations.iter().map(|(b, _)| b.clone()).collect();
        let w = obs_cells.iter().chain(&obs_bins).map(String::len).max().unwrap_or(0) + 1;
        let _ = writeln!(out, "{}", row(&format!("{:<head$}", "bin"), &obs_bins, w));
        let _ = writeln!(out, "{}", row(&format!("{:<head$}", "observation"), &obs_cells, w));
        let _ = writeln!(out, "{SEPARATOR}");

        let bins: Vec<String> = self.columns.iter().map(|c| c.bin.clone()).collect();
        let names: Vec<String> = self.columns.iter().map(|c| c.process.clone()).collect();
        let ids: Vec<String> = self.columns.iter().map(|c| c.id.to_string()).collect();
        let rates: Vec<String> = self.columns.iter().map(|c| c.rate.to_string()).collect();
        let effects: Vec<Vec<String>> = self
            .nuisances
            .iter()
            .map(|n| n.effects.iter().map(|e| e.map_or("-".to_string(), |e| e.render())).collect())
            .collect();
        let w = [&bins, &names, &ids, &rates]
            .into_iter()
            .chain(effects.iter())
            .flat_map(|v| v.iter().map(String::len))
            .max()
            .unwrap_or(0)
            + 1;
        for (key, cells) in [("bin", &bins), ("process", &names), ("process", &ids), ("rate", &rates)] {
            let _ = writeln!(out, "{}", row(&format!("{key:<head$}"), cells, w));
        }
        let _ = writeln!(out, "{SEPARATOR}");
        for (n, cells) in self.nuisances.iter().zip(&effects) {
            let lead = format!("{:<label$} {:<kind$}", n.name, n.kind.as_str());
            let _ = writeln!(out, "{}", row(&lead, cells, w));
        }
        for r in &self.rate_params {
            let range = r.range.map(|(lo, hi)| format!(" [{lo},{hi}]")).unwrap_or_default();
            let _ = writeln!(out, "{} rateParam {} {} {}{range}", r.name, r.bin, r.process, r.init);
        }
        for p in &self.params {
            let _ = writeln!(out, "{} param {} {}", p.name, p.mean, p.sigma);
        }
        for a in &self.auto_mc_stats {
            let _ = writeln!(out, "{} autoMCStats {} {} {}", a.bin, a.threshold, a.include_signal, a.hist_mode);
        }
        for (g, members) in &self.groups {
            let _ = writeln!(out, "{g} group = {}", members.join(" "));
        }
        out
    }

    /// Parse card text.
    pub fn parse(text: &str) -> Result<Datacard> {
        let mut card = Datacard::default();
        let mut col_bins: Vec<String> = Vec::new();
        let mut obs_bins: Option<Vec<String>> = None;
        let mut names: Vec<String> = Vec::new();
        let mut ids: Vec<i32> = Vec::new();
        let mut rates: Vec<f64> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let err = |msg: String| Error::input(STAGE, format!("line {}", lineno + 1), msg);
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("---") {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let num = |s: &str| s.parse::<f64>().map_err(|_| err(format!("expected a number, got '{s}'")));
            match tokens[0] {
                "imax" | "jmax" | "kmax" => {}
                "shapes" => {
                    let [_, process, bin, file, nominal, rest @ ..] = tokens.as_slice() else {
                        return Err(err("shapes line needs process, bin, file and pattern".into()));
                    };
                    card.shapes.push(ShapesLine {
                        process: process.to_string(),
                        bin: bin.to_string(),
                        file: file.to_string(),
                        nominal: nominal.to_string(),
                        systematic: rest.first().map(|s| s.to_string()).unwrap_or_default(),
                    });
                }
                "bin" if obs_bins.is_none() => obs_bins = Some(tokens[1..].iter().map(|s| s.to_string()).collect()),
                "bin" => col_bins = tokens[1..].iter().map(|s| s.to_string()).collect(),
                "observation" => {
                    let bins = obs_bins.clone().ok_or_else(|| err("observation before bin".into()))?;
                    let values = tokens[1..].iter().map(|s| num(s)).collect::<Result<Vec<_>>>()?;
                    if values.len() != bins.len() {
                        return Err(err(format!("{} observations for {} bins", values.len(), bins.len())));
                    }
                    card.observations = bins.into_iter().zip(values).collect();
                }
                "process" if names.is_empty() => names = tokens[1..].iter().map(|s| s.to_string()).collect(),
                "process" => {
                    ids = tokens[1..]
                        .iter()
                        .map(|s| s.parse::<i32>().map_err(|_| err(format!("bad process id '{s}'"))))
                        .collect::<Result<_>>()?;
                }
                "rate" => rates = tokens[1..].iter().map(|s| num(s)).collect::<Result<_>>()?,
                _ if tokens.len() >= 2 => match tokens[1] {
                    "lnN" | "shape" => {
                        let kind = if tokens[1] == "lnN" { RowKind::LnN } else { RowKind::Shape };
                        let effects = tokens[2..]
                            .iter()
                            .map(|s| EffectValue::parse(s).ok_or_else(|| err(format!("bad effect '{s}'"))))
                            .collect::<Result<Vec<_>>>()?;
                        card.nuisances.push(NuisanceRow { name: tokens[0].to_string(), kind, effects });
                    }
                    "rateParam" => {
                        let [name, _, bin, process, init, rest @ ..] = tokens.as_slice() else {
                            return Err(err("rateParam needs bin, process and initial value".into()));
                        };
                        let range = match rest.first() {
                            Some(r) => {
                                let inner = r.trim_start_matches('[').trim_end_matches(']');
                                let (lo, hi) =
                                    inner.split_once(',').ok_or_else(|| err(format!("bad range '{r}'")))?;
                                Some((num(lo)?, num(hi)?))
                            }
                            None => None,
                        };
                        card.rate_params.push(RateParam {
                            name: name.to_string(),
                            bin: bin.to_string(),
                            process: process.to_string(),
                            init: num(*init)?,
                            range,
                        });
                    }
                    "param" => {
                        let [name, _, mean, sigma, ..] = tokens.as_slice() else {
                            return Err(err("param needs mean and sigma".into()));
                        };
                        card.params.push(ParamLine { name: name.to_string(), mean: num(*mean)?, sigma: num(*sigma)? });
                    }
                    "autoMCStats" => {
                        let int = |i: usize, default: u32| -> Result<u32> {
                            match tokens.get(i) {
                                Some(s) => s.parse().map_err(|_| err(format!("bad autoMCStats field '{s}'"))),
                                None => Ok(default),
                            }
                        };
                        card.auto_mc_stats.push(AutoMcStats {
                            bin: tokens[0].to_string(),
                            threshold: int(2, 0)?,
                            include_signal: int(3, 0)?,
                            hist_mode: int(4, 1)?,
                        });
                    }
                    "group" => {
                        if tokens.get(2) != Some(&"=") {
                            return Err(err("group line needs '='".into()));
                        }
                        card.groups
                            .push((tokens[0].to_string(), tokens[3..].iter().map(|s| s.to_string()).collect()));
                    }
                    other => return Err(err(format!("unsupported directive '{other}'"))),
                },
                other => return Err(err(format!("unexpected line starting with '{other}'"))),
            }
        }

        let n = col_bins.len();
        if names.len() != n || ids.len() != n || rates.len() != n {
            return Err(Error::input(
                STAGE,
                "columns",
                format!("bin/process/rate rows disagree: {n}, {}, {}, {}", names.len(), ids.len(), rates.len()),
            ));
        }
        card.columns = (0..n)
            .map(|i| ProcessColumn { bin: col_bins[i].clone(), process: names[i].clone(), id: ids[i], rate: rates[i] })
            .collect();
        for row in &card.nuisances {
            if row.effects.len() != n {
                return Err(Error::input(
                    STAGE,
                    row.name.clone(),
                    format!("{} effects for {n} process columns", row.effects.len()),
                ));
            }
        }
        Ok(card)
    }

    /// Read a card from disk.
    pub fn read(path: &std::path::Path) -> Result<Datacard> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::input(STAGE, path.display().to_string(), e.to_string()))?;
        Datacard::parse(&text)
    }

    /// Write the card, creating the parent directory.
    pub fn write(&self, path: &std::path::Path) -> Result<()> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

fn row(lead: &str, cells: &[String], width: usize) -> String {
    let mut s = lead.to_string();
    for c in cells {
        let _ = write!(s, " {c:<width$}");
    }
    s.trim_end().to_string()
}

/// Combine several cards into one. Bin names are kept and must be unique;
/// table rows with the same name become one row.
pub fn combine_cards(cards: &[Datacard]) -> Result<Datacard> {
    let mut out = Datacard::default();
    let mut bins = HashSet::new();
    for card in cards {
        for (bin, _) in &card.observations {
            if !bins.insert(bin.clone()) {
                return Err(Error::Validation(format!("duplicate bin name '{bin}' in combined datacard")));
            }
        }
        let offset = out.columns.len();
        let width = card.columns.len();
        for row in &mut out.nuisances {
            row.effects.extend(std::iter::repeat_n(None, width));
        }
        for row in &card.nuisances {
            match out.nuisances.iter_mut().find(|r| r.name == row.name) {
                Some(existing) => {
                    if existing.kind != row.kind {
                        return Err(Error::Validation(format!(
                            "nuisance '{}' is {} in one card and {} in another",
                            row.name,
                            existing.kind.as_str(),
                            row.kind.as_str()
                        )));
                    }
                    existing.effects[offset..].copy_from_slice(&row.effects);
                }
                None => {
                    let mut effects = vec![None; offset];
                    effects.extend_from_slice(&row.effects);
                    out.nuisances.push(NuisanceRow { name: row.name.clone(), kind: row.kind, effects });
                }
            }
        }
        out.shapes.extend(card.shapes.iter().cloned());
        out.observations.extend(card.observations.iter().cloned());
        out.columns.extend(card.columns.iter().cloned());
        for r in &card.rate_params {
            if !out.rate_params.contains(r) {
                out.rate_params.push(r.clone());
            }
        }
        for p in &card.params {
            match out.params.iter().find(|q| q.name == p.name) {
                Some(q) if q != p => {
                    return Err(Error::Validation(format!("conflicting constraints for '{}'", p.name)));
                }
                Some(_) => {}
                None => out.params.push(p.clone()),
            }
        }
        out.auto_mc_stats.extend(card.auto_mc_stats.iter().cloned());
        for (g, members) in &card.groups {
            match out.groups.iter_mut().find(|(name, _)| name == g) {
                Some((_, existing)) => {
                    for m in members {
                        if !existing.contains(m) {
                            existing.push(m.clone());
                        }
                    }
                }
                None => out.groups.push((g.clone(), members.clone())),
            }
        }
    }
    Ok(out)
}

/// Name of the energy-scale POI of `region`.
///
/// With `tesRegions`, the region itself or one of its `_`-separated tokens
/// must be listed; without it, the first token is used.
pub fn tes_parameter(setup: &AnalysisSetup, region: &str) -> Result<String> {
    if setup.tes_regions.is_empty() {
        return Ok(format!("tes_{}", region.split('_').next().unwrap_or(region)));
    }
    lookup_region(&setup.tes_regions.0.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), region)
        .map(|k| format!("tes_{k}"))
        .ok_or_else(|| Error::Config(format!("region '{region}' matches no entry of tesRegions")))
}

/// Name of the identification scale-factor parameter of `region`.
///
/// Without `tid_SFRegions` a single-token region uses that token and a
/// composite one (`DM0_pt1`) its second token.
pub fn tid_parameter(setup: &AnalysisSetup, region: &str) -> Result<String> {
    if setup.tid_sf_regions.is_empty() {
        let tokens: Vec<&str> = region.split('_').collect();
        let key = if tokens.len() > 1 { tokens[1] } else { tokens[0] };
        return Ok(format!("tid_SF_{key}"));
    }
    lookup_region(&setup.tid_sf_regions.0.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), region)
        .map(|k| format!("tid_SF_{k}"))
        .ok_or_else(|| Error::Config(format!("region '{region}' matches no entry of tid_SFRegions")))
}

fn lookup_region<'a>(keys: &[&'a str], region: &str) -> Option<&'a str> {
    keys.iter()
        .copied()
        .find(|k| *k == region)
        .or_else(|| region.split('_').find_map(|tok| keys.iter().copied().find(|k| *k == tok)))
}

/// Standard nuisance groups. A leading `!` negates a pattern.
pub fn default_groups() -> Vec<(String, Vec<String>)> {
    [
        ("all", ".*"),
        ("sys", "!.*_bin.*"),
        ("bin", ".*_bin.*"),
        ("lumi", ".*lumi.*"),
        ("eff", ".*eff.*"),
        ("jtf", ".*jTauFake.*"),
        ("ltf", ".*mTauFake.*"),
        ("zpt", ".*shape_dy.*"),
        ("xsec", ".*[Xx]sec.*"),
        ("norm", ".*(lumi|Xsec|xsec|Norm|norm_qcd).*"),
        ("tid", ".*tid.*"),
        ("tes", ".*tes.*"),
    ]
    .into_iter()
    .map(|(g, p)| (g.to_string(), vec![p.to_string()]))
    .collect()
}

/// Resolve group patterns against parameter names; empty groups are dropped.
pub fn resolve_groups(groups: &[(String, Vec<String>)], names: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    let mut out = Vec::new();
    for (group, patterns) in groups {
        let compiled = patterns
            .iter()
            .map(|p| {
                let (negate, body) = match p.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, p.as_str()),
                };
                Regex::new(&format!("^(?:{body})$"))
                    .map(|re| (negate, re))
                    .map_err(|e| Error::Config(format!("group '{group}': invalid pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let members: Vec<String> = names
            .iter()
            .filter(|n| compiled.iter().any(|(neg, re)| re.is_match(n) != *neg))
            .cloned()
            .collect();
        if !members.is_empty() {
            out.push((group.clone(), members));
        }
    }
    Ok(out)
}

/// Assembles per-region datacards from a setup and the region's templates.
pub struct DatacardBuilder<'a> {
    setup: &'a AnalysisSetup,
    shapes_file: String,
}

impl<'a> DatacardBuilder<'a> {
    /// Builder writing `shapes_file` into the `shapes` lines.
    pub fn new(setup: &'a AnalysisSetup, shapes_file: impl Into<String>) -> Self {
        Self { setup, shapes_file: shapes_file.into() }
    }

    /// Card of one region.
    pub fn build(&self, shapes: &RegionShapes) -> Result<Datacard> {
        let setup = self.setup;
        let bin = shapes.name.as_str();
        let span = tracing::info_span!("datacard", region = bin);
        let _guard = span.enter();
        shapes.check_binning()?;

        let data = shapes
            .get(&setup.samples.data)
            .ok_or_else(|| Error::template(bin, format!("no '{}' template", setup.samples.data)))?;
        let observation = data.integral();
        if data.content.iter().any(|c| *c < 0.0) {
            return Err(Error::template(bin, "negative observed yield"));
        }

        let mut card = Datacard {
            shapes: vec![ShapesLine {
                process: "*".into(),
                bin: bin.to_string(),
                file: self.shapes_file.clone(),
                nominal: "$BIN/$PROCESS".into(),
                systematic: "$BIN/$PROCESS_$SYSTEMATIC".into(),
            }],
            observations: vec![(bin.to_string(), observation)],
            ..Datacard::default()
        };

        let mut signal_id = 1;
        let mut background_id = 0;
        for p in setup.signals().into_iter().chain(setup.backgrounds()) {
            let hist = shapes.get(p).ok_or_else(|| Error::template(bin, format!("no template for process '{p}'")))?;
            let id = if is_signal(p) {
                signal_id -= 1;
                signal_id
            } else {
                background_id += 1;
                background_id
            };
            card.columns.push(ProcessColumn { bin: bin.to_string(), process: p.to_string(), id, rate: hist.integral() });
        }
        let present: Vec<String> = card.columns.iter().map(|c| c.process.clone()).collect();

        for (key, sys) in setup.systematics.iter() {
            let name = sys.nuisance_name(key).to_string();
            let mut effects = vec![None; present.len()];
            for (i, p) in present.iter().enumerate() {
                if !sys.processes.contains(p) {
                    continue;
                }
                effects[i] = match sys.effect {
                    Effect::LnN => Some(match sys.scale_factor_down {
                        Some(lo) => EffectValue::Asym(lo, sys.scale_factor),
                        None => EffectValue::Sym(sys.scale_factor),
                    }),
                    Effect::Shape => self.shape_effect(shapes, p, &name, sys.scale_factor)?,
                };
            }
            if effects.iter().all(Option::is_none) {
                tracing::debug!(nuisance = %name, "affects no process of this region");
                continue;
            }
            let kind = if sys.effect == Effect::LnN { RowKind::LnN } else { RowKind::Shape };
            card.nuisances.push(NuisanceRow { name, kind, effects });
        }

        let [rlo, rhi] = setup.fit.rate_param_range;
        let signals: Vec<&str> = present.iter().map(String::as_str).filter(|p| is_signal(p)).collect();
        if let Some(tes) = &setup.tes_variations {
            for p in signals.iter().copied().filter(|p| tes.processes.iter().any(|q| q.as_str() == *p)) {
                let grid: Vec<f64> = shapes.names().filter_map(|n| parse_tes_value(n, p)).collect();
                let (Some(min), Some(max)) =
                    (grid.iter().copied().reduce(f64::min), grid.iter().copied().reduce(f64::max))
                else {
                    return Err(Error::template(bin, format!("no energy-scale grid templates for '{p}'")));
                };
                let r = (1.0 - min).max(max - 1.0);
                card.shapes.push(ShapesLine {
                    process: p.to_string(),
                    bin: bin.to_string(),
                    file: self.shapes_file.clone(),
                    nominal: format!("$BIN/$PROCESS_TES{MASS_KEY}"),
                    systematic: format!("$BIN/$PROCESS_TES{MASS_KEY}_$SYSTEMATIC"),
                });
                card.rate_params.push(RateParam {
                    name: tes_parameter(setup, bin)?,
                    bin: bin.to_string(),
                    process: p.to_string(),
                    init: 1.0,
                    range: Some((1.0 - r, 1.0 + r)),
                });
                self.check_grid_variations(shapes, p, &grid, &card)?;
            }
        }
        if !signals.is_empty() {
            let tid = tid_parameter(setup, bin)?;
            for p in &signals {
                card.rate_params.push(RateParam {
                    name: tid.clone(),
                    bin: bin.to_string(),
                    process: p.to_string(),
                    init: 1.0,
                    range: Some((rlo, rhi)),
                });
            }
        }
        if !setup.systematics.contains_key("norm_wj") {
            for p in present.iter().filter(|p| *p == "W" || *p == "WJ") {
                card.rate_params.push(RateParam {
                    name: format!("sf_W_{bin}"),
                    bin: bin.to_string(),
                    process: p.clone(),
                    init: 1.0,
                    range: Some((rlo, rhi)),
                });
            }
        }
        if !setup.systematics.contains_key("xsec_dy") {
            for p in present.iter().filter(|p| matches!(p.as_str(), "ZTT" | "ZL" | "ZJ")) {
                card.rate_params.push(RateParam {
                    name: "xsec_dy".into(),
                    bin: bin.to_string(),
                    process: p.clone(),
                    init: 1.0,
                    range: Some((rlo, rhi)),
                });
            }
        }

        let names = card.parameter_names();
        for (name, [mean, sigma]) in setup.fit.constraints.iter() {
            if names.iter().any(|n| n == name) {
                card.params.push(ParamLine { name: name.to_string(), mean: *mean, sigma: *sigma });
            }
        }
        card.auto_mc_stats.push(AutoMcStats {
            bin: bin.to_string(),
            threshold: setup.fit.auto_mc_stats,
            include_signal: 1,
            hist_mode: 1,
        });

        let groups = setup.fit.groups.as_ref().map(|g| g.0.clone()).unwrap_or_else(default_groups);
        let groupable: Vec<String> = names.into_iter().filter(|n| !n.starts_with("tes")).collect();
        card.groups = resolve_groups(&groups, &groupable)?;

        tracing::info!(
            processes = card.columns.len(),
            nuisances = card.nuisances.len(),
            rate_params = card.rate_params.len(),
            "assembled datacard"
        );
        Ok(card)
    }

    /// Cards of several regions combined into one.
    pub fn build_combined(&self, regions: &[&RegionShapes]) -> Result<Datacard> {
        let cards = regions.iter().map(|r| self.build(r)).collect::<Result<Vec<_>>>()?;
        combine_cards(&cards)
    }

    fn shape_effect(&self, shapes: &RegionShapes, process: &str, nuisance: &str, scale: f64) -> Result<Option<EffectValue>> {
        let mut integrals = [0.0; 2];
        for (i, var) in ["Up", "Down"].iter().enumerate() {
            let name = format!("{process}_{nuisance}{var}");
            let hist = shapes
                .get(&name)
                .ok_or_else(|| Error::template(shapes.name.clone(), format!("missing shape template '{name}'")))?;
            integrals[i] = hist.integral();
        }
        if integrals.contains(&0.0) {
            tracing::warn!(process, nuisance, "zero-integral variation, nuisance dropped for this process");
            return Ok(None);
        }
        Ok(Some(EffectValue::Sym(scale)))
    }

    fn check_grid_variations(&self, shapes: &RegionShapes, process: &str, grid: &[f64], card: &Datacard) -> Result<()> {
        let Some(col) = card.columns.iter().position(|c| c.process == process) else {
            return Ok(());
        };
        for row in card.nuisances.iter().filter(|r| r.kind == RowKind::Shape && r.effects[col].is_some()) {
            for v in grid {
                for var in ["Up", "Down"] {
                    let name = format!("{process}_TES{v:.3}_{}{var}", row.name);
                    if !shapes.contains(&name) {
                        return Err(Error::template(shapes.name.clone(), format!("missing shape template '{name}'")));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::setup;
    use tau_hist::Hist1D;

    fn region(name: &str, setup: &AnalysisSetup) -> RegionShapes {
        let edges = vec![0.0, 1.0, 2.0];
        let h = |n: &str, c: [f64; 2]| Hist1D::from_content(n, edges.clone(), c.to_vec(), None).unwrap();
        let mut r = RegionShapes::new(name);
        r.put(h("data_obs", [100.0, 120.0]));
        for p in ["ZTT", "ZL", "ZJ", "TTT", "VV", "QCD"] {
            r.put(h(p, [10.0, 12.0]));
        }
        for v in setup.tes_variations.as_ref().unwrap().values.iter() {
            r.put(h(&format!("ZTT_TES{v:.3}"), [10.0 * v, 12.0]));
            for var in ["Up", "Down"] {
                r.put(h(&format!("ZTT_TES{v:.3}_shape_dy{var}"), [10.0, 12.0]));
            }
        }
        for p in ["ZTT", "ZL"] {
            r.put(h(&format!("{p}_shape_dyUp"), [11.0, 12.0]));
            r.put(h(&format!("{p}_shape_dyDown"), [9.0, 12.0]));
        }
        r
    }

    #[test]
    fn process_ids_and_rows() {
        let setup = setup();
        let shapes = region("DM0", &setup);
        let card = DatacardBuilder::new(&setup, "f.shapes.json").build(&shapes).unwrap();
        let ids: Vec<i32> = card.columns.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(card.processes(), vec!["ZTT", "ZL", "ZJ", "TTT", "VV", "QCD"]);
        assert_eq!(card.observations, vec![("DM0".to_string(), 220.0)]);
        let lumi = card.nuisances.iter().find(|n| n.name == "lumi").unwrap();
        assert_eq!(lumi.effects[5], None);
        assert_eq!(lumi.effects[0], Some(EffectValue::Sym(1.025)));
        let tes = card.rate_params.iter().find(|r| r.name == "tes_DM0").unwrap();
        let (lo, hi) = tes.range.unwrap();
        assert!((lo - 0.98).abs() < 1e-12 && (hi - 1.02).abs() < 1e-12);
        assert_eq!(card.morph_parameter("DM0", "ZTT").unwrap().name, "tes_DM0");
        assert_eq!(card.norm_parameters("DM0", "ZTT").iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["tid_SF_DM0"]);
        assert_eq!(card.params, vec![ParamLine { name: "tid_SF_DM0".into(), mean: 1.0, sigma: 0.1 }]);
        assert!(card.groups.iter().any(|(g, m)| g == "zpt" && m == &vec!["shape_dy".to_string()]));
        assert!(card.groups.iter().all(|(_, m)| !m.iter().any(|n| n.starts_with("tes"))));
    }

    #[test]
    fn render_parse_round_trip() {
        let setup = setup();
        let shapes = region("DM0", &setup);
        let card = DatacardBuilder::new(&setup, "f.shapes.json").build(&shapes).unwrap();
        let text = card.render();
        let parsed = Datacard::parse(&text).unwrap();
        assert_eq!(parsed, card);
        assert_eq!(parsed.render(), text);
        assert!(text.contains("shapes ZTT DM0 f.shapes.json $BIN/$PROCESS_TES$MASS $BIN/$PROCESS_TES$MASS_$SYSTEMATIC"));
        assert!(text.contains("DM0 autoMCStats 10 1 1"));
    }

    #[test]
    fn combined_card_shares_rows() {
        let setup = setup();
        let dm0 = region("DM0", &setup);
        let dm1 = region("DM1", &setup);
        let card = DatacardBuilder::new(&setup, "f.shapes.json").build_combined(&[&dm0, &dm1]).unwrap();
        let rows: Vec<&NuisanceRow> = card.nuisances.iter().filter(|n| n.name == "xsec_dy").collect();
        assert_eq!(rows.len(), 1);
        let ones = rows[0].effects.iter().filter(|e| **e == Some(EffectValue::Sym(1.02))).count();
        assert_eq!(ones, 6);
        assert_eq!(card.bins(), vec!["DM0", "DM1"]);
        assert!(card.render().lines().filter(|l| l.starts_with("xsec_dy")).count() == 1);

        let dup = combine_cards(&[card.clone(), card]).unwrap_err();
        assert!(matches!(dup, Error::Validation(_)));
    }

    #[test]
    fn missing_shape_template_is_fatal() {
        let setup = setup();
        let mut shapes = region("DM0", &setup);
        shapes.histograms.retain(|h| h.name != "ZL_shape_dyDown");
        let err = DatacardBuilder::new(&setup, "f").build(&shapes).unwrap_err();
        assert!(matches!(err, Error::TemplateIntegrity { .. }));
    }

    #[test]
    fn empty_variation_drops_process() {
        let setup = setup();
        let mut shapes = region("DM0", &setup);
        let empty = shapes.get("ZL").unwrap().empty_like("ZL_shape_dyUp");
        shapes.put(empty);
        let card = DatacardBuilder::new(&setup, "f").build(&shapes).unwrap();
        let row = card.nuisances.iter().find(|n| n.name == "shape_dy").unwrap();
        assert!(row.effects[0].is_some());
        assert!(row.effects[1].is_none());
    }

    #[test]
    fn parameter_naming() {
        let mut setup = setup();
        assert_eq!(tes_parameter(&setup, "DM1").unwrap(), "tes_DM1");
        assert_eq!(tes_parameter(&setup, "pt1_DM0").unwrap(), "tes_DM0");
        assert!(matches!(tes_parameter(&setup, "DM10").unwrap_err(), Error::Config(_)));
        assert_eq!(tid_parameter(&setup, "DM0").unwrap(), "tid_SF_DM0");
        assert_eq!(tid_parameter(&setup, "DM0_pt1").unwrap(), "tid_SF_pt1");
        setup.tes_regions = Default::default();
        assert_eq!(tes_parameter(&setup, "DM10_pt2").unwrap(), "tes_DM10");
    }

    #[test]
    fn groups_support_negation() {
        let names = vec!["lumi".to_string(), "prop_binDM0_bin1".to_string(), "shape_dy".to_string()];
        let groups = resolve_groups(&default_groups(), &names).unwrap();
        let sys = &groups.iter().find(|(g, _)| g == "sys").unwrap().1;
        assert_eq!(sys, &vec!["lumi".to_string(), "shape_dy".to_string()]);
        assert!(!groups.iter().any(|(g, _)| g == "tid"));
    }

    #[test]
    fn asymmetric_lnn_round_trips() {
        let text = "imax 1\njmax 0\nkmax *\nbin A\nobservation 5\nbin A\nprocess S\nprocess 0\nrate 4.5\nx lnN 0.9/1.1\n";
        let card = Datacard::parse(text).unwrap();
        assert_eq!(card.nuisances[0].effects[0], Some(EffectValue::Asym(0.9, 1.1)));
        assert_eq!(Datacard::parse(&card.render()).unwrap(), card);
    }
}
