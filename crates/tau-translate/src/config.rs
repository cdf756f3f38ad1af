//! YAML analysis setup.
//!
//! One document describes a channel: samples and how they are joined, split
//! and renamed; regions; observables; the tau energy-scale shift grid;
//! systematics; on-the-fly scale factors; QCD estimation and fit options.
//! Keys keep the names used by the analysis configs (`baselineCuts`,
//! `TESvariations`, `tesRegions`, ...).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tau_core::{Channel, Error, Result};
use tau_hist::CompiledExpr;

/// A string-keyed map that keeps document order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    /// Value by key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|(k, _)| keep(k));
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(OrderedMap::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((k, v)) = map.next_entry::<String, T>()? {
                    if out.iter().any(|(seen, _): &(String, T)| *seen == k) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{k}'")));
                    }
                    out.push((k, v));
                }
                Ok(OrderedMap(out))
            }
        }

        deserializer.deserialize_any(OrderedVisitor(PhantomData))
    }
}

impl<T: Serialize> Serialize for OrderedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Full analysis setup for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSetup {
    /// Analysis name used in file names.
    #[serde(default = "default_analysis")]
    pub analysis: String,
    /// Channel (`mutau`, `etau`, `mumu`, ...).
    pub channel: String,
    /// Output tag appended to file names.
    #[serde(default)]
    pub tag: String,
    /// Baseline selection applied in every region.
    #[serde(rename = "baselineCuts")]
    pub baseline_cuts: String,
    /// Sample definitions.
    pub samples: SamplesSetup,
    /// Processes written to the shapes file, in declared order.
    pub processes: Vec<String>,
    /// Regions (directories of the shapes file).
    pub regions: OrderedMap<RegionSetup>,
    /// Observables to template.
    pub observables: OrderedMap<ObservableSetup>,
    /// Tau energy-scale shift grid.
    #[serde(rename = "TESvariations", default, skip_serializing_if = "Option::is_none")]
    pub tes_variations: Option<TesVariations>,
    /// Regions (or region tokens) carrying their own `tes_<name>` POI.
    #[serde(rename = "tesRegions", default)]
    pub tes_regions: OrderedMap<TitleSetup>,
    /// Regions (or region tokens) carrying their own `tid_SF_<name>` rate parameter.
    #[serde(rename = "tid_SFRegions", default)]
    pub tid_sf_regions: OrderedMap<TitleSetup>,
    /// Systematic uncertainties.
    #[serde(default)]
    pub systematics: OrderedMap<SystematicSetup>,
    /// Per-era conditional scale factors applied as extra weights.
    #[serde(rename = "scaleFactors", default)]
    pub scale_factors: OrderedMap<ScaleFactorSetup>,
    /// Data-driven QCD estimation.
    #[serde(default)]
    pub qcd: QcdSetup,
    /// Fit-related datacard options.
    #[serde(default)]
    pub fit: FitSetup,
}

fn default_analysis() -> String {
    "ztt".to_string()
}

/// Sample section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplesSetup {
    /// Name of the observed-data process.
    #[serde(default = "default_data")]
    pub data: String,
    /// Weight applied to every simulated sample.
    #[serde(default)]
    pub weight: String,
    /// Input samples.
    pub list: Vec<SampleSetup>,
    /// Merge several samples into one process: `name -> [samples]`.
    #[serde(default)]
    pub join: OrderedMap<Vec<String>>,
    /// Split a sample by cuts: `sample -> [{name, cut}]`.
    #[serde(default)]
    pub split: OrderedMap<Vec<SplitSetup>>,
    /// Rename processes: `old -> new`.
    #[serde(default)]
    pub rename: OrderedMap<String>,
}

fn default_data() -> String {
    tau_hist::DATA_OBS.to_string()
}

/// One input sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSetup {
    /// Sample name.
    pub name: String,
    /// Input names resolved by the event source.
    pub inputs: Vec<String>,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Cross section in pb. Without it the sample is not normalized.
    #[serde(default)]
    pub xsec: Option<f64>,
    /// Sum of generator weights used for normalization.
    #[serde(default)]
    pub sumw: Option<f64>,
    /// Extra weight for this sample.
    #[serde(default)]
    pub weight: String,
    /// Whether this is observed data.
    #[serde(default)]
    pub data: bool,
}

/// A split piece.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSetup {
    /// New process name.
    pub name: String,
    /// Cut selecting this piece.
    pub cut: String,
}

/// Region definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSetup {
    /// Selection added to the baseline.
    pub definition: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
}

/// Only a title.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TitleSetup {
    /// Display title.
    #[serde(default)]
    pub title: String,
}

/// Observable definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableSetup {
    /// Uniform binning `[n, lo, hi]`.
    #[serde(default)]
    pub binning: Option<[f64; 3]>,
    /// Explicit bin edges (takes precedence over `binning`).
    #[serde(default)]
    pub edges: Option<Vec<f64>>,
    /// Expression to histogram; defaults to the observable name.
    #[serde(default)]
    pub expr: Option<String>,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Regions fitted with this observable (all regions when empty).
    #[serde(rename = "fitRegions", default)]
    pub fit_regions: Vec<String>,
    /// Regions scanned with this observable.
    #[serde(rename = "scanRegions", default)]
    pub scan_regions: Vec<String>,
}

impl ObservableSetup {
    /// Bin edges of this observable.
    pub fn bin_edges(&self, name: &str) -> Result<Vec<f64>> {
        if let Some(edges) = &self.edges {
            return Ok(edges.clone());
        }
        let [n, lo, hi] = self
            .binning
            .ok_or_else(|| Error::Config(format!("observable '{name}' needs 'binning' or 'edges'")))?;
        if n < 1.0 || n.fract() != 0.0 || hi <= lo {
            return Err(Error::Config(format!("observable '{name}': invalid binning [{n}, {lo}, {hi}]")));
        }
        let n = n as usize;
        let w = (hi - lo) / n as f64;
        Ok((0..=n).map(|i| lo + w * i as f64).collect())
    }

    /// Expression to fill.
    pub fn expression<'a>(&'a self, name: &'a str) -> &'a str {
        self.expr.as_deref().unwrap_or(name)
    }
}

/// How a shifted input is obtained for an energy-scale point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftMode {
    /// Read dedicated inputs named `<input>_TES0p970`.
    #[default]
    Suffix,
    /// Scale the listed branches of the nominal input.
    Scale,
}

/// The tau energy-scale shift grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesVariations {
    /// Processes replicated per grid point.
    pub processes: Vec<String>,
    /// Multiplicative shifts.
    pub values: Vec<f64>,
    /// Where shifted events come from.
    #[serde(default)]
    pub mode: ShiftMode,
    /// Branches scaled in [`ShiftMode::Scale`].
    #[serde(default)]
    pub branches: Vec<String>,
}

/// Nuisance effect type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Log-normal normalization.
    #[serde(rename = "lnN")]
    LnN,
    /// Shape morphing between Up/Down templates.
    #[serde(rename = "shape")]
    Shape,
}

/// A systematic uncertainty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystematicSetup {
    /// Effect type.
    pub effect: Effect,
    /// Affected processes.
    pub processes: Vec<String>,
    /// Nuisance name (defaults to the key).
    #[serde(default)]
    pub name: Option<String>,
    /// lnN kappa (or shape scale, written in the card column).
    #[serde(rename = "scaleFactor", default = "default_one")]
    pub scale_factor: f64,
    /// Lower kappa for an asymmetric lnN.
    #[serde(rename = "scaleFactorDown", default)]
    pub scale_factor_down: Option<f64>,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Variation suffixes.
    #[serde(default = "default_variations")]
    pub variations: Vec<String>,
    /// Nominal weight factor replaced by the alternative weights.
    #[serde(rename = "nomWeight", default)]
    pub nom_weight: String,
    /// Alternative weight per variation.
    #[serde(rename = "altWeights", default)]
    pub alt_weights: Vec<String>,
    /// Input suffix per variation.
    #[serde(rename = "sampleAppend", default)]
    pub sample_append: Vec<String>,
}

fn default_one() -> f64 {
    1.0
}

fn default_variations() -> Vec<String> {
    vec!["Up".to_string(), "Down".to_string()]
}

impl SystematicSetup {
    /// Nuisance name used in templates and datacards.
    pub fn nuisance_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(key)
    }
}

/// Conditional scale factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleFactorSetup {
    /// Processes reweighted.
    pub processes: Vec<String>,
    /// `era -> {condition: value}` in priority order.
    pub values: BTreeMap<String, OrderedMap<f64>>,
}

impl ScaleFactorSetup {
    /// Nested ternary weight for `era`, or `None` if the era has no values.
    ///
    /// `(q_1*q_2<0 ? (c1 ? v1 : (c2 ? v2 : 1.0)) : 1.0)`
    pub fn weight_for_era(&self, era: &str, os_cut: &str) -> Option<String> {
        let conds = self.values.get(era)?;
        let mut inner = "1.0".to_string();
        for (cond, value) in conds.0.iter().rev() {
            inner = format!("({cond} ? {value} : {inner})");
        }
        Some(format!("({os_cut} ? {inner} : 1.0)"))
    }
}

/// Data-driven QCD estimation from the same-sign sideband.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcdSetup {
    /// OS/SS extrapolation factor.
    #[serde(default = "default_one")]
    pub ratio: f64,
    /// Opposite-sign cut as written in the selections.
    #[serde(default = "default_os")]
    pub os_cut: String,
    /// Same-sign replacement.
    #[serde(default = "default_ss")]
    pub ss_cut: String,
}

fn default_os() -> String {
    "q_1*q_2<0".to_string()
}

fn default_ss() -> String {
    "q_1*q_2>0".to_string()
}

impl Default for QcdSetup {
    fn default() -> Self {
        Self { ratio: 1.0, os_cut: default_os(), ss_cut: default_ss() }
    }
}

/// Datacard options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSetup {
    /// `autoMCStats` event threshold.
    #[serde(default)]
    pub auto_mc_stats: u32,
    /// Nuisance groups `name -> [regex]`; the standard groups when absent.
    #[serde(default)]
    pub groups: Option<OrderedMap<Vec<String>>>,
    /// Range of rate parameters without explicit bounds.
    #[serde(default = "default_rate_range")]
    pub rate_param_range: [f64; 2],
    /// Gaussian constraints `name -> [mean, sigma]` written as `param` lines.
    #[serde(default)]
    pub constraints: OrderedMap<[f64; 2]>,
}

fn default_rate_range() -> [f64; 2] {
    [0.0, 5.0]
}

impl Default for FitSetup {
    fn default() -> Self {
        Self { auto_mc_stats: 0, groups: None, rate_param_range: default_rate_range(), constraints: OrderedMap::default() }
    }
}

/// Whether a process name denotes the real-tau signal.
pub fn is_signal(process: &str) -> bool {
    process.contains("ZTT")
}

impl AnalysisSetup {
    /// Parse a setup from YAML text and validate it.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let setup: AnalysisSetup = serde_yaml_ng::from_str(text)
            .map_err(|e| Error::Config(format!("cannot parse analysis setup: {e}")))?;
        setup.validate()?;
        Ok(setup)
    }

    /// Read and validate a setup file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read setup '{}': {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Parsed channel.
    pub fn channel(&self) -> Result<Channel> {
        Channel::parse(&self.channel)
    }

    /// Signal processes (names containing `ZTT`), in declared order.
    pub fn signals(&self) -> Vec<&str> {
        self.processes.iter().map(String::as_str).filter(|p| is_signal(p)).collect()
    }

    /// Background processes in declared order (neither data nor signal).
    pub fn backgrounds(&self) -> Vec<&str> {
        self.processes
            .iter()
            .map(String::as_str)
            .filter(|p| !is_signal(p) && *p != self.samples.data && !p.contains("data"))
            .collect()
    }

    /// Full selection of a region (baseline and region definition).
    pub fn region_selection(&self, region: &str) -> Result<String> {
        let def = self
            .regions
            .get(region)
            .ok_or_else(|| Error::Config(format!("unknown region '{region}'")))?;
        Ok(join_cuts(&self.baseline_cuts, &def.definition))
    }

    /// Regions fitted with `observable`, in declared order.
    pub fn fit_regions(&self, observable: &str) -> Result<Vec<String>> {
        let obs = self
            .observables
            .get(observable)
            .ok_or_else(|| Error::Config(format!("unknown observable '{observable}'")))?;
        if obs.fit_regions.is_empty() {
            Ok(self.regions.keys().map(str::to_string).collect())
        } else {
            Ok(obs.fit_regions.clone())
        }
    }

    /// Keep only regions whose name matches one of `patterns` (regexes).
    pub fn restrict_regions(&mut self, patterns: &[String]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        let res = patterns
            .iter()
            .map(|p| {
                regex::Regex::new(&format!("^(?:{p})$"))
                    .map_err(|e| Error::Config(format!("invalid region pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.regions.retain(|r| res.iter().any(|re| re.is_match(r)));
        if self.regions.is_empty() {
            return Err(Error::Config(format!("no region matches {patterns:?}")));
        }
        Ok(())
    }

    /// Check the setup for consistency. Runs before any I/O.
    pub fn validate(&self) -> Result<()> {
        self.channel()?;
        if self.processes.is_empty() {
            return Err(Error::Config("no processes declared".into()));
        }
        if self.regions.is_empty() {
            return Err(Error::Config("no regions declared".into()));
        }
        let mut seen = HashSet::new();
        for p in &self.processes {
            if !seen.insert(p.as_str()) {
                return Err(Error::Config(format!("process '{p}' declared twice")));
            }
        }
        if self.samples.list.iter().filter(|s| s.data).count() > 1 {
            return Err(Error::Config("more than one sample is marked as data".into()));
        }

        compile_checked("baselineCuts", &self.baseline_cuts)?;
        for (name, region) in self.regions.iter() {
            compile_checked(&format!("region '{name}'"), &join_cuts(&self.baseline_cuts, &region.definition))?;
        }
        for s in &self.samples.list {
            if s.inputs.is_empty() {
                return Err(Error::Config(format!("sample '{}' has no inputs", s.name)));
            }
            compile_checked(&format!("weight of sample '{}'", s.name), &s.weight)?;
        }
        compile_checked("samples.weight", &self.samples.weight)?;

        for (name, obs) in self.observables.iter() {
            let edges = obs.bin_edges(name)?;
            if edges.len() < 2 || edges.windows(2).any(|w| w[1] <= w[0]) {
                return Err(Error::Config(format!("observable '{name}': bin edges must increase")));
            }
            compile_checked(&format!("observable '{name}'"), obs.expression(name))?;
            for r in obs.fit_regions.iter().chain(&obs.scan_regions) {
                if !self.regions.contains_key(r) {
                    return Err(Error::Config(format!("observable '{name}' refers to unknown region '{r}'")));
                }
            }
        }

        if let Some(tes) = &self.tes_variations {
            if tes.values.is_empty() || tes.values.iter().any(|v| !(*v > 0.0)) {
                return Err(Error::Config("TESvariations.values must be positive and non-empty".into()));
            }
            self.check_processes("TESvariations", &tes.processes)?;
            if tes.mode == ShiftMode::Scale && tes.branches.is_empty() {
                return Err(Error::Config("TESvariations: mode 'scale' needs 'branches'".into()));
            }
        }

        for (key, sys) in self.systematics.iter() {
            self.check_processes(&format!("systematic '{key}'"), &sys.processes)?;
            match sys.effect {
                Effect::LnN => {
                    if sys.scale_factor <= 0.0 || sys.scale_factor_down.is_some_and(|k| k <= 0.0) {
                        return Err(Error::Config(format!("systematic '{key}': lnN kappa must be positive")));
                    }
                }
                Effect::Shape => {
                    let mut v = sys.variations.clone();
                    v.sort();
                    if v != ["Down", "Up"] {
                        return Err(Error::Config(format!(
                            "systematic '{key}': shape variations must be an Up/Down pair, got {:?}",
                            sys.variations
                        )));
                    }
                    for (what, list) in [("altWeights", &sys.alt_weights), ("sampleAppend", &sys.sample_append)] {
                        if !list.is_empty() && list.len() != sys.variations.len() {
                            return Err(Error::Config(format!(
                                "systematic '{key}': {what} needs one entry per variation"
                            )));
                        }
                    }
                    if sys.alt_weights.is_empty() && sys.sample_append.is_empty() {
                        return Err(Error::Config(format!(
                            "systematic '{key}': shape needs altWeights or sampleAppend"
                        )));
                    }
                    for w in &sys.alt_weights {
                        compile_checked(&format!("systematic '{key}'"), w)?;
                    }
                }
            }
        }

        for (key, sf) in self.scale_factors.iter() {
            self.check_processes(&format!("scale factor '{key}'"), &sf.processes)?;
            for conds in sf.values.values() {
                for (cond, _) in conds.iter() {
                    compile_checked(&format!("scale factor '{key}'"), cond)?;
                }
            }
        }
        if self.qcd.ratio < 0.0 {
            return Err(Error::Config("qcd.ratio must be non-negative".into()));
        }
        let [lo, hi] = self.fit.rate_param_range;
        if hi <= lo {
            return Err(Error::Config("fit.rate_param_range must be increasing".into()));
        }
        for (name, [_, sigma]) in self.fit.constraints.iter() {
            if !(*sigma > 0.0) {
                return Err(Error::Config(format!("fit.constraints: '{name}' needs a positive width")));
            }
        }
        Ok(())
    }

    fn check_processes(&self, what: &str, procs: &[String]) -> Result<()> {
        match procs.iter().find(|p| !self.processes.contains(p)) {
            Some(p) => Err(Error::Config(format!("{what} refers to undeclared process '{p}'"))),
            None => Ok(()),
        }
    }
}

/// Join two cuts with `&&`, skipping empty ones.
pub fn join_cuts(a: &str, b: &str) -> String {
    match (a.trim().is_empty(), b.trim().is_empty()) {
        (true, true) => String::new(),
        (true, false) => b.trim().to_string(),
        (false, true) => a.trim().to_string(),
        (false, false) => format!("({}) && ({})", a.trim(), b.trim()),
    }
}

fn compile_checked(what: &str, expr: &str) -> Result<()> {
    if expr.trim().is_empty() {
        return Ok(());
    }
    CompiledExpr::compile(expr).map(|_| ()).map_err(|e| Error::Config(format!("{what}: {e}")))
}
