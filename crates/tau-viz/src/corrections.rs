//! Export of POI measurements as a correction-library (schema v2) document.
//!
//! The correction is keyed by decay mode, tau pT, working point and
//! systematic variation (`nom`, `up`, `down`). Categories of the measurement
//! table are named `DM<dm>_pt<lo>to<hi>`, or `DM<dm>` for a pT-inclusive
//! measurement, which then covers [`DEFAULT_PT_RANGE`].

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tau_core::{Error, Measurement, Result};

use crate::measurement::MeasurementTable;

/// pT range of a pT-inclusive category.
pub const DEFAULT_PT_RANGE: (f64, f64) = (20.0, 1000.0);

const CATEGORY_PATTERN: &str = r"^DM(?P<dm>\d+)(?:_pt(?P<lo>\d+(?:\.\d+)?)to(?P<hi>\d+(?:\.\d+)?))?$";

/// Top-level correction-set document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSet {
    pub schema_version: u32,
    pub description: String,
    pub corrections: Vec<Correction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub name: String,
    pub description: String,
    pub version: u32,
    pub inputs: Vec<Variable>,
    pub output: Variable,
    pub data: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Variable {
    fn new(name: &str, kind: &str, description: &str) -> Self {
        Self { name: name.into(), kind: kind.into(), description: description.into() }
    }
}

/// A node or a leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Value(f64),
    Node(Box<Node>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodetype", rename_all = "lowercase")]
pub enum Node {
    Category {
        input: String,
        content: Vec<CategoryItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Content>,
    },
    Binning {
        input: String,
        edges: Vec<f64>,
        content: Vec<Content>,
        flow: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryItem {
    pub key: Key,
    pub value: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

/// Decay mode and pT range of a measurement category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryBin {
    /// Reconstructed decay mode.
    pub dm: i64,
    /// Lower pT edge.
    pub pt_lo: f64,
    /// Upper pT edge.
    pub pt_hi: f64,
}

/// Parse `DM<dm>_pt<lo>to<hi>` or `DM<dm>`.
pub fn parse_category(category: &str) -> Result<CategoryBin> {
    let re = Regex::new(CATEGORY_PATTERN).map_err(|e| Error::Computation(format!("category pattern: {e}")))?;
    let caps = re
        .captures(category)
        .ok_or_else(|| Error::PostFit(format!("category '{category}' is not DM<n> or DM<n>_pt<lo>to<hi>")))?;
    let num = |s: &str| s.parse::<f64>().map_err(|_| Error::PostFit(format!("bad number in category '{category}'")));
    let dm = caps["dm"].parse::<i64>().map_err(|_| Error::PostFit(format!("bad decay mode in '{category}'")))?;
    let (pt_lo, pt_hi) = match (caps.name("lo"), caps.name("hi")) {
        (Some(lo), Some(hi)) => (num(lo.as_str())?, num(hi.as_str())?),
        _ => DEFAULT_PT_RANGE,
    };
    if pt_hi <= pt_lo {
        return Err(Error::PostFit(format!("empty pT range in category '{category}'")));
    }
    Ok(CategoryBin { dm, pt_lo, pt_hi })
}

fn syst_node(m: &Measurement) -> Content {
    let item = |key: &str, value: f64| CategoryItem { key: Key::Str(key.into()), value: Content::Value(value) };
    Content::Node(Box::new(Node::Category {
        input: "syst".into(),
        content: vec![item("nom", m.value), item("up", m.value + m.err_up), item("down", m.value - m.err_down)],
        default: None,
    }))
}

/// Build a correction set for `wp` from the measurement table.
///
/// Within a decay mode the pT bins must be contiguous.
pub fn correction_set(table: &MeasurementTable, name: &str, wp: &str) -> Result<CorrectionSet> {
    let mut by_dm: BTreeMap<i64, Vec<(CategoryBin, Measurement)>> = BTreeMap::new();
    for (category, m) in &table.rows {
        let bin = parse_category(category)?;
        by_dm.entry(bin.dm).or_default().push((bin, *m));
    }
    if by_dm.is_empty() {
        return Err(Error::PostFit("no measurement to export".into()));
    }

    let mut dm_items = Vec::with_capacity(by_dm.len());
    for (dm, mut bins) in by_dm {
        bins.sort_by(|a, b| a.0.pt_lo.total_cmp(&b.0.pt_lo));
        let mut edges = vec![bins[0].0.pt_lo];
        for (bin, _) in &bins {
            let last = edges[edges.len() - 1];
            if (bin.pt_lo - last).abs() > 1e-9 {
                return Err(Error::PostFit(format!("pT bins of DM{dm} are not contiguous at {last}")));
            }
            edges.push(bin.pt_hi);
        }
        let content = bins
            .iter()
            .map(|(_, m)| {
                Content::Node(Box::new(Node::Category {
                    input: "wp".into(),
                    content: vec![CategoryItem { key: Key::Str(wp.into()), value: syst_node(m) }],
                    default: None,
                }))
            })
            .collect();
        let binning = Node::Binning { input: "pt".into(), edges, content, flow: "clamp".into() };
        dm_items.push(CategoryItem { key: Key::Int(dm), value: Content::Node(Box::new(binning)) });
    }

    tracing::info!(stage = "postfit", correction = name, wp, n_dm = dm_items.len(), "built correction");
    Ok(CorrectionSet {
        schema_version: 2,
        description: format!("{} measurement per decay mode and pT", table.poi),
        corrections: vec![Correction {
            name: name.into(),
            description: format!("{} for working point {wp}", table.poi),
            version: 1,
            inputs: vec![
                Variable::new("dm", "int", "Reconstructed tau decay mode"),
                Variable::new("pt", "real", "Tau pT"),
                Variable::new("wp", "string", "Working point"),
                Variable::new("syst", "string", "nom, up or down"),
            ],
            output: Variable::new(name, "real", ""),
            data: Content::Node(Box::new(Node::Category { input: "dm".into(), content: dm_items, default: None })),
        }],
    })
}

impl CorrectionSet {
    /// Look up `(dm, pt, wp, syst)`, clamping pT into the binning range.
    pub fn evaluate(&self, name: &str, dm: i64, pt: f64, wp: &str, syst: &str) -> Option<f64> {
        let corr = self.corrections.iter().find(|c| c.name == name)?;
        let mut node = &corr.data;
        loop {
            match node {
                Content::Value(v) => return Some(*v),
                Content::Node(n) => match n.as_ref() {
                    Node::Category { input, content, default } => {
                        let key = match input.as_str() {
                            "dm" => Key::Int(dm),
                            "wp" => Key::Str(wp.into()),
                            "syst" => Key::Str(syst.into()),
                            _ => return None,
                        };
                        node = match content.iter().find(|i| i.key == key) {
                            Some(item) => &item.value,
                            None => default.as_ref()?,
                        };
                    }
                    Node::Binning { edges, content, .. } => {
                        let inner = edges.get(1..content.len())?;
                        let i = inner.iter().take_while(|e| pt >= **e).count();
                        node = content.get(i)?;
                    }
                },
            }
        }
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::write_json(path, self)
    }

    /// Read a correction-set document.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::input("postfit", path.display().to_string(), format!("cannot read correction set: {e}"))
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> MeasurementTable {
        let mut t = MeasurementTable::new("tes");
        t.insert("DM1_pt40to200", Measurement::new(1.004, 0.002, 0.003));
        t.insert("DM1_pt20to40", Measurement::new(0.995, 0.004, 0.005));
        t.insert("DM0", Measurement::new(0.987, 0.006, 0.006));
        t
    }

    #[test]
    fn test_parse_category() {
        assert_eq!(parse_category("DM10_pt20to40").unwrap(), CategoryBin { dm: 10, pt_lo: 20.0, pt_hi: 40.0 });
        let incl = parse_category("DM11").unwrap();
        assert_eq!((incl.pt_lo, incl.pt_hi), DEFAULT_PT_RANGE);
        assert!(parse_category("pt20to40").is_err());
        assert!(parse_category("DM1_pt40to20").is_err());
    }

    #[test]
    fn test_evaluate() {
        let set = correction_set(&table(), "tau_energy_scale", "Medium").unwrap();
        assert_eq!(set.schema_version, 2);
        let eval = |dm, pt, syst| set.evaluate("tau_energy_scale", dm, pt, "Medium", syst);
        assert_relative_eq!(eval(1, 30.0, "nom").unwrap(), 0.995);
        assert_relative_eq!(eval(1, 100.0, "up").unwrap(), 1.007, epsilon = 1e-12);
        // clamped above the last edge
        assert_relative_eq!(eval(1, 5000.0, "down").unwrap(), 1.002, epsilon = 1e-12);
        assert_relative_eq!(eval(0, 25.0, "nom").unwrap(), 0.987);
        assert!(eval(5, 30.0, "nom").is_none());
        assert!(set.evaluate("tau_energy_scale", 1, 30.0, "Tight", "nom").is_none());

        let json = serde_json::to_string(&set).unwrap();
        assert!(json.contains(r#""nodetype":"binning""#));
        assert!(json.contains(r#""flow":"clamp""#));
        let back: CorrectionSet = serde_json::from_str(&json).unwrap();
        assert_relative_eq!(back.evaluate("tau_energy_scale", 1, 30.0, "Medium", "up").unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut t = table();
        t.insert("DM1_pt250to300", Measurement::new(1.0, 0.01, 0.01));
        assert!(matches!(correction_set(&t, "tes", "Medium"), Err(Error::PostFit(_))));
    }
}
