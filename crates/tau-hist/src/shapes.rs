//! Shapes file: the per (channel, era, observable) template store.
//!
//! Layout mirrors a ROOT file with one directory per region. Order is
//! significant and preserved on disk: regions in insertion order, templates
//! in the order they were written (data, signals, backgrounds, variations).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};

use crate::histogram::Hist1D;

/// Observed-data template name.
pub const DATA_OBS: &str = "data_obs";

/// Descriptive header of a shapes file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeMeta {
    /// Analysis name (e.g. `ztt`).
    pub analysis: String,
    /// Channel short name.
    pub channel: String,
    /// Observable (e.g. `m_2`).
    pub observable: String,
    /// Era.
    pub era: String,
    /// Output tag.
    #[serde(default)]
    pub tag: String,
    /// False when the producing stage was cancelled or failed for some region.
    #[serde(default = "default_true")]
    pub complete: bool,
    /// Regions that were skipped, with the reason.
    #[serde(default)]
    pub skipped: Vec<(String, String)>,
}

fn default_true() -> bool {
    true
}

/// Templates of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionShapes {
    /// Region (directory) name.
    pub name: String,
    /// Templates in write order.
    pub histograms: Vec<Hist1D>,
}

impl RegionShapes {
    /// Empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), histograms: Vec::new() }
    }

    /// Template by name.
    pub fn get(&self, name: &str) -> Option<&Hist1D> {
        self.histograms.iter().find(|h| h.name == name)
    }

    /// Whether a template exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a template, replacing an existing one of the same name in place.
    pub fn put(&mut self, hist: Hist1D) {
        match self.histograms.iter_mut().find(|h| h.name == hist.name) {
            Some(slot) => *slot = hist,
            None => self.histograms.push(hist),
        }
    }

    /// Template names in write order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.histograms.iter().map(|h| h.name.as_str())
    }

    /// Check that every template shares the binning of the first one.
    pub fn check_binning(&self) -> Result<()> {
        let Some(reference) = self.histograms.first() else {
            return Ok(());
        };
        for h in &self.histograms[1..] {
            reference.check_binning(h).map_err(|e| Error::template(self.name.clone(), e.to_string()))?;
        }
        Ok(())
    }
}

/// A shapes file: ordered regions of ordered templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeFile {
    /// Header.
    pub meta: ShapeMeta,
    /// Region directories.
    pub regions: Vec<RegionShapes>,
}

impl ShapeFile {
    /// Empty shapes file.
    pub fn new(meta: ShapeMeta) -> Self {
        Self { meta, regions: Vec::new() }
    }

    /// Canonical file name `<analysis>_<channel>_<observable>.inputs-<era>-<tag>.shapes.json`.
    pub fn file_name(analysis: &str, channel: &str, observable: &str, era_label: &str, tag: &str) -> String {
        format!("{analysis}_{channel}_{observable}.inputs-{era_label}{tag}.shapes.json")
    }

    /// Region by name.
    pub fn region(&self, name: &str) -> Option<&RegionShapes> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Region by name, failing with an input error naming the file's regions.
    pub fn require_region(&self, name: &str) -> Result<&RegionShapes> {
        self.region(name).ok_or_else(|| {
            let known: Vec<&str> = self.regions.iter().map(|r| r.name.as_str()).collect();
            Error::input("shapes", name, format!("region not in shapes file (have {known:?})"))
        })
    }

    /// Template `<region>/<name>`.
    pub fn get(&self, region: &str, name: &str) -> Option<&Hist1D> {
        self.region(region)?.get(name)
    }

    /// Insert or replace a region, keeping its position if it already exists.
    pub fn put_region(&mut self, shapes: RegionShapes) {
        match self.regions.iter_mut().find(|r| r.name == shapes.name) {
            Some(slot) => *slot = shapes,
            None => self.regions.push(shapes),
        }
    }

    /// Read a shapes file.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::input("shapes", path.display().to_string(), format!("cannot read shapes file: {e}"))
        })?;
        let file: ShapeFile = serde_json::from_str(&text)?;
        for region in &file.regions {
            region.check_binning()?;
        }
        Ok(file)
    }

    /// Write the shapes file (pretty JSON).
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
