//! The `limit` tree written by the fit driver.
//!
//! Columnar: one branch per quantity, one entry per row. Row 0 is the best
//! fit (`quantileExpected == -1`, `deltaNLL == 0`), the remaining rows are
//! scan points in increasing POI.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};

/// Branch holding the NLL difference to the best fit.
pub const DELTA_NLL: &str = "deltaNLL";
/// Branch marking the best-fit row with `-1`.
pub const QUANTILE: &str = "quantileExpected";
/// Prefix of tracked-parameter branches.
pub const TRACKED_PREFIX: &str = "trackedParam_";
/// `quantileExpected` of the best-fit row.
pub const BEST_FIT_QUANTILE: f64 = -1.0;
/// `quantileExpected` of a scan row.
pub const SCAN_QUANTILE: f64 = 1.0;

fn default_true() -> bool {
    true
}

/// Fit-result tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTree {
    /// POI branch name.
    pub poi: String,
    /// Tracked parameter names, in branch order.
    pub tracked: Vec<String>,
    /// Branches by name.
    pub branches: BTreeMap<String, Vec<f64>>,
    /// False when the scan was cancelled.
    #[serde(default = "default_true")]
    pub complete: bool,
    /// POI values whose minimization failed.
    #[serde(default)]
    pub invalid_points: Vec<f64>,
}

impl ScanTree {
    /// Empty tree with the POI, `deltaNLL`, `quantileExpected` and tracked branches.
    pub fn new(poi: impl Into<String>, tracked: Vec<String>) -> Self {
        let poi = poi.into();
        let mut branches = BTreeMap::new();
        for name in [poi.clone(), DELTA_NLL.to_string(), QUANTILE.to_string()] {
            branches.insert(name, Vec::new());
        }
        for t in &tracked {
            branches.insert(format!("{TRACKED_PREFIX}{t}"), Vec::new());
        }
        Self { poi, tracked, branches, complete: true, invalid_points: Vec::new() }
    }

    /// Append one row; `tracked` follows [`ScanTree::tracked`].
    pub fn push_row(&mut self, poi: f64, delta_nll: f64, quantile: f64, tracked: &[f64]) -> Result<()> {
        if tracked.len() != self.tracked.len() {
            return Err(Error::Validation(format!(
                "row has {} tracked values, tree tracks {}",
                tracked.len(),
                self.tracked.len()
            )));
        }
        for (name, value) in [(self.poi.clone(), poi), (DELTA_NLL.to_string(), delta_nll), (QUANTILE.to_string(), quantile)] {
            self.branches.entry(name).or_default().push(value);
        }
        for (t, v) in self.tracked.iter().zip(tracked) {
            self.branches.entry(format!("{TRACKED_PREFIX}{t}")).or_default().push(*v);
        }
        Ok(())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.branches.get(DELTA_NLL).map_or(0, Vec::len)
    }

    /// Branch by full name.
    pub fn branch(&self, name: &str) -> Option<&[f64]> {
        self.branches.get(name).map(Vec::as_slice)
    }

    /// Branch by full name, a post-fit error when missing.
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.branch(name).ok_or_else(|| Error::PostFit(format!("no branch '{name}' in the fit tree")))
    }

    /// POI values.
    pub fn poi_values(&self) -> Result<&[f64]> {
        self.require(&self.poi)
    }

    /// `deltaNLL` values.
    pub fn delta_nll(&self) -> Result<&[f64]> {
        self.require(DELTA_NLL)
    }

    /// Values of tracked parameter `name`.
    pub fn tracked_values(&self, name: &str) -> Option<&[f64]> {
        self.branch(&format!("{TRACKED_PREFIX}{name}"))
    }

    /// Index of the best-fit row.
    pub fn best_fit_row(&self) -> Option<usize> {
        self.branch(QUANTILE)?.iter().position(|q| *q == BEST_FIT_QUANTILE)
    }

    /// `(poi, 2*deltaNLL)` over every row, sorted by POI.
    pub fn points(&self) -> Result<Vec<(f64, f64)>> {
        let x = self.poi_values()?;
        let y = self.delta_nll()?;
        let mut pts: Vec<(f64, f64)> = x.iter().zip(y).map(|(a, b)| (*a, 2.0 * b)).collect();
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(pts)
    }

    /// Read a tree.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::input("postfit", path.display().to_string(), format!("cannot read fit tree: {e}")))?;
        let tree: ScanTree = serde_json::from_str(&text)?;
        let n = tree.n_rows();
        if let Some((name, _)) = tree.branches.iter().find(|(_, v)| v.len() != n) {
            return Err(Error::Validation(format!("branch '{name}' length differs from {n} rows")));
        }
        Ok(tree)
    }

    /// Write the tree (pretty JSON).
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_lookup() {
        let mut tree = ScanTree::new("tes_DM0", vec!["lumi".into()]);
        tree.push_row(1.001, 0.0, BEST_FIT_QUANTILE, &[0.1]).unwrap();
        tree.push_row(0.99, 0.5, SCAN_QUANTILE, &[0.2]).unwrap();
        tree.push_row(1.01, 0.4, SCAN_QUANTILE, &[0.0]).unwrap();
        assert_eq!(tree.n_rows(), 3);
        assert_eq!(tree.best_fit_row(), Some(0));
        assert_eq!(tree.tracked_values("lumi"), Some(&[0.1, 0.2, 0.0][..]));
        assert_eq!(tree.points().unwrap()[0], (0.99, 1.0));
        assert!(tree.push_row(1.0, 0.0, SCAN_QUANTILE, &[]).is_err());
        assert!(matches!(tree.require("trackedParam_nope"), Err(Error::PostFit(_))));
    }

    #[test]
    fn test_write_read() {
        let mut tree = ScanTree::new("tid_SF", vec![]);
        tree.push_row(1.0, 0.0, BEST_FIT_QUANTILE, &[]).unwrap();
        let path = std::env::temp_dir().join(format!("tau_tree_{}.json", std::process::id()));
        tree.write(&path).unwrap();
        let back = ScanTree::read(&path).unwrap();
        assert_eq!(back.poi, "tid_SF");
        assert_eq!(back.n_rows(), 1);
        assert!(back.complete);
    }
}
