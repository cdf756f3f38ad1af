//! Parameters read back from the fit-result tree.
//!
//! Correlations with the POI are computed only over scan rows whose POI lies
//! in the 68% interval `[theta - err_down, theta + err_up]` of the parabola
//! fit (narrow band), so the tails of the scan do not dominate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tau_core::{Error, FitResult, Measurement, Result};
use tau_inference::{ParabolaOptions, ParabolaResult, ScanTree, fit_parabola};

/// Values of one branch over all rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameter {
    /// Parameter name (without the tracked-branch prefix).
    pub name: String,
    /// One value per tree row.
    pub values: Vec<f64>,
    /// Mean over the rows.
    pub mean: f64,
    /// Sample standard deviation over the rows.
    pub sigma: f64,
}

impl ScanParameter {
    /// Summarize `values`; `None` without rows. A single row has no spread.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Option<Self> {
        let n = values.len();
        if n == 0 {
            return None;
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = if n < 2 { 0.0 } else { values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64 };
        Some(Self { name: name.into(), values, mean, sigma: var.sqrt() })
    }
}

/// Summary of one parameter for display and downstream use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    /// Parameter name.
    pub name: String,
    /// Value at the scan row closest to the best-fit POI.
    pub value: f64,
    /// Spread over the scan.
    pub error: f64,
    /// Narrow-band correlation with the POI.
    pub correlation: Option<f64>,
}

/// A tracked parameter against the POI, with the best-fit marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCurve {
    /// Parameter name.
    pub name: String,
    /// POI values, increasing.
    pub poi: Vec<f64>,
    /// Parameter value per POI value.
    pub values: Vec<f64>,
    /// Best-fit POI, drawn as a vertical line.
    pub best_fit: f64,
}

/// Symmetric correlation matrix with unit diagonal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    /// Parameter names, in row order.
    pub names: Vec<String>,
    /// `matrix[i][j]`.
    pub matrix: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    /// Correlation of the named pair.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        Some(self.matrix[i][j])
    }

    /// Correlations from the covariance of a best fit.
    ///
    /// A missing or non-positive-definite covariance is a post-fit error; the
    /// caller skips the matrix.
    pub fn from_fit(fit: &FitResult) -> Result<Self> {
        let n = fit.parameters.len();
        let cov = match (&fit.covariance, fit.covariance_valid) {
            (Some(c), true) if c.len() == n * n => c,
            _ => return Err(Error::PostFit("no valid covariance, correlation matrix skipped".into())),
        };
        let mut matrix = vec![vec![0.0; n]; n];
        for (i, row) in matrix.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                let (si, sj) = (fit.uncertainties[i], fit.uncertainties[j]);
                *v = if i == j {
                    1.0
                } else if si > 0.0 && sj > 0.0 && cov[i * n + j].is_finite() {
                    (cov[i * n + j] / (si * sj)).clamp(-1.0, 1.0)
                } else {
                    0.0
                };
            }
        }
        Ok(Self { names: fit.names.clone(), matrix })
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::write_json(path, self)
    }
}

/// Reads parameters from a scan tree around its best-fit POI.
///
/// Without a parabola interval the narrow band is the whole scan and the
/// best-fit row is the tree's own.
#[derive(Debug, Clone)]
pub struct PostFitReader<'a> {
    tree: &'a ScanTree,
    interval: Option<ParabolaResult>,
}

impl<'a> PostFitReader<'a> {
    /// Fit the scan's parabola and keep its interval.
    ///
    /// A scan too short for the parabola is logged and read without one.
    pub fn new(tree: &'a ScanTree, opts: &ParabolaOptions) -> Result<Self> {
        let interval = match fit_parabola(&tree.points()?, opts) {
            Ok(interval) => interval,
            Err(Error::PostFit(message)) => {
                tracing::warn!(stage = "postfit", poi = %tree.poi, %message, "no parabola, post-fit curve skipped");
                return Ok(Self { tree, interval: None });
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            stage = "postfit",
            poi = %tree.poi,
            value = interval.measurement.value,
            err_down = interval.measurement.err_down,
            err_up = interval.measurement.err_up,
            "POI interval"
        );
        Ok(Self { tree, interval: Some(interval) })
    }

    /// Reader with an interval obtained elsewhere.
    pub fn with_interval(tree: &'a ScanTree, interval: ParabolaResult) -> Self {
        Self { tree, interval: Some(interval) }
    }

    /// The POI interval, if the parabola could be fitted.
    pub fn interval(&self) -> Option<&ParabolaResult> {
        self.interval.as_ref()
    }

    /// POI measurement.
    pub fn measurement(&self) -> Option<Measurement> {
        self.interval.as_ref().map(|i| i.measurement)
    }

    /// POI range of the narrow band.
    pub fn window(&self) -> Option<(f64, f64)> {
        self.measurement().map(|m| (m.lower(), m.upper()))
    }

    /// Best-fit POI: the parabola minimum, else the best-fit row of the tree.
    pub fn best_fit_poi(&self) -> Option<f64> {
        match &self.interval {
            Some(i) => Some(i.measurement.value),
            None => self.poi_values().ok()?.get(self.tree.best_fit_row()?).copied(),
        }
    }

    /// Tracked parameter `name`, or any branch of that name; the POI itself is
    /// accepted. A missing branch is logged and skipped.
    pub fn parameter(&self, name: &str) -> Option<ScanParameter> {
        let values = self.tree.tracked_values(name).or_else(|| self.tree.branch(name));
        match values {
            Some(v) => ScanParameter::new(name, v.to_vec()),
            None => {
                tracing::warn!(parameter = name, "no branch for parameter, skipped");
                None
            }
        }
    }

    /// Every found parameter of `names`, in order.
    pub fn parameters(&self, names: &[String]) -> Vec<ScanParameter> {
        names.iter().filter_map(|n| self.parameter(n)).collect()
    }

    fn poi_values(&self) -> Result<&[f64]> {
        self.tree.poi_values()
    }

    /// Pearson correlation of two branches over the narrow band.
    pub fn narrow_band_correlation(&self, a: &[f64], b: &[f64]) -> Option<f64> {
        let poi = self.poi_values().ok()?;
        let (lo, hi) = self.window().unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        let tol = 1e-9 * (hi - lo).abs().min(1.0).max(f64::EPSILON);
        let rows: Vec<(f64, f64)> = poi
            .iter()
            .zip(a.iter().zip(b))
            .filter(|(z, _)| **z >= lo - tol && **z <= hi + tol)
            .map(|(_, (x, y))| (*x, *y))
            .collect();
        pearson(&rows)
    }

    /// Row index whose POI is closest to the best fit.
    pub fn best_fit_row(&self) -> Option<usize> {
        let theta = self.best_fit_poi()?;
        self.poi_values()
            .ok()?
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - theta).abs().total_cmp(&(b.1 - theta).abs()))
            .map(|(i, _)| i)
    }

    /// Record of one parameter.
    pub fn record(&self, p: &ScanParameter) -> Option<ParameterRecord> {
        let row = self.best_fit_row()?;
        let poi = self.poi_values().ok()?;
        Some(ParameterRecord {
            name: p.name.clone(),
            value: p.values[row],
            error: p.sigma,
            correlation: self.narrow_band_correlation(&p.values, poi),
        })
    }

    /// Records of every found parameter of `names`.
    pub fn records(&self, names: &[String]) -> Vec<ParameterRecord> {
        self.parameters(names).iter().filter_map(|p| self.record(p)).collect()
    }

    /// Parameter values against the POI, sorted by POI.
    ///
    /// Needs the parabola interval for the best-fit marker.
    pub fn curves(&self, names: &[String]) -> Result<Vec<ParameterCurve>> {
        let best_fit = self
            .measurement()
            .ok_or_else(|| Error::PostFit(format!("no POI interval for '{}', curves skipped", self.tree.poi)))?
            .value;
        let poi = self.poi_values()?;
        let mut order: Vec<usize> = (0..poi.len()).collect();
        order.sort_by(|a, b| poi[*a].total_cmp(&poi[*b]));
        Ok(self
            .parameters(names)
            .into_iter()
            .map(|p| ParameterCurve {
                name: p.name,
                poi: order.iter().map(|&i| poi[i]).collect(),
                values: order.iter().map(|&i| p.values[i]).collect(),
                best_fit,
            })
            .collect())
    }

    /// Narrow-band correlation matrix of `names`, optionally sorted by
    /// decreasing spread.
    pub fn correlation_matrix(&self, names: &[String], order_by_sigma: bool) -> CorrelationMatrix {
        let mut params = self.parameters(names);
        if order_by_sigma {
            sort_by_sigma(&mut params);
        }
        let n = params.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let r = self.narrow_band_correlation(&params[i].values, &params[j].values).unwrap_or(0.0);
                matrix[i][j] = r;
                matrix[j][i] = r;
            }
        }
        CorrelationMatrix { names: params.into_iter().map(|p| p.name).collect(), matrix }
    }

    /// `(name, value)` of each parameter at the best-fit row.
    pub fn fit_values(&self, names: &[String]) -> Vec<(String, f64)> {
        self.records(names).into_iter().map(|r| (r.name, r.value)).collect()
    }
}

fn pearson(rows: &[(f64, f64)]) -> Option<f64> {
    let n = rows.len();
    if n < 3 {
        return None;
    }
    let mx = rows.iter().map(|r| r.0).sum::<f64>() / n as f64;
    let my = rows.iter().map(|r| r.1).sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in rows {
        sxy += (x - mx) * (y - my);
        sxx += (x - mx).powi(2);
        syy += (y - my).powi(2);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Sort by decreasing spread.
pub fn sort_by_sigma(params: &mut [ScanParameter]) {
    params.sort_by(|a, b| b.sigma.total_cmp(&a.sigma));
}

/// `FitparameterValues_<tag>_<era>_<region>.txt`.
pub fn fit_values_file_name(tag: &str, era: &str, region: &str) -> String {
    format!("FitparameterValues_{tag}_{era}_{region}.txt")
}

/// Write `name : value` lines.
pub fn write_fit_values(path: &Path, values: &[(String, f64)]) -> Result<()> {
    let text: String = values.iter().map(|(n, v)| format!("{n} : {v}\n")).collect();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}

/// Read `name : value` lines.
pub fn read_fit_values(path: &Path) -> Result<Vec<(String, f64)>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::input("postfit", path.display().to_string(), format!("cannot read fit values: {e}")))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let (name, value) = l
                .split_once(':')
                .ok_or_else(|| Error::PostFit(format!("malformed fit-value line '{l}'")))?;
            let value = value
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::PostFit(format!("bad value in fit-value line '{l}'")))?;
            Ok((name.trim().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tau_inference::tree::{BEST_FIT_QUANTILE, SCAN_QUANTILE};

    fn tree() -> ScanTree {
        let mut t = ScanTree::new("tes_DM0", vec!["lumi".into(), "follow".into()]);
        t.push_row(1.0, 0.0, BEST_FIT_QUANTILE, &[0.0, 0.0]).unwrap();
        for i in 0..11 {
            let x = 0.99 + 0.002 * i as f64;
            let d = (x - 1.0) / 0.004;
            t.push_row(x, 0.5 * d * d, SCAN_QUANTILE, &[0.1 * d, 2.0 * (x - 1.0)]).unwrap();
        }
        t
    }

    #[test]
    fn test_records() {
        let t = tree();
        let reader = PostFitReader::new(&t, &ParabolaOptions::default()).unwrap();
        assert_relative_eq!(reader.measurement().unwrap().value, 1.0, epsilon = 1e-9);
        let recs = reader.records(&["lumi".into(), "missing".into(), "follow".into()]);
        assert_eq!(recs.len(), 2);
        assert_relative_eq!(recs[0].value, 0.0, epsilon = 1e-12);
        assert_relative_eq!(recs[1].correlation.unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_matrix_symmetric() {
        let t = tree();
        let reader = PostFitReader::new(&t, &ParabolaOptions::default()).unwrap();
        let m = reader.correlation_matrix(&["lumi".into(), "follow".into(), "tes_DM0".into()], true);
        assert_eq!(m.names.len(), 3);
        for i in 0..3 {
            assert_eq!(m.matrix[i][i], 1.0);
            for j in 0..3 {
                assert_eq!(m.matrix[i][j], m.matrix[j][i]);
            }
        }
        // sorted by spread: lumi varies most
        assert_eq!(m.names[0], "lumi");
    }

    #[test]
    fn test_curves_sorted() {
        let t = tree();
        let reader = PostFitReader::new(&t, &ParabolaOptions::default()).unwrap();
        let c = reader.curves(&["follow".into()]).unwrap();
        assert_eq!(c[0].poi.len(), 12);
        assert!(c[0].poi.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(c[0].best_fit, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_single_row_tree_reads_without_parabola() {
        let mut t = ScanTree::new("tes_DM0", vec!["lumi".into()]);
        t.push_row(1.004, 0.0, BEST_FIT_QUANTILE, &[0.3]).unwrap();
        let reader = PostFitReader::new(&t, &ParabolaOptions::default()).unwrap();
        assert!(reader.interval().is_none());
        assert_eq!(reader.window(), None);
        assert_eq!(reader.best_fit_poi(), Some(1.004));
        assert_eq!(reader.fit_values(&["lumi".into()]), vec![("lumi".to_string(), 0.3)]);
        let recs = reader.records(&["lumi".into()]);
        assert_eq!(recs[0].error, 0.0);
        assert_eq!(recs[0].correlation, None);
        let m = reader.correlation_matrix(&["lumi".into(), "tes_DM0".into()], false);
        assert_eq!(m.matrix, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(matches!(reader.curves(&["lumi".into()]), Err(Error::PostFit(_))));
    }

    #[test]
    fn test_fit_values_file() {
        let path = std::env::temp_dir().join(format!("tau_fitvals_{}", std::process::id())).join(fit_values_file_name(
            "_it",
            "UL2018-13TeV",
            "DM0",
        ));
        write_fit_values(&path, &[("lumi".into(), 0.25), ("tes_DM0".into(), 1.002)]).unwrap();
        let back = read_fit_values(&path).unwrap();
        assert_eq!(back, vec![("lumi".to_string(), 0.25), ("tes_DM0".to_string(), 1.002)]);
        assert!(path.ends_with("FitparameterValues__it_UL2018-13TeV_DM0.txt"));
    }

    #[test]
    fn test_matrix_from_fit() {
        let fit = FitResult::new(vec!["a".into(), "b".into()], vec![0.0, 0.0], vec![1.0, 2.0], 0.0, true, 1)
            .with_covariance(vec![1.0, 1.0, 1.0, 4.0], true);
        let m = CorrelationMatrix::from_fit(&fit).unwrap();
        assert_relative_eq!(m.get("a", "b").unwrap(), 0.5);
        let bad = FitResult::new(vec!["a".into()], vec![0.0], vec![1.0], 0.0, true, 1);
        assert!(matches!(CorrelationMatrix::from_fit(&bad), Err(Error::PostFit(_))));
    }
}
