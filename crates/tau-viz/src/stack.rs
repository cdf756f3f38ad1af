//! Pre-fit and post-fit stacked distributions with data/MC ratio.

use std::path::Path;

use serde::Serialize;
use tau_core::{Error, Result};
use tau_hist::{DATA_OBS, RegionShapes, ShapeFile};

/// Process entries of a post-fit region that are sums, not stack members.
const TOTALS: [&str; 3] = ["TotalSig", "TotalBkg", "TotalProcs"];

/// Fit stage of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FitStage {
    /// Before the fit.
    Prefit,
    /// After the fit.
    Postfit,
}

impl FitStage {
    fn suffix(self) -> &'static str {
        match self {
            FitStage::Prefit => "prefit",
            FitStage::Postfit => "postfit",
        }
    }
}

/// One stacked process.
#[derive(Debug, Clone, Serialize)]
pub struct StackProcess {
    /// Process name.
    pub name: String,
    /// Yield per bin.
    pub yields: Vec<f64>,
}

/// Stack, data and ratio of one region at one fit stage.
#[derive(Debug, Clone, Serialize)]
pub struct StackArtifact {
    /// Region name.
    pub region: String,
    /// Fit stage.
    pub stage: FitStage,
    /// Bin edges.
    pub bin_edges: Vec<f64>,
    /// Stacked processes, in shape-file order.
    pub processes: Vec<StackProcess>,
    /// Total expectation.
    pub total: Vec<f64>,
    /// Uncertainty of the total.
    pub total_error: Vec<f64>,
    /// Observed data.
    pub data: Vec<f64>,
    /// Poisson error of the data.
    pub data_error: Vec<f64>,
    /// Data over total; NaN for an empty total.
    pub ratio: Vec<f64>,
    /// Error of the ratio from the data.
    pub ratio_error: Vec<f64>,
    /// Relative band of the total uncertainty around 1.
    pub band_lo: Vec<f64>,
    /// Upper edge of the band.
    pub band_hi: Vec<f64>,
    /// `(data - total) / sqrt(data + sigma_total^2)`; 0 where undefined.
    pub residual: Vec<f64>,
}

impl StackArtifact {
    /// Build from the `<region>_<stage>` entry of a post-fit shape file.
    pub fn from_shapes(file: &ShapeFile, region: &str, stage: FitStage) -> Result<Self> {
        let key = format!("{region}_{}", stage.suffix());
        let shapes = file
            .region(&key)
            .ok_or_else(|| Error::PostFit(format!("no region '{key}' in post-fit shapes")))?;
        Self::from_region(region, stage, shapes)
    }

    fn from_region(region: &str, stage: FitStage, shapes: &RegionShapes) -> Result<Self> {
        let total_hist = shapes
            .get("TotalProcs")
            .ok_or_else(|| Error::PostFit(format!("no TotalProcs in region '{region}'")))?;
        let data_hist = shapes
            .get(DATA_OBS)
            .ok_or_else(|| Error::PostFit(format!("no {DATA_OBS} in region '{region}'")))?;
        if data_hist.content.len() != total_hist.content.len() {
            return Err(Error::PostFit(format!("data and total binning differ in region '{region}'")));
        }

        let processes = shapes
            .histograms
            .iter()
            .filter(|h| h.name != DATA_OBS && !TOTALS.contains(&h.name.as_str()))
            .map(|h| StackProcess { name: h.name.clone(), yields: h.content.clone() })
            .collect();

        let total = total_hist.content.clone();
        let total_error: Vec<f64> = (0..total.len()).map(|i| total_hist.error(i)).collect();
        let data = data_hist.content.clone();
        let data_error: Vec<f64> = data.iter().map(|d| d.max(0.0).sqrt()).collect();

        let n = total.len();
        let (mut ratio, mut ratio_error) = (Vec::with_capacity(n), Vec::with_capacity(n));
        let (mut band_lo, mut band_hi) = (Vec::with_capacity(n), Vec::with_capacity(n));
        let mut residual = Vec::with_capacity(n);
        for i in 0..n {
            let (t, s) = (total[i], total_error[i]);
            if t.is_finite() && t > 0.0 {
                ratio.push(data[i] / t);
                ratio_error.push(data_error[i] / t);
                band_lo.push((t - s).max(0.0) / t);
                band_hi.push((t + s) / t);
            } else {
                ratio.push(f64::NAN);
                ratio_error.push(f64::NAN);
                band_lo.push(f64::NAN);
                band_hi.push(f64::NAN);
            }
            let denom = (data[i].max(0.0) + s * s).sqrt();
            residual.push(if denom > 0.0 { (data[i] - t) / denom } else { 0.0 });
        }

        Ok(Self {
            region: region.to_string(),
            stage,
            bin_edges: total_hist.edges.clone(),
            processes,
            total,
            total_error,
            data,
            data_error,
            ratio,
            ratio_error,
            band_lo,
            band_hi,
            residual,
        })
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::write_json(path, self)
    }
}

/// Pre-fit and post-fit stacks of every region in a post-fit shape file.
pub fn stacks(file: &ShapeFile) -> Result<Vec<StackArtifact>> {
    let mut out = Vec::new();
    for region in &file.regions {
        let (base, stage) = if let Some(b) = region.name.strip_suffix("_prefit") {
            (b, FitStage::Prefit)
        } else if let Some(b) = region.name.strip_suffix("_postfit") {
            (b, FitStage::Postfit)
        } else {
            tracing::debug!(region = %region.name, "not a fit-stage region, skipped");
            continue;
        };
        out.push(StackArtifact::from_region(base, stage, region)?);
    }
    Ok(out)
}
