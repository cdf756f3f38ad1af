//! Nuisance pulls and constraints from a best fit.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};
use tau_inference::{BestFit, Parameter, ParameterKind};

/// Pulls of every constrained parameter, plus the POI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullsArtifact {
    pub schema_version: String,
    pub meta: PullsMeta,
    pub poi: String,
    pub ordering: PullOrder,
    pub entries: Vec<PullEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullsMeta {
    pub tool: String,
    pub tool_version: String,
    pub created_unix_ms: u128,
}

/// Entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullOrder {
    /// Lexicographic by name.
    #[default]
    Name,
    /// Largest post-fit sigma first.
    Sigma,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullEntry {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefit_center: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefit_sigma: Option<f64>,
    pub postfit_center: f64,
    pub postfit_sigma: f64,
    pub pull: f64,
    pub constraint: f64,
}

impl PullsArtifact {
    /// Entry by name.
    pub fn entry(&self, name: &str) -> Option<&PullEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::write_json(path, self)
    }
}

fn now_unix_ms() -> Result<u128> {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Computation(format!("system time error: {e}")))?;
    Ok(d.as_millis())
}

/// Pulls artifact from the model parameters and a best fit.
///
/// Gaussian parameters are pulled against their constraint; bin-by-bin
/// parameters against 1 with width `1/sqrt(tau)`. The POI is listed with
/// pull 0. Other free parameters are skipped.
pub fn pulls_artifact(parameters: &[Parameter], fit: &BestFit, order: PullOrder) -> Result<PullsArtifact> {
    let result = &fit.result;
    if result.parameters.len() != parameters.len() || result.uncertainties.len() != parameters.len() {
        return Err(Error::Validation(format!(
            "fit/model parameter length mismatch: fit={} model={}",
            result.parameters.len(),
            parameters.len()
        )));
    }

    let mut entries = Vec::new();
    for (i, p) in parameters.iter().enumerate() {
        let post_center = result.parameters[i];
        let post_sigma = result.uncertainties[i];
        let prefit = match p.kind {
            ParameterKind::Gaussian { mean, sigma } => Some((mean, sigma, "nuisance")),
            ParameterKind::PoissonStat { tau } if tau > 0.0 => Some((1.0, 1.0 / tau.sqrt(), "bin_stat")),
            _ => None,
        };
        match prefit {
            Some((center, sigma, kind)) => entries.push(PullEntry {
                name: p.name.clone(),
                kind: kind.to_string(),
                prefit_center: Some(center),
                prefit_sigma: Some(sigma),
                postfit_center: post_center,
                postfit_sigma: post_sigma,
                pull: (post_center - center) / sigma,
                constraint: post_sigma / sigma,
            }),
            None if p.name == fit.poi => entries.push(PullEntry {
                name: p.name.clone(),
                kind: "poi".to_string(),
                prefit_center: None,
                prefit_sigma: None,
                postfit_center: post_center,
                postfit_sigma: post_sigma,
                pull: 0.0,
                constraint: 1.0,
            }),
            None => {}
        }
    }

    match order {
        PullOrder::Name => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        PullOrder::Sigma => {
            entries.sort_by(|a, b| b.postfit_sigma.total_cmp(&a.postfit_sigma).then_with(|| a.name.cmp(&b.name)))
        }
    }

    Ok(PullsArtifact {
        schema_version: "taufit_pulls_v1".to_string(),
        meta: PullsMeta {
            tool: "taufit".to_string(),
            tool_version: tau_core::VERSION.to_string(),
            created_unix_ms: now_unix_ms()?,
        },
        poi: fit.poi.clone(),
        ordering: order,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tau_core::{FitResult, Measurement};

    fn param(name: &str, kind: ParameterKind) -> Parameter {
        Parameter { name: name.into(), kind, init: 0.0, bounds: (-5.0, 5.0) }
    }

    #[test]
    fn test_pulls() {
        let params = vec![
            param("lumi", ParameterKind::Gaussian { mean: 0.0, sigma: 1.0 }),
            param("tes_DM0", ParameterKind::Free),
            param("prop_binDM0_bin0", ParameterKind::PoissonStat { tau: 100.0 }),
            param("other_free", ParameterKind::Free),
        ];
        let result = FitResult::new(
            params.iter().map(|p| p.name.clone()).collect(),
            vec![0.5, 1.002, 1.02, 3.0],
            vec![0.8, 0.004, 0.05, 1.0],
            10.0,
            true,
            42,
        );
        let fit = BestFit {
            poi: "tes_DM0".into(),
            interval: Measurement::new(1.002, 0.004, 0.004),
            result,
            correlations: Vec::new(),
        };
        let art = pulls_artifact(&params, &fit, PullOrder::Name).unwrap();
        assert_eq!(art.entries.len(), 3);
        let lumi = art.entry("lumi").unwrap();
        assert_relative_eq!(lumi.pull, 0.5);
        assert_relative_eq!(lumi.constraint, 0.8);
        let stat = art.entry("prop_binDM0_bin0").unwrap();
        assert_relative_eq!(stat.pull, 0.2, epsilon = 1e-12);
        assert_relative_eq!(stat.constraint, 0.5, epsilon = 1e-12);
        assert_eq!(art.entry("tes_DM0").unwrap().kind, "poi");
        assert!(art.entry("other_free").is_none());

        let by_sigma = pulls_artifact(&params, &fit, PullOrder::Sigma).unwrap();
        let names: Vec<&str> = by_sigma.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["lumi", "prop_binDM0_bin0", "tes_DM0"]);
    }
}
