//! Explicit analysis context passed into every stage.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Analysis channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// mu + tau_h
    Mt,
    /// e + tau_h
    Et,
    /// tau_h + tau_h
    Tt,
    /// mu + mu (Z -> mumu control region)
    Mm,
}

impl Channel {
    /// Short channel label used in file and datacard names.
    pub fn short(&self) -> &'static str {
        match self {
            Channel::Mt => "mt",
            Channel::Et => "et",
            Channel::Tt => "tt",
            Channel::Mm => "mm",
        }
    }

    /// Parse a channel from its short (`mt`) or long (`mutau`) form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mt" | "mutau" => Ok(Channel::Mt),
            "et" | "etau" => Ok(Channel::Et),
            "tt" | "tautau" => Ok(Channel::Tt),
            "mm" | "mumu" => Ok(Channel::Mm),
            other => Err(Error::Config(format!("unknown channel '{other}' (expected mt|et|tt|mm)"))),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Era, luminosity, centre-of-mass energy and channel of one analysis job.
///
/// Stages never read process-wide state; everything era-dependent comes from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Data-taking era (e.g. `UL2018`, `2022_postEE`).
    pub era: String,
    /// Integrated luminosity in fb^-1.
    pub lumi: f64,
    /// Centre-of-mass energy in TeV.
    pub cme: f64,
    /// Analysis channel.
    pub channel: Channel,
}

impl Context {
    /// Build a context from an era name, looking up the luminosity.
    ///
    /// Unknown eras are a configuration error; use [`Context::new`] to pass
    /// an explicit luminosity instead.
    pub fn from_era(era: &str, channel: Channel) -> Result<Self> {
        let lumi = lumi_for_era(era)
            .ok_or_else(|| Error::Config(format!("no luminosity known for era '{era}'")))?;
        Ok(Self { era: era.to_string(), lumi, cme: cme_for_era(era), channel })
    }

    /// Build a context with an explicit luminosity.
    pub fn new(era: impl Into<String>, lumi: f64, channel: Channel) -> Self {
        let era = era.into();
        let cme = cme_for_era(&era);
        Self { era, lumi, cme, channel }
    }

    /// Era label with the energy suffix, e.g. `UL2018-13TeV`.
    pub fn era_label(&self) -> String {
        if self.cme.fract() == 0.0 {
            format!("{}-{}TeV", self.era, self.cme as i64)
        } else {
            format!("{}-{}TeV", self.era, self.cme).replace('.', "p")
        }
    }
}

/// Integrated luminosity (fb^-1) for the eras known to the analysis.
pub fn lumi_for_era(era: &str) -> Option<f64> {
    let lumi = match era {
        "2016" => 36.5,
        "2017" | "UL2017" => 41.4,
        "2018" | "UL2018" | "UL2018_v10" => 59.5,
        "UL2016_preVFP" => 19.5,
        "UL2016_postVFP" | "UL2016" => 16.8,
        "2022_preEE" => 7.98,
        "2022_postEE" => 26.67,
        "2023C" => 17.79,
        "2023D" => 9.45,
        _ => return None,
    };
    Some(lumi)
}

/// Centre-of-mass energy (TeV): Run-3 eras run at 13.6 TeV.
pub fn cme_for_era(era: &str) -> f64 {
    if era.starts_with("2022") || era.starts_with("2023") || era.starts_with("2024") {
        13.6
    } else {
        13.0
    }
}
