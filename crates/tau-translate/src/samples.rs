//! Sample arena.
//!
//! Samples are immutable records addressed by [`SampleId`]. Splitting,
//! merging, renaming and shifting create new records and return their
//! handles; nothing is copied except the small component descriptions.

use std::collections::HashMap;

use serde::Serialize;
use tau_core::{Context, Error, Result};

use crate::config::{AnalysisSetup, join_cuts};
use crate::weight::WeightExpr;

/// Handle to a sample in a [`SampleArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SampleId(usize);

/// One input contributing to a sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    /// Input name resolved by the event source.
    pub input: String,
    /// Normalization (lumi * xsec / sumw, or 1).
    pub norm: f64,
    /// Component weight.
    pub weight: WeightExpr,
    /// Extra selection of this component.
    pub cut: String,
}

/// An immutable sample record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Process name.
    pub name: String,
    /// Display title.
    pub title: String,
    /// Whether the sample is observed data.
    pub is_data: bool,
    /// Contributing inputs.
    pub components: Vec<Component>,
    /// Energy-scale factor applied to shifted branches (1 for unshifted samples).
    pub scale: f64,
}

/// Arena of samples plus the current `process name -> handle` table.
#[derive(Debug, Clone, Default)]
pub struct SampleArena {
    samples: Vec<Sample>,
    table: HashMap<String, SampleId>,
}

impl SampleArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample and register it under its name.
    pub fn add(&mut self, sample: Sample) -> SampleId {
        let id = SampleId(self.samples.len());
        self.table.insert(sample.name.clone(), id);
        self.samples.push(sample);
        id
    }

    fn push_unregistered(&mut self, sample: Sample) -> SampleId {
        let id = SampleId(self.samples.len());
        self.samples.push(sample);
        id
    }

    /// Sample by handle.
    pub fn get(&self, id: SampleId) -> &Sample {
        &self.samples[id.0]
    }

    /// Handle of the sample currently registered as `name`.
    pub fn find(&self, name: &str) -> Option<SampleId> {
        self.table.get(name).copied()
    }

    /// Like [`SampleArena::find`] but a configuration error when absent.
    pub fn require(&self, name: &str) -> Result<SampleId> {
        self.find(name).ok_or_else(|| Error::Config(format!("no sample provides process '{name}'")))
    }

    /// Split `id` into pieces selected by `cuts`; the pieces replace it in the table.
    pub fn split(&mut self, id: SampleId, pieces: &[(String, String)]) -> Vec<SampleId> {
        let base = self.get(id).clone();
        self.table.remove(&base.name);
        pieces
            .iter()
            .map(|(name, cut)| {
                let mut s = base.clone();
                s.name = name.clone();
                s.title = name.clone();
                for c in &mut s.components {
                    c.cut = join_cuts(&c.cut, cut);
                }
                self.add(s)
            })
            .collect()
    }

    /// Merge several samples into one process; the inputs leave the table.
    pub fn merge(&mut self, name: &str, ids: &[SampleId]) -> Result<SampleId> {
        let first = ids.first().ok_or_else(|| Error::Config(format!("cannot merge nothing into '{name}'")))?;
        let is_data = self.get(*first).is_data;
        if ids.iter().any(|i| self.get(*i).is_data != is_data) {
            return Err(Error::Config(format!("cannot merge data and simulation into '{name}'")));
        }
        let mut components = Vec::new();
        for id in ids {
            let s = self.get(*id);
            components.extend(s.components.iter().cloned());
            let old = s.name.clone();
            self.table.remove(&old);
        }
        Ok(self.add(Sample { name: name.to_string(), title: name.to_string(), is_data, components, scale: 1.0 }))
    }

    /// Re-register `id` under a new name.
    pub fn rename(&mut self, id: SampleId, name: &str) -> SampleId {
        let mut s = self.get(id).clone();
        self.table.remove(&s.name);
        s.name = name.to_string();
        self.add(s)
    }

    /// Clone `id` with every input suffixed by `input_suffix` and the name by `name_suffix`.
    ///
    /// The shifted sample is not registered in the table.
    pub fn shift(&mut self, id: SampleId, input_suffix: &str, name_suffix: &str, scale: f64) -> SampleId {
        let mut s = self.get(id).clone();
        s.name = format!("{}{}", s.name, name_suffix);
        s.scale *= scale;
        for c in &mut s.components {
            c.input.push_str(input_suffix);
        }
        self.push_unregistered(s)
    }

    /// Clone `id` with the weight factor `nominal` replaced by `alternative`.
    pub fn reweight(&mut self, id: SampleId, nominal: &str, alternative: &str, name_suffix: &str) -> SampleId {
        let mut s = self.get(id).clone();
        s.name = format!("{}{}", s.name, name_suffix);
        for c in &mut s.components {
            c.weight = c.weight.replace(nominal, alternative);
        }
        self.push_unregistered(s)
    }

    /// Multiply the weight of every component of `id` in place of the registered sample.
    pub fn add_weight(&mut self, id: SampleId, weight: &str) -> SampleId {
        let mut s = self.get(id).clone();
        for c in &mut s.components {
            c.weight = c.weight.with(weight);
        }
        self.add(s)
    }

    /// Build the arena described by a setup: load, join, split, rename, then
    /// apply the era's scale factors.
    pub fn from_setup(setup: &AnalysisSetup, ctx: &Context) -> Result<Self> {
        let mut arena = SampleArena::new();
        let common = WeightExpr::parse(&setup.samples.weight);
        for s in &setup.samples.list {
            let norm = match (s.data, s.xsec, s.sumw) {
                (false, Some(xsec), Some(sumw)) if sumw > 0.0 => ctx.lumi * 1000.0 * xsec / sumw,
                (false, Some(_), _) => {
                    return Err(Error::Config(format!("sample '{}' has xsec but no positive sumw", s.name)));
                }
                _ => 1.0,
            };
            let weight = if s.data { WeightExpr::one() } else { common.with(&s.weight) };
            let name = if s.data { setup.samples.data.clone() } else { s.name.clone() };
            arena.add(Sample {
                title: if s.title.is_empty() { name.clone() } else { s.title.clone() },
                name,
                is_data: s.data,
                components: s
                    .inputs
                    .iter()
                    .map(|i| Component { input: i.clone(), norm, weight: weight.clone(), cut: String::new() })
                    .collect(),
                scale: 1.0,
            });
        }

        for (name, members) in setup.samples.join.iter() {
            let ids = members.iter().map(|m| arena.require(m)).collect::<Result<Vec<_>>>()?;
            arena.merge(name, &ids)?;
        }
        for (name, pieces) in setup.samples.split.iter() {
            let id = arena.require(name)?;
            let pieces: Vec<(String, String)> = pieces.iter().map(|p| (p.name.clone(), p.cut.clone())).collect();
            arena.split(id, &pieces);
        }
        for (old, new) in setup.samples.rename.iter() {
            let id = arena.require(old)?;
            arena.rename(id, new);
        }
        for (key, sf) in setup.scale_factors.iter() {
            let Some(weight) = sf.weight_for_era(&ctx.era, &setup.qcd.os_cut) else {
                continue;
            };
            for p in &sf.processes {
                let id = arena.require(p)?;
                tracing::debug!(scale_factor = key, process = %p, %weight, "applying scale factor");
                arena.add_weight(id, &weight);
            }
        }
        for p in &setup.processes {
            if p != "QCD" && arena.find(p).is_none() {
                return Err(Error::Config(format!("no sample provides process '{p}'")));
            }
        }
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::setup;
    use approx::assert_relative_eq;
    use tau_core::Channel;

    #[test]
    fn setup_builds_processes() {
        let ctx = Context::new("UL2018", 59.5, Channel::Mt);
        let arena = SampleArena::from_setup(&setup(), &ctx).unwrap();
        let ztt = arena.get(arena.require("ZTT").unwrap());
        assert_eq!(ztt.components.len(), 1);
        assert_eq!(ztt.components[0].cut, "genmatch_2==5");
        assert_relative_eq!(ztt.components[0].norm, 59.5 * 1000.0 * 2.0 / 1000.0);
        assert!(arena.find("DY").is_none());
        assert!(arena.find("TT").is_none());
        assert!(arena.find("TTT").is_some());
        let vv = arena.get(arena.require("VV").unwrap());
        assert_eq!(vv.components.iter().map(|c| c.input.as_str()).collect::<Vec<_>>(), vec!["WW", "WZ"]);
        assert!(arena.get(arena.require("data_obs").unwrap()).is_data);
    }

    #[test]
    fn scale_factor_applied_for_era() {
        let ctx = Context::new("UL2018", 59.5, Channel::Mt);
        let arena = SampleArena::from_setup(&setup(), &ctx).unwrap();
        let zl = arena.get(arena.require("ZL").unwrap());
        assert!(zl.components[0].weight.to_expr().contains("dm_2==0 ? 1.1"));
        let ctx = Context::new("2016", 36.5, Channel::Mt);
        let arena = SampleArena::from_setup(&setup(), &ctx).unwrap();
        let zl = arena.get(arena.require("ZL").unwrap());
        assert_eq!(zl.components[0].weight.to_expr(), "genweight");
    }

    #[test]
    fn shift_does_not_replace_nominal() {
        let ctx = Context::new("UL2018", 59.5, Channel::Mt);
        let mut arena = SampleArena::from_setup(&setup(), &ctx).unwrap();
        let ztt = arena.require("ZTT").unwrap();
        let shifted = arena.shift(ztt, "_TES0p970", "_TES0.970", 0.97);
        assert_eq!(arena.get(shifted).name, "ZTT_TES0.970");
        assert_eq!(arena.get(shifted).components[0].input, "DYJets_TES0p970");
        assert_relative_eq!(arena.get(shifted).scale, 0.97);
        assert_eq!(arena.require("ZTT").unwrap(), ztt);
    }

    #[test]
    fn merge_rejects_mixed_data() {
        let ctx = Context::new("UL2018", 59.5, Channel::Mt);
        let mut arena = SampleArena::from_setup(&setup(), &ctx).unwrap();
        let ids = vec![arena.require("data_obs").unwrap(), arena.require("VV").unwrap()];
        assert!(arena.merge("bad", &ids).is_err());
    }
}
