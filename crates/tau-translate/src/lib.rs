//! # tau-translate
//!
//! From an analysis setup to fit inputs:
//! - YAML analysis setup and its validation
//! - sample arena (split, merge, rename, shift) and weight algebra
//! - template builder producing the per-observable shapes file
//! - Combine-style datacard assembly, parsing and combination

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod datacard;
pub mod samples;
pub mod templates;
pub mod weight;

pub use config::{AnalysisSetup, Effect, ShiftMode, is_signal, join_cuts};
pub use datacard::{
    AutoMcStats, Datacard, DatacardBuilder, EffectValue, NuisanceRow, ParamLine, ProcessColumn, RateParam, RowKind,
    ShapesLine, combine_cards, tes_parameter, tid_parameter,
};
pub use samples::{Sample, SampleArena, SampleId};
pub use templates::{ShapeCheck, TemplateBuilder, TemplatePlan, check_shapes, tes_grid, tes_template_name};
pub use weight::WeightExpr;
