//! # tau-viz
//!
//! Post-fit reading for taufit.
//!
//! Turns fit outputs (scan trees, best fits, post-fit shapes, measurement
//! tables) into plot-friendly JSON artifacts and the exported corrections.
//! Drawing is left to the consumer.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::Path;

use serde::Serialize;
use tau_core::Result;

/// Grouping of parameters into plot-sized chunks.
pub mod chunks;
/// Correction-library export.
pub mod corrections;
/// Measurement tables.
pub mod measurement;
/// Parameters, correlations and curves from a scan tree.
pub mod params;
/// Pulls and constraints.
pub mod pulls;
/// Stacked distributions with ratio and residuals.
pub mod stack;

pub use chunks::{BBB_CHUNK, bbb_chunks, chunkify, columnize, find_branches, partition};
pub use corrections::{CorrectionSet, correction_set, parse_category};
pub use measurement::MeasurementTable;
pub use params::{
    CorrelationMatrix, ParameterCurve, ParameterRecord, PostFitReader, ScanParameter, fit_values_file_name,
    read_fit_values, sort_by_sigma, write_fit_values,
};
pub use pulls::{PullEntry, PullOrder, PullsArtifact, pulls_artifact};
pub use stack::{FitStage, StackArtifact, stacks};

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
