//! # tau-hist
//!
//! Histogram substrate of the template builder: 1D/2D histograms, the
//! selection/weight expression engine, single-pass filling, event sources
//! and the shapes file that stores templates per region.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod expr;
pub mod filler;
pub mod histogram;
pub mod shapes;
pub mod source;

pub use expr::CompiledExpr;
pub use filler::{FilledHistogram, HistogramSpec, fill_histograms};
pub use histogram::{Hist1D, Hist2D, find_bin, flat_index, fold_bin, unflat_index};
pub use shapes::{DATA_OBS, RegionShapes, ShapeFile, ShapeMeta};
pub use source::{ColumnTable, DirectorySource, EventSource, MemorySource};
