//! # tau-core
//!
//! Core types shared by every taufit stage: the error type, the explicit
//! analysis [`Context`], fit results and cooperative cancellation.

#![warn(missing_docs)]

pub mod cancel;
pub mod context;
pub mod error;
pub mod traits;
pub mod types;

pub use cancel::CancelToken;
pub use context::{Channel, Context, cme_for_era, lumi_for_era};
pub use error::{Error, Result};
pub use traits::LikelihoodModel;
pub use types::{FitResult, Measurement};

/// taufit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
