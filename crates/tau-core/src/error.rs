//! Error types for taufit

use thiserror::Error;

/// taufit error type
///
/// Variants follow the pipeline's error kinds: configuration problems abort
/// before any I/O, input and template problems are fatal for one region,
/// fit problems are local to a scan point unless they dominate.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Malformed setup, missing required option, or inconsistent declaration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing file, tree or branch
    #[error("Input error [{stage}] {context}: {message}")]
    Input {
        /// Pipeline stage reporting the error
        stage: &'static str,
        /// Region / process the error concerns
        context: String,
        /// Human readable message
        message: String,
    },

    /// Bin-edge mismatch, missing Up/Down pair, negative observed yield, empty signal
    #[error("Template integrity error in region '{region}': {message}")]
    TemplateIntegrity {
        /// Region whose templates are inconsistent
        region: String,
        /// Human readable message
        message: String,
    },

    /// Non-convergence or indefinite covariance that cannot be recovered
    #[error("Fit error: {0}")]
    Fit(String),

    /// Zero-column response, negative iteration count
    #[error("Unfolding error: {0}")]
    Unfolding(String),

    /// Missing parameter branch or too few scan points
    #[error("Post-fit error: {0}")]
    PostFit(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Cooperative cancellation was requested
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Build an [`Error::Input`] for a given stage and context.
    pub fn input(stage: &'static str, context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Input { stage, context: context.into(), message: message.into() }
    }

    /// Build an [`Error::TemplateIntegrity`] for a region.
    pub fn template(region: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TemplateIntegrity { region: region.into(), message: message.into() }
    }

    /// Whether the error is local to one region rather than fatal for the stage.
    ///
    /// Input and template-integrity errors stay with the region that raised
    /// them; everything else stops the stage.
    pub fn is_region_local(&self) -> bool {
        matches!(self, Error::Input { .. } | Error::TemplateIntegrity { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error_message_carries_context() {
        let e = Error::input("templates", "DM0/ZTT", "missing branch 'm_2'");
        let msg = e.to_string();
        assert!(msg.contains("templates"));
        assert!(msg.contains("DM0/ZTT"));
        assert!(msg.contains("m_2"));
        assert!(e.is_region_local());
    }

    #[test]
    fn test_config_error_is_not_region_local() {
        assert!(!Error::Config("no regions".into()).is_region_local());
        assert!(!Error::Unfolding("negative iterations".into()).is_region_local());
    }
}
