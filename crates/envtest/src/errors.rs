//! Error types for envtest.
//!
//! Two families live here:
//! - Configuration-level errors (`SelectionError`, `ConfigError`) which are
//!   fatal and surface before the lifecycle starts.
//! - `FuncError`, returned by user funcs. These never escape a Feature; the
//!   orchestrator attributes them to the originating unit and reports them.

use std::time::Duration;
use thiserror::Error;

/// Top-level error returned when an environment cannot be constructed.
#[derive(Debug, Error)]
pub enum EnvtestError {
    /// Selection filters could not be compiled.
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Configuration could not be loaded or applied.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Malformed selection filter expressions.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// A name filter is not a valid regular expression.
    #[error("Invalid regex for {filter}: {source}")]
    InvalidRegex {
        filter: &'static str,
        #[source]
        source: regex::Error,
    },

    /// A label filter entry is not of the form `key=value`.
    #[error("Invalid label expression for {filter}: {expr:?} (expected key=value)")]
    InvalidLabel { filter: &'static str, expr: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable carried a value that could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },

    /// A write was attempted while the configuration is read-only
    /// (parallel assessments in flight).
    #[error("Configuration is frozen, cannot set {field} during parallel execution")]
    Frozen { field: String },
}

/// Error returned by a Setup, Assess, Teardown, hook or Finish func.
#[derive(Debug, Error)]
pub enum FuncError {
    /// The func failed with a message.
    #[error("{0}")]
    Failed(String),

    /// The ambient context was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// A deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Any other error raised inside the func.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FuncError {
    /// Shorthand for `FuncError::Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns true if this error stems from cancellation or a deadline.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

impl From<ConfigError> for FuncError {
    fn from(err: ConfigError) -> Self {
        Self::Other(err.into())
    }
}
