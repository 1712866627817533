//! Core error types.

use thiserror::Error;

/// Errors from registration and composition in the request core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("host not found: {host}")]
    HostNotFound { host: String },

    #[error("host already exists: {host}")]
    HostExists { host: String },

    #[error("context not found: {host}{path}")]
    ContextNotFound { host: String, path: String },

    #[error("context already exists: {host}{path}")]
    ContextExists { host: String, path: String },

    #[error("invalid pool bounds: size {size} exceeds limit {limit}")]
    InvalidPoolBounds { size: usize, limit: usize },

    #[error("valve '{name}' added to the pipeline twice")]
    DuplicateValve { name: String },
}

impl CoreError {
    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while a request travels through the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("valve '{valve}' failed: {reason}")]
    Valve { valve: String, reason: String },
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::Handler`] error.
    pub fn handler(reason: impl Into<String>) -> Self {
        PipelineError::Handler(reason.into())
    }

    pub fn valve(valve: &str, reason: impl Into<String>) -> Self {
        PipelineError::Valve {
            valve: valve.to_string(),
            reason: reason.into(),
        }
    }
}
