//! Security error types.

use thiserror::Error;

/// Errors from security configuration.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("unknown login method: {0}")]
    UnknownLoginMethod(String),

    #[error("invalid iteration count: {0}")]
    InvalidIterations(u32),

    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
}
