//! Server error types.

use crate::lifecycle::LifecycleState;
use thiserror::Error;

/// A lifecycle operation was called in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{component}: cannot {operation} in state {state}")]
pub struct LifecycleError {
    pub component: String,
    pub operation: &'static str,
    pub state: LifecycleState,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tollgate_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] tollgate_core::CoreError),

    #[error("auth error: {0}")]
    Auth(#[from] tollgate_auth::AuthError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("endpoint not bound")]
    NotBound,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("connection aborted by shutdown")]
    ShuttingDown,
}

impl ServerError {
    /// Whether the error ends one connection only, leaving the endpoint
    /// serving others.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::Protocol(_)
                | ServerError::TlsHandshake(_)
                | ServerError::ShuttingDown
        )
    }
}
