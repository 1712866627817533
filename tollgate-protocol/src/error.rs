//! Protocol error types.

use crate::message::Status;
use thiserror::Error;

/// Errors raised while framing bytes into requests or responses into bytes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad framing: {0}")]
    BadFraming(String),

    #[error("header block too large: {size} bytes (max {max})")]
    HeadersTooLarge { size: usize, max: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid packet magic: {0:02x?}")]
    InvalidMagic([u8; 2]),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::BadFraming`] error.
    pub fn bad(reason: impl Into<String>) -> Self {
        ProtocolError::BadFraming(reason.into())
    }

    /// Returns the client-error status sent before the connection is closed,
    /// or `None` when no response should be attempted.
    pub fn status(&self) -> Option<Status> {
        match self {
            ProtocolError::BadFraming(_) | ProtocolError::InvalidMagic(_) => {
                Some(Status::BAD_REQUEST)
            }
            ProtocolError::HeadersTooLarge { .. } => Some(Status::HEADERS_TOO_LARGE),
            ProtocolError::PayloadTooLarge { .. } => Some(Status::PAYLOAD_TOO_LARGE),
            ProtocolError::UnsupportedMethod(_) => Some(Status::NOT_IMPLEMENTED),
            ProtocolError::UnsupportedVersion(_) => Some(Status::VERSION_NOT_SUPPORTED),
            ProtocolError::Io(_) => None,
        }
    }

    /// Returns whether the connection must be closed after this error.
    ///
    /// Every framing error leaves the byte stream at an unknown position, so
    /// no further request can be read from it.
    pub fn is_fatal(&self) -> bool {
        true
    }
}
