//! Server error types.

use crate::config::ConfigError;
use graphwire_protocol::{ProtocolError, Status};
use std::time::Duration;
use thiserror::Error;

/// Server errors.
///
/// These end a connection (or stop the server). Failures of individual
/// requests never become a `ServerError`; they are answered with FAILURE.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("request {0} is not allowed before INIT/HELLO")]
    NotInitialized(&'static str),

    #[error("in-flight execution did not stop within {0:?}")]
    ResetTimeout(Duration),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl ServerError {
    /// Status code reported to a client when the error is surfaced before
    /// closing.
    pub fn status(&self) -> Status {
        match self {
            ServerError::AuthFailed(_) => Status::Unauthorized,
            ServerError::Protocol(ProtocolError::InvalidRequest(_))
            | ServerError::Protocol(ProtocolError::UnsupportedValue(_)) => Status::RequestInvalid,
            ServerError::Protocol(_) | ServerError::NotInitialized(_) | ServerError::Handshake(_) => {
                Status::RequestInvalidFormat
            }
            ServerError::ResetTimeout(_) => Status::TransactionTerminated,
            _ => Status::UnknownError,
        }
    }

    /// Returns whether the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Io(e) | ServerError::Protocol(ProtocolError::Io(e)) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
