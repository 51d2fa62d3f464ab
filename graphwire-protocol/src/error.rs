//! Protocol error types and status codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while framing, packing or unpacking.
///
/// Every variant except [`ProtocolError::UnsupportedValue`] and
/// [`ProtocolError::InvalidRequest`] describes bytes received from a peer
/// that cannot be trusted any further; callers treat them as fatal for the
/// connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid handshake preamble: {0:02x?}")]
    InvalidPreamble([u8; 4]),

    #[error("no supported protocol version in proposals {0:?}")]
    NoSupportedVersion([u32; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid chunk size: {0} (must be between 1 and 65535)")]
    InvalidChunkSize(usize),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown structure signature {signature:#04x} for protocol v{version}")]
    UnknownStructure { signature: u8, version: u32 },

    #[error("structure {signature:#04x} expects {expected} fields, got {actual}")]
    StructureArity {
        signature: u8,
        expected: usize,
        actual: usize,
    },

    #[error("truncated input: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("value nesting exceeds depth {0}")]
    DepthExceeded(usize),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// A well-formed request whose field values break the message's rules.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedMessage`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(reason.into())
    }

    /// Returns whether the byte cursor can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::UnsupportedValue(_) | ProtocolError::InvalidRequest(_)
        )
    }

    /// Shorthand for a [`ProtocolError::InvalidRequest`].
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidRequest(reason.into())
    }
}

/// Status codes carried in FAILURE responses.
///
/// The string form follows `Neo.<Classification>.<Category>.<Title>` and is
/// part of the wire contract. Codes produced by the query engine are passed
/// through as plain strings and never mapped onto this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    // Request errors
    RequestInvalid,
    RequestInvalidFormat,

    // Security errors
    Unauthorized,

    // Statement errors
    SyntaxError,
    ParameterMissing,
    TypeError,

    // Transaction errors
    TransactionTerminated,
    TransactionNotFound,

    // Database errors
    UnknownError,
}

impl Status {
    /// Returns the wire code string.
    pub fn code(&self) -> &'static str {
        match self {
            Status::RequestInvalid => "Neo.ClientError.Request.Invalid",
            Status::RequestInvalidFormat => "Neo.ClientError.Request.InvalidFormat",
            Status::Unauthorized => "Neo.ClientError.Security.Unauthorized",
            Status::SyntaxError => "Neo.ClientError.Statement.SyntaxError",
            Status::ParameterMissing => "Neo.ClientError.Statement.ParameterMissing",
            Status::TypeError => "Neo.ClientError.Statement.TypeError",
            Status::TransactionTerminated => "Neo.TransientError.Transaction.Terminated",
            Status::TransactionNotFound => "Neo.ClientError.Transaction.TransactionNotFound",
            Status::UnknownError => "Neo.DatabaseError.General.UnknownError",
        }
    }

    /// Returns whether a client may retry the failed work unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Status::TransactionTerminated)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Status::RequestInvalid.code(),
            "Neo.ClientError.Request.Invalid"
        );
        assert_eq!(
            Status::Unauthorized.code(),
            "Neo.ClientError.Security.Unauthorized"
        );
        assert_eq!(
            format!("{}", Status::UnknownError),
            "Neo.DatabaseError.General.UnknownError"
        );
    }

    #[test]
    fn test_status_retryable() {
        assert!(Status::TransactionTerminated.is_retryable());

        assert!(!Status::RequestInvalid.is_retryable());
        assert!(!Status::SyntaxError.is_retryable());
        assert!(!Status::Unauthorized.is_retryable());
    }

    #[test]
    fn test_fatality() {
        assert!(ProtocolError::malformed("bad marker").is_fatal());
        assert!(ProtocolError::Truncated { needed: 2 }.is_fatal());
        assert!(ProtocolError::FrameTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(!ProtocolError::UnsupportedValue("node".into()).is_fatal());
        assert!(!ProtocolError::invalid_request("tx_timeout").is_fatal());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidPreamble([0xde, 0xad, 0xbe, 0xef]);
        assert!(err.to_string().contains("preamble"));

        let err = ProtocolError::UnknownStructure {
            signature: 0x44,
            version: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x44"));
        assert!(msg.contains("v1"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::StructureArity {
            signature: 0x4e,
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("expects 3"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}
