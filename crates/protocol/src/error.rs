//! Error types for the protocol crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code carried in every error response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown session or job identifier.
    NotFound,
    /// A live session already uses the requested name.
    DuplicateName,
    /// A command is already in flight on the session.
    SessionBusy,
    /// The configured session limit was reached.
    TooManySessions,
    /// A subprocess could not be started.
    SpawnFailure,
    /// A command exceeded its wall-clock budget.
    Timeout,
    /// Pipe read/write failure.
    IoError,
    /// The session's process has exited.
    Terminated,
    /// The request body or parameters were malformed.
    BadRequest,
    /// No credential was supplied.
    Unauthorized,
    /// A credential was supplied but did not match.
    InvalidCredentials,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::DuplicateName => "DUPLICATE_NAME",
            ErrorCode::SessionBusy => "SESSION_BUSY",
            ErrorCode::TooManySessions => "TOO_MANY_SESSIONS",
            ErrorCode::SpawnFailure => "SPAWN_FAILURE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Terminated => "TERMINATED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: ErrorCode,
}

impl ErrorBody {
    /// Creates a new error body.
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Protocol error type for encoding and decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The server answered with an error body.
    #[error("server error ({code}): {message}")]
    Server {
        /// Code reported by the server.
        code: ErrorCode,
        /// Message reported by the server.
        message: String,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<ErrorBody> for ProtocolError {
    fn from(body: ErrorBody) -> Self {
        ProtocolError::Server {
            code: body.code,
            message: body.error,
        }
    }
}
