//! Error types for pipegate.
//!
//! Every failure carries an [`ErrorKind`] tag; callers dispatch on the kind
//! (and its status code) rather than on the variant itself.

use std::fmt;

use thiserror::Error;

/// Result type alias using the pipegate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or mismatched credential.
    AuthenticationError,
    /// Requested command is not enabled in the allow-list.
    CommandNotAllowed,
    /// The caller's token bucket is empty.
    RateLimitExceeded,
    /// Unparsable request body or missing required parameter.
    MalformedInput,
    /// Unknown, expired, or already torn-down session.
    SessionUnavailable,
    /// Anything unexpected.
    InternalFailure,
}

impl ErrorKind {
    /// HTTP status code associated with this kind.
    pub const fn status_code(self) -> u16 {
        match self {
            Self::AuthenticationError => 401,
            Self::CommandNotAllowed => 403,
            Self::RateLimitExceeded => 429,
            Self::MalformedInput => 400,
            Self::SessionUnavailable => 503,
            Self::InternalFailure => 500,
        }
    }

    /// Wire name used in error response bodies.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication_error",
            Self::CommandNotAllowed => "command_not_allowed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::MalformedInput => "malformed_input",
            Self::SessionUnavailable => "session_unavailable",
            Self::InternalFailure => "internal_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid bearer credential
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Command not mapped to `true` in the allow-list
    #[error("Command not allowed: {command}")]
    CommandNotAllowed { command: String },

    /// Token bucket exhausted for a caller identity
    #[error("Rate limit exceeded for {identity}")]
    RateLimitExceeded { identity: String },

    /// Bad request body or missing parameter
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Session does not exist or is no longer active
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    /// Worker process could not be started
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal fault
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::CommandNotAllowed { .. } => ErrorKind::CommandNotAllowed,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::MalformedInput(_) | Self::Json(_) => ErrorKind::MalformedInput,
            Self::SessionUnavailable(_) => ErrorKind::SessionUnavailable,
            Self::Spawn(_) | Self::Config(_) | Self::Internal(_) | Self::Io(_) => {
                ErrorKind::InternalFailure
            }
        }
    }

    /// HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}
