//! Error Handling
//!
//! A single error type covers every failure the client can surface. Errors are
//! grouped into coarse categories so callers can tell a misconfiguration (fatal,
//! never retried) apart from a transport failure or a locally recovered decode
//! problem.
//!
//! A stalled first token is deliberately *not* an error: transports report it as
//! [`StreamSignal::NoData`](crate::transport::StreamSignal::NoData) so a caller can
//! render "no response" instead of failing.

use thiserror::Error;

/// Coarse error category used for presentation and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unknown model mapping or invalid settings. Surfaced immediately.
    Configuration,
    /// Connection, HTTP status, or broker failure.
    Transport,
    /// A single malformed frame or message.
    Decode,
    /// Execution-context failures inside the client itself.
    Internal,
}

/// Errors produced by the inference streaming client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The logical model name has no transport mapping.
    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    /// Invalid or missing settings.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The HTTP endpoint answered with a non-success status.
    #[error("HTTP error {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Connection-level HTTP failure.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Broker connection, publish, consumer, or fetch failure.
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// A frame or message could not be decoded as a response fragment.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// The private execution context could not be created or crashed.
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl InferenceError {
    /// Build a broker error from anything displayable.
    pub fn broker(context: &str, err: impl std::fmt::Display) -> Self {
        Self::BrokerError(format!("{context}: {err}"))
    }

    /// Category of this error.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownModel { .. } | Self::ConfigurationError(_) => {
                ErrorCategory::Configuration
            }
            Self::HttpStatus { .. } | Self::HttpError(_) | Self::BrokerError(_) => {
                ErrorCategory::Transport
            }
            Self::DecodeError(_) => ErrorCategory::Decode,
            Self::RuntimeError(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error came from the network layer.
    pub const fn is_transport(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport)
    }

    /// Whether this error is a configuration problem.
    pub const fn is_configuration(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// HTTP status code, when the error carries one.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        Self::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for InferenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::DecodeError(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InferenceError>;
