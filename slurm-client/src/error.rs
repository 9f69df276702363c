//! Error types for the Slurm REST client
//!
//! Every failure a caller can observe is either a [`NormalizedError`] (the closed
//! taxonomy produced by the error normalizer and the version resolver) or one of
//! the precondition variants of [`ClientError`]. Raw transport errors and unparsed
//! error bodies never cross the public API.

use crate::retry::is_retryable_status;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidVersion,
    UnsupportedVersion,
    NoCompatibleVersion,
    Unauthorized,
    PermissionDenied,
    NotFound,
    Conflict,
    ValidationFailed,
    ServerInternal,
    ApiError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidVersion => "INVALID_VERSION",
            ErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorKind::NoCompatibleVersion => "NO_COMPATIBLE_VERSION",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::ServerInternal => "SERVER_INTERNAL",
            ErrorKind::ApiError => "API_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Fallback classification used when a response carries no structured errors
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::PermissionDenied,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            422 => ErrorKind::ValidationFailed,
            500 | 502 | 503 => ErrorKind::ServerInternal,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured entry extracted from a revision-specific error envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub source: String,
    pub description: String,
}

impl ErrorDetail {
    pub fn new(
        code: impl Into<String>,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            source: source.into(),
            description: description.into(),
        }
    }
}

/// A failure normalized into the closed taxonomy.
///
/// `retryable` is never supplied by the caller: it is derived from `http_status`
/// with the same predicate the retry policies use, so classification and retry
/// decisions cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{kind}] {message}")]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub retryable: bool,
    pub api_version: Option<String>,
    pub operation: Option<String>,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status,
            message: message.into(),
            details: Vec::new(),
            retryable: http_status.map(is_retryable_status).unwrap_or(false),
            api_version: None,
            operation: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn invalid_version(input: &str, reason: &str) -> Self {
        Self::new(
            ErrorKind::InvalidVersion,
            None,
            format!("invalid protocol version '{}': {}", input, reason),
        )
    }

    pub fn unsupported_version(requested: &str, supported: &[String]) -> Self {
        Self::new(
            ErrorKind::UnsupportedVersion,
            None,
            format!(
                "protocol version {} is not supported (supported: {})",
                requested,
                supported.join(", ")
            ),
        )
    }

    pub fn no_compatible_version(release: &str) -> Self {
        Self::new(
            ErrorKind::NoCompatibleVersion,
            None,
            format!("no compatible protocol version found for backend release {}", release),
        )
    }

    pub fn first_detail(&self) -> Option<&ErrorDetail> {
        self.details.first()
    }
}

/// Main client error type
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] NormalizedError),

    #[error("Transport error during {operation}: {error}")]
    Transport { operation: String, error: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Rejected without a request while the circuit breaker is open
    #[error("Circuit breaker open, {operation} rejected")]
    CircuitOpen { operation: String },

    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Client not initialized: {reason}")]
    NotInitialized { reason: String },

    #[error("Operation {operation} is not supported by protocol version {version}")]
    Unsupported { operation: String, version: String },

    #[error("Configuration error: {field} - {error}")]
    Config { field: String, error: String },

    #[error("Invalid response format for {operation}: {error}")]
    InvalidResponse { operation: String, error: String },
}

impl ClientError {
    pub fn cancelled(operation: impl Into<String>) -> Self {
        ClientError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn transport(operation: impl Into<String>, error: impl fmt::Display) -> Self {
        ClientError::Transport {
            operation: operation.into(),
            error: error.to_string(),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ClientError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn config(field: impl Into<String>, error: impl Into<String>) -> Self {
        ClientError::Config {
            field: field.into(),
            error: error.into(),
        }
    }

    /// Taxonomy kind, when this error came from the normalizer or version resolver
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Api(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::Api(e) => e.http_status,
            _ => None,
        }
    }

    pub fn normalized(&self) -> Option<&NormalizedError> {
        match self {
            ClientError::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Whether a fresh attempt could plausibly succeed.
    ///
    /// Network failures and an open circuit are presumed transient; precondition
    /// failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api(e) => e.retryable,
            ClientError::Transport { .. } | ClientError::CircuitOpen { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled { .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::InvalidResponse {
            operation: "json".to_string(),
            error: err.to_string(),
        }
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fallback_mapping() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(409), ErrorKind::Conflict);
        assert_eq!(ErrorKind::from_status(422), ErrorKind::ValidationFailed);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::ServerInternal);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::ServerInternal);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerInternal);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_status(418), ErrorKind::Unknown);
    }

    #[test]
    fn test_retryable_is_derived_from_status() {
        assert!(NormalizedError::new(ErrorKind::ServerInternal, Some(503), "x").retryable);
        assert!(NormalizedError::new(ErrorKind::Unknown, Some(429), "x").retryable);
        assert!(!NormalizedError::new(ErrorKind::NotFound, Some(404), "x").retryable);
        assert!(!NormalizedError::new(ErrorKind::InvalidVersion, None, "x").retryable);
    }

    #[test]
    fn test_client_error_accessors() {
        let err = ClientError::from(NormalizedError::new(ErrorKind::Conflict, Some(409), "busy"));
        assert_eq!(err.kind(), Some(ErrorKind::Conflict));
        assert_eq!(err.http_status(), Some(409));
        assert!(!err.is_retryable());

        let err = ClientError::transport("jobs.list", "connection refused");
        assert_eq!(err.kind(), None);
        assert!(err.is_retryable());

        let err = ClientError::cancelled("jobs.list");
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());

        let err = ClientError::CircuitOpen {
            operation: "jobs.list".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = NormalizedError::unsupported_version("v0.0.39", &["v0.0.42".to_string()]);
        let text = err.to_string();
        assert!(text.starts_with("[UNSUPPORTED_VERSION]"));
        assert!(text.contains("v0.0.39"));
        assert!(text.contains("v0.0.42"));
    }
}
