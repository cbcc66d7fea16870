//! Errors returned by store operations.
//!
//! Every failure coming out of a physical store, whether it is the in-process
//! [`MemBackend`] or a CouchDB server reached over HTTP, is normalized into a
//! [`DatabaseError`].  The error carries an HTTP-like status and a machine readable
//! reason so callers can tell a transport failure (fall back to the local store) from
//! an authorization failure (ask the user to log in again).
//!
//! [`MemBackend`]: crate::backend::mem::MemBackend

use reqwest::StatusCode;
use serde::Deserialize;
use snafu::Snafu;

/// Result type for store operations.
pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;

/// Error of a store operation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DatabaseError {
    /// The document or store does not exist.
    #[snafu(display("not_found: {reason}"))]
    NotFound { reason: String },
    /// The revision given on write is not the current revision of the document.
    #[snafu(display("conflict: {reason}"))]
    Conflict { reason: String },
    /// The document or query is malformed.
    #[snafu(display("bad_request: {reason}"))]
    Validation { reason: String },
    /// No valid session, or the credentials were rejected.
    #[snafu(display("unauthorized: {reason}"))]
    Unauthorized { reason: String },
    /// The session is valid but lacks the permission for the operation.
    #[snafu(display("forbidden: {reason}"))]
    Forbidden { reason: String },
    /// Any other non-success response.
    #[snafu(display("{error} ({status}): {reason}"))]
    Http {
        status: u16,
        error: String,
        reason: String,
    },
    /// The request never got a response.
    #[snafu(display("Transport error"))]
    Transport { source: reqwest::Error },
    /// The store can not be reached at the moment.
    #[snafu(display("Store unreachable: {reason}"))]
    Unreachable { reason: String },
    /// The response body could not be decoded.
    #[snafu(display("Invalid response body"))]
    InvalidBody { source: serde_json::Error },
    /// A store url could not be built.
    #[snafu(display("Invalid store url"))]
    InvalidUrl { source: url::ParseError },
    /// The store was closed.
    #[snafu(display("Database {name} is closed"))]
    Closed { name: String },
}

/// The `{error, reason}` body CouchDB sends along with failures.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) reason: String,
}

impl DatabaseError {
    /// Builds the error matching an HTTP failure status.
    pub(crate) fn from_status(status: StatusCode, body: ErrorBody) -> Self {
        let ErrorBody { error, reason } = body;
        let reason = if reason.is_empty() {
            status.canonical_reason().unwrap_or_default().to_string()
        } else {
            reason
        };
        match status {
            StatusCode::BAD_REQUEST => Self::Validation { reason },
            StatusCode::UNAUTHORIZED => Self::Unauthorized { reason },
            StatusCode::FORBIDDEN => Self::Forbidden { reason },
            StatusCode::NOT_FOUND => Self::NotFound { reason },
            StatusCode::CONFLICT => Self::Conflict { reason },
            _ => Self::Http {
                status: status.as_u16(),
                error,
                reason,
            },
        }
    }

    pub(crate) fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub(crate) fn conflict() -> Self {
        Self::Conflict {
            reason: "Document update conflict.".to_string(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub(crate) fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// The HTTP-like status of this error.
    ///
    /// Returns `None` for failures where no response was received at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::Conflict { .. } => Some(409),
            Self::Validation { .. } => Some(400),
            Self::Unauthorized { .. } => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::Http { status, .. } => Some(*status),
            Self::Transport { source } => source.status().map(|s| s.as_u16()),
            Self::InvalidBody { .. } => Some(500),
            Self::InvalidUrl { .. } => Some(400),
            Self::Unreachable { .. } | Self::Closed { .. } => None,
        }
    }

    /// Machine readable name of the error, CouchDB style.
    pub fn error_name(&self) -> &str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Validation { .. } => "bad_request",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::Http { error, .. } if !error.is_empty() => error,
            Self::Http { .. } => "unknown_error",
            Self::Transport { .. } | Self::Unreachable { .. } => "network_error",
            Self::InvalidBody { .. } => "invalid_body",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Closed { .. } => "closed",
        }
    }

    /// Human readable reason of the error.
    pub fn reason(&self) -> String {
        match self {
            Self::NotFound { reason }
            | Self::Conflict { reason }
            | Self::Validation { reason }
            | Self::Unauthorized { reason }
            | Self::Forbidden { reason }
            | Self::Http { reason, .. }
            | Self::Unreachable { reason } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the store could not be reached.
    ///
    /// Callers fall back to cached or offline state on these.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Transport { source } => source.status().is_none(),
            Self::Unreachable { .. } => true,
            _ => false,
        }
    }

    /// Whether the store rejected the session or credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Whether a write lost against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the document or store does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the server does not support the HTTP verb used.
    pub(crate) fn is_method_not_allowed(&self) -> bool {
        self.status() == Some(405)
    }
}

/// A cloneable summary of a [`DatabaseError`], kept in emitted states.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{error}: {reason}")]
pub struct ErrorInfo {
    /// HTTP-like status, `None` for network failures.
    pub status: Option<u16>,
    /// Machine readable error name.
    pub error: String,
    /// Human readable reason.
    pub reason: String,
}

impl ErrorInfo {
    /// Whether the summarized error was a network failure.
    pub fn is_network(&self) -> bool {
        self.status.is_none() && self.error == "network_error"
    }
}

impl std::error::Error for ErrorInfo {}

impl From<&DatabaseError> for ErrorInfo {
    fn from(err: &DatabaseError) -> Self {
        Self {
            status: err.status(),
            error: err.error_name().to_string(),
            reason: err.reason(),
        }
    }
}
