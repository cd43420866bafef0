//! Error types for the tenant proxy
//!
//! Every error that reaches a caller is rendered as a control-plane `Status`
//! object so clients cannot tell a proxy rejection from an API server one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller identity could not be verified
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The control plane could not answer a tenant or token query
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Caller asked for tenants it does not own
    #[error("{0}")]
    ForbiddenSelector(String),

    /// A module found nothing in scope to build a selector from
    #[error("cannot create LabelSelector for the requested {0} requirement")]
    NoMatchingRequirement(&'static str),

    /// Module rejection carrying its own status payload
    #[error("{}", .0.message)]
    Status(StatusError),

    /// Failed to forward the request upstream
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Structured rejection produced by a resource module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusError {
    /// HTTP status code
    pub code: StatusCode,
    /// Machine readable reason (`NotFound`, `BadRequest`, ...)
    pub reason: &'static str,
    /// Human readable message
    pub message: String,
    /// Object the rejection is about
    pub details: StatusDetails,
}

/// Identifies the object a status refers to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusDetails {
    /// Object name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// API group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Resource kind (plural)
    pub kind: String,
}

impl StatusError {
    /// The named object does not exist or is outside the caller's scope
    pub fn not_found(name: &str, details: StatusDetails) -> Self {
        let message = match &details.group {
            Some(group) if !group.is_empty() => {
                format!("{}.{} \"{}\" not found", details.kind, group, name)
            }
            _ => format!("{} \"{}\" not found", details.kind, name),
        };
        Self {
            code: StatusCode::NOT_FOUND,
            reason: "NotFound",
            message,
            details: StatusDetails {
                name: Some(name.to_string()),
                ..details
            },
        }
    }

    /// The request cannot be served as asked
    pub fn bad_request(message: impl Into<String>, details: StatusDetails) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            reason: "BadRequest",
            message: message.into(),
            details,
        }
    }
}

impl From<StatusError> for Error {
    fn from(e: StatusError) -> Self {
        Error::Status(e)
    }
}

/// Wire shape of a control-plane `Status`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    kind: &'static str,
    api_version: &'static str,
    metadata: serde_json::Map<String, serde_json::Value>,
    status: &'static str,
    message: String,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a StatusDetails>,
    code: u16,
}

impl Error {
    fn status_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            Error::BackendUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable"),
            Error::ForbiddenSelector(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            Error::NoMatchingRequirement(_) => (StatusCode::NOT_FOUND, "NotFound"),
            Error::Status(s) => (s.code, s.reason),
            Error::Proxy(_) => (StatusCode::BAD_GATEWAY, "BadGateway"),
            Error::Config(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, reason) = self.status_parts();
        let details = match &self {
            Error::Status(s) => Some(&s.details),
            _ => None,
        };

        let body = StatusBody {
            kind: "Status",
            api_version: "v1",
            metadata: Default::default(),
            status: "Failure",
            message: self.to_string(),
            reason,
            details,
            code: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::BackendUnavailable(e.to_string())
    }
}
