//! Caller identity resolution
//!
//! A bearer token, when present, always wins and is verified through the
//! token reviewer; a failed verification aborts the request. Without a token
//! the single client certificate presented over mTLS identifies the caller.
//! Anything else leaves the caller unidentified, which is not an error: the
//! request is passed through and the control plane decides.

use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cert_auth::{CertValidator, ClientCertChain};
use crate::error::Result;
use crate::token_review::TokenReviewer;

/// Verified identity of the calling principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Username
    pub username: String,
    /// Groups, in the order the identity source reported them
    pub groups: Vec<String>,
}

impl UserIdentity {
    /// Whether the principal is a member of `group`
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the identity behind a request
///
/// Returns `Ok(None)` when the request carries neither a bearer token nor
/// exactly one client certificate.
pub async fn resolve_identity(
    reviewer: &dyn TokenReviewer,
    certs: &CertValidator,
    parts: &Parts,
) -> Result<Option<UserIdentity>> {
    if let Some(token) = extract_bearer_token(&parts.headers) {
        return reviewer.review(token).await.map(Some);
    }

    match parts.extensions.get::<ClientCertChain>() {
        Some(chain) => certs.identity_from_chain(chain).transpose(),
        None => {
            debug!("No bearer token or client certificate on request");
            Ok(None)
        }
    }
}
