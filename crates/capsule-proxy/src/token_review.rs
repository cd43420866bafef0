//! Bearer token verification via the Kubernetes TokenReview API
//!
//! Every request carrying a bearer token is re-verified; results are never
//! cached between requests.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use crate::auth::UserIdentity;
use crate::error::{Error, Result};

/// Verifies bearer tokens and returns the identity they belong to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    /// Verify `token`
    ///
    /// Fails with `Error::Unauthorized` when the token is rejected and with
    /// `Error::BackendUnavailable` when the review itself cannot be made.
    async fn review(&self, token: &str) -> Result<UserIdentity>;
}

/// Token reviewer backed by the control plane's TokenReview API
pub struct KubeTokenReviewer {
    client: Client,
}

impl KubeTokenReviewer {
    /// Create a reviewer accepting the API server's default audiences
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<UserIdentity> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let token_review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &token_review)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("cannot create TokenReview: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| Error::BackendUnavailable("TokenReview returned no status".into()))?;

        identity_from_status(&status)
    }
}

/// Extract the verified identity from a TokenReview status
pub(crate) fn identity_from_status(status: &TokenReviewStatus) -> Result<UserIdentity> {
    if let Some(error) = status.error.as_deref().filter(|e| !e.is_empty()) {
        return Err(Error::Unauthorized(format!(
            "cannot verify the token due to error: {}",
            error
        )));
    }

    if !status.authenticated.unwrap_or(false) {
        return Err(Error::Unauthorized("token is not authenticated".into()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| Error::Unauthorized("TokenReview authenticated but no user info".into()))?;

    let username = user
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Unauthorized("TokenReview user has no username".into()))?;

    let groups = user.groups.clone().unwrap_or_default();

    debug!(username = %username, groups = ?groups, "TokenReview verified bearer token");

    Ok(UserIdentity { username, groups })
}
