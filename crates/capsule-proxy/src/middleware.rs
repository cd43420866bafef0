//! Authorization chain wrapping every module route
//!
//! 1. `verify_token` resolves the caller identity. A token that fails review
//!    ends the request; no identity at all is not an error.
//! 2. `require_privileged_group` lets members of the configured group through
//!    to the module. Everyone else is handed to the pass-through path and left
//!    to the API server's own authorization.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::auth::{resolve_identity, UserIdentity};
use crate::proxy::passthrough;
use crate::server::AppState;

/// Resolve the caller and attach its [`UserIdentity`] to the request
pub async fn verify_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    match resolve_identity(state.reviewer.as_ref(), &state.settings.certs, &parts).await {
        Ok(Some(identity)) => {
            debug!(username = %identity.username, "Caller identified");
            parts.extensions.insert(identity);
        }
        Ok(None) => {}
        Err(e) => {
            debug!(error = %e, "Caller identity rejected");
            return e.into_response();
        }
    }

    next.run(Request::from_parts(parts, body)).await
}

/// Continue to the module only for members of the privileged group
pub async fn require_privileged_group(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let privileged = request
        .extensions()
        .get::<UserIdentity>()
        .is_some_and(|identity| identity.in_group(&state.settings.privileged_group));

    if privileged {
        return next.run(request).await;
    }

    debug!(
        group = %state.settings.privileged_group,
        "Caller outside the privileged group, passing through"
    );
    passthrough(State(state), request).await
}
