//! Request handlers
//!
//! `scoped` serves module routes for privileged callers: it resolves the
//! caller's tenants, asks the module for a selector, merges it with the
//! caller's own and forwards. `passthrough` serves everything else, only
//! applying certificate impersonation before forwarding.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::auth::{extract_bearer_token, UserIdentity};
use crate::cert_auth::ClientCertChain;
use crate::error::{Error, Result};
use crate::k8s_forwarder::{
    forward, impersonate, label_selector, set_bearer, set_label_selector,
    strip_impersonation_headers,
};
use crate::merge::merge_and_validate;
use crate::modules::Module;
use crate::selector::Selector;
use crate::server::AppState;
use crate::tenant_index::owned_tenants;

/// Forward without scoping
pub async fn passthrough(State(state): State<AppState>, request: Request) -> Response {
    into_response(passthrough_inner(&state, request).await)
}

/// Forward with the module's selector applied
pub async fn scoped(state: AppState, module: Module, request: Request) -> Response {
    into_response(scoped_inner(&state, module, request).await)
}

async fn passthrough_inner(state: &AppState, mut request: Request) -> Result<Response<Body>> {
    impersonate_certificate_identity(state, &mut request)?;
    forward(state.upstream.as_ref(), request).await
}

async fn scoped_inner(state: &AppState, module: Module, request: Request) -> Result<Response<Body>> {
    let (parts, body) = request.into_parts();
    let identity = parts
        .extensions
        .get::<UserIdentity>()
        .cloned()
        .ok_or_else(|| Error::Internal("scoped request without caller identity".into()))?;

    let tenants = owned_tenants(state.cluster.as_ref(), &identity).await?;

    let selector = match module.handle(&tenants, &parts, state.cluster.as_ref()).await {
        Ok(selector) => selector,
        Err(Error::NoMatchingRequirement(kind)) => {
            debug!(kind = %kind, "Nothing in scope, matching no objects");
            Some(Selector::never_matching())
        }
        Err(e) => return Err(e),
    };

    let mut request = Request::from_parts(parts, body);
    let Some(selector) = selector else {
        return passthrough_inner(state, request).await;
    };

    let existing = label_selector(request.uri().query());
    let merged = merge_and_validate(
        existing.as_deref(),
        &selector,
        &identity.username,
        state.cluster.as_ref(),
    )
    .await?;

    debug!(
        username = %identity.username,
        path = %request.uri().path(),
        selector = %merged,
        "Scoping request"
    );
    set_label_selector(&mut request, &merged)?;

    if let Some(token) = &state.settings.bearer_token {
        strip_impersonation_headers(request.headers_mut());
        set_bearer(request.headers_mut(), token)?;
    }

    forward(state.upstream.as_ref(), request).await
}

/// Under mutual TLS, act as the single certificate's subject when the caller
/// brought no token of its own
fn impersonate_certificate_identity(state: &AppState, request: &mut Request) -> Result<()> {
    if !state.settings.listening_tls || extract_bearer_token(request.headers()).is_some() {
        return Ok(());
    }

    let identity = match request
        .extensions()
        .get::<ClientCertChain>()
        .and_then(|chain| state.settings.certs.identity_from_chain(chain))
    {
        Some(identity) => identity?,
        None => return Ok(()),
    };

    debug!(username = %identity.username, groups = ?identity.groups, "Impersonating certificate subject");

    let token = state.settings.bearer_token.as_deref().map(String::as_str);
    impersonate(request.headers_mut(), &identity, token)
}

fn into_response(result: Result<Response<Body>>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "Request rejected");
            e.into_response()
        }
    }
}
