//! Storage classes, ingress classes and nodes
//!
//! These kinds have no tenant label, so the proxy resolves the live objects a
//! tenant may touch and scopes the request by their names.

use axum::http::Method;
use capsule_common::crd::Tenant;
use capsule_common::NAME_LABEL;
use tracing::debug;

use super::scope::Scope;
use crate::backend::{ControlPlane, ScopedKind};
use crate::error::{Error, Result, StatusDetails, StatusError};
use crate::selector::{Requirement, Selector};

/// `name in (objects in scope)`
///
/// Fails with `NoMatchingRequirement` when no live object is in scope.
pub(crate) async fn list(
    kind: ScopedKind,
    method: &Method,
    tenants: &[Tenant],
    cluster: &dyn ControlPlane,
) -> Result<Selector> {
    let scope = Scope::collect(kind, method, tenants);
    let names: Vec<String> = cluster
        .list_objects(kind)
        .await?
        .into_iter()
        .filter(|o| scope.contains(o))
        .map(|o| o.name)
        .collect();

    debug!(kind = %kind, names = ?names, "Resolved objects in scope");

    if names.is_empty() {
        return Err(Error::NoMatchingRequirement(kind.kind()));
    }
    name_selector(kind, names)
}

/// `name in (name)` when the named object exists and is in scope
///
/// A missing or out of scope object is reported as not found so callers
/// cannot discover objects outside their tenants.
pub(crate) async fn get(
    kind: ScopedKind,
    name: &str,
    method: &Method,
    tenants: &[Tenant],
    cluster: &dyn ControlPlane,
) -> Result<Selector> {
    let scope = Scope::collect(kind, method, tenants);
    let not_found = || {
        Error::from(StatusError::not_found(
            name,
            StatusDetails {
                name: None,
                group: Some(kind.group().to_string()),
                kind: kind.plural().to_string(),
            },
        ))
    };

    match cluster.get_object(kind, name).await? {
        Some(object) if scope.contains(&object) => name_selector(kind, [object.name]),
        Some(_) => {
            debug!(kind = %kind, name = %name, "Object outside tenant scope");
            Err(not_found())
        }
        None => Err(not_found()),
    }
}

fn name_selector(kind: ScopedKind, names: impl IntoIterator<Item = String>) -> Result<Selector> {
    Requirement::is_in(NAME_LABEL, names)
        .map(|r| Selector::new([r]))
        .map_err(|_| Error::NoMatchingRequirement(kind.kind()))
}
