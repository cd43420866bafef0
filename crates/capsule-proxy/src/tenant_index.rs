//! Tenant ownership lookups
//!
//! Tenants are looked up through the control plane's owner index on every
//! request; nothing is cached between requests.

use capsule_common::crd::{OwnerKind, Tenant};
use kube::ResourceExt;
use tracing::debug;

use crate::auth::UserIdentity;
use crate::backend::ControlPlane;
use crate::error::{Error, Result};

/// Tenants owned by the principal directly or through any of its groups
///
/// The result is a plain concatenation: a tenant owned both by the user and by
/// one of its groups appears twice, which is harmless for selector building.
pub async fn owned_tenants(cluster: &dyn ControlPlane, identity: &UserIdentity) -> Result<Vec<Tenant>> {
    let mut tenants = cluster
        .tenants_for_owner(OwnerKind::User, &identity.username)
        .await
        .map_err(index_error)?;

    for group in &identity.groups {
        let owned = cluster
            .tenants_for_owner(OwnerKind::Group, group)
            .await
            .map_err(index_error)?;
        tenants.extend(owned);
    }

    debug!(
        username = %identity.username,
        tenants = ?tenant_names(&tenants),
        "Resolved owned tenants"
    );

    Ok(tenants)
}

/// Names of the tenants owned by `username` alone, ignoring group ownership
pub async fn user_tenant_names(cluster: &dyn ControlPlane, username: &str) -> Result<Vec<String>> {
    let tenants = cluster
        .tenants_for_owner(OwnerKind::User, username)
        .await
        .map_err(index_error)?;
    Ok(tenant_names(&tenants))
}

/// Tenant names in the order given
pub fn tenant_names(tenants: &[Tenant]) -> Vec<String> {
    tenants.iter().map(|t| t.name_any()).collect()
}

fn index_error(e: Error) -> Error {
    match e {
        Error::BackendUnavailable(msg) => Error::BackendUnavailable(format!(
            "cannot get Tenants slice owned by Tenant Owner: {}",
            msg
        )),
        other => other,
    }
}
