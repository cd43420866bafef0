//! Selector merge and anti-escalation check
//!
//! A caller may narrow a scoped request with its own `labelSelector`, but may
//! never use it to reach tenants it does not own. Caller requirements on the
//! tenant label are checked against the tenants owned by the username alone;
//! group ownership is not considered here.

use std::collections::BTreeSet;

use capsule_common::TENANT_LABEL;
use tracing::debug;

use crate::backend::ControlPlane;
use crate::error::{Error, Result};
use crate::selector::{Operator, Selector};
use crate::tenant_index::user_tenant_names;

/// Final wire selector for a scoped request
///
/// Without a caller selector this is the computed one. A caller selector the
/// parser does not understand is forwarded verbatim for the control plane to
/// reject, still conjoined with the computed selector.
pub async fn merge_and_validate(
    existing: Option<&str>,
    computed: &Selector,
    username: &str,
    cluster: &dyn ControlPlane,
) -> Result<String> {
    let existing = match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => existing,
        None => return Ok(computed.to_string()),
    };

    match existing.parse::<Selector>() {
        Ok(parsed) => validate(&parsed, username, cluster).await?,
        Err(e) => debug!(error = %e, "Forwarding unparseable caller selector"),
    }

    Ok(format!("{},{}", existing, computed))
}

async fn validate(caller: &Selector, username: &str, cluster: &dyn ControlPlane) -> Result<()> {
    for requirement in caller.requirements() {
        if requirement.key() != TENANT_LABEL {
            continue;
        }

        match requirement.operator() {
            Operator::Exists => {
                return Err(Error::ForbiddenSelector(
                    "cannot return list of all Tenant namespaces".to_string(),
                ));
            }
            Operator::In => {
                let owned: BTreeSet<String> =
                    user_tenant_names(cluster, username).await?.into_iter().collect();
                let denied: Vec<&str> = requirement
                    .values()
                    .difference(&owned)
                    .map(String::as_str)
                    .collect();

                if !denied.is_empty() {
                    return Err(Error::ForbiddenSelector(format!(
                        "cannot list Namespaces for the following Tenant(s): {}",
                        denied.join(", ")
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
