//! Namespace listing scoped by the tenant label

use capsule_common::crd::Tenant;
use capsule_common::TENANT_LABEL;

use crate::error::{Error, Result};
use crate::selector::{Requirement, Selector};
use crate::tenant_index::tenant_names;

/// `capsule.clastix.io/tenant in (owned tenants)`, or a selector matching
/// nothing when no tenant is owned
pub(crate) fn list(tenants: &[Tenant]) -> Result<Selector> {
    let names = tenant_names(tenants);
    if names.is_empty() {
        return Ok(Selector::never_matching());
    }

    let requirement = Requirement::is_in(TENANT_LABEL, names)
        .map_err(|e| Error::Internal(format!("cannot build namespace selector: {}", e)))?;
    Ok(Selector::new([requirement]))
}
