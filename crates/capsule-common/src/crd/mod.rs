//! Custom resources read by the proxy

mod tenant;

pub use tenant::{AllowedListSpec, OwnerKind, OwnerSpec, Tenant, TenantSpec};
