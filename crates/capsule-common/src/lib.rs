//! Shared types for the Capsule multi-tenancy proxy
//!
//! Holds the `Tenant` custom resource as seen by the proxy together with the
//! well-known label and annotation keys the control plane uses to mark tenant
//! ownership and per-tenant capabilities.

#![deny(missing_docs)]

pub mod crd;

/// Label carried by every namespace that belongs to a tenant
pub const TENANT_LABEL: &str = "capsule.clastix.io/tenant";

/// Field index over tenant owners, queried as `<Kind>:<Name>`
pub const OWNER_INDEX_FIELD: &str = ".spec.owner.ownerkind";

/// Label key no real object carries; `Exists` on it matches nothing
pub const NEVER_MATCHING_LABEL: &str = "dontexistsignoreme";

/// Label key used to scope cluster-scoped resources by object name
pub const NAME_LABEL: &str = "name";

/// Annotations granting per-verb access to cluster-scoped resources
pub mod annotations {
    /// Allows tenant owners to list storage classes in scope
    pub const STORAGE_CLASS_LISTING: &str = "capsule.clastix.io/enable-storageclass-listing";
    /// Allows tenant owners to update storage classes in scope
    pub const STORAGE_CLASS_UPDATE: &str = "capsule.clastix.io/enable-storageclass-update";
    /// Allows tenant owners to delete storage classes in scope
    pub const STORAGE_CLASS_DELETION: &str = "capsule.clastix.io/enable-storageclass-deletion";

    /// Allows tenant owners to list ingress classes in scope
    pub const INGRESS_CLASS_LISTING: &str = "capsule.clastix.io/enable-ingressclass-listing";
    /// Allows tenant owners to update ingress classes in scope
    pub const INGRESS_CLASS_UPDATE: &str = "capsule.clastix.io/enable-ingressclass-update";
    /// Allows tenant owners to delete ingress classes in scope
    pub const INGRESS_CLASS_DELETION: &str = "capsule.clastix.io/enable-ingressclass-deletion";

    /// Allows tenant owners to list nodes matching the tenant node selector
    pub const NODE_LISTING: &str = "capsule.clastix.io/enable-node-listing";
    /// Allows tenant owners to update nodes matching the tenant node selector
    pub const NODE_UPDATE: &str = "capsule.clastix.io/enable-node-update";
    /// Allows tenant owners to delete nodes matching the tenant node selector
    pub const NODE_DELETION: &str = "capsule.clastix.io/enable-node-deletion";
}
