//! Tenant CRD
//!
//! A Tenant groups namespaces under a single owner, either a user or a group.
//! The proxy never writes tenants; it only reads them to work out which
//! resources a principal may see.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tenant is the unit of isolation enforced by the proxy.
///
/// Example:
/// ```yaml
/// apiVersion: capsule.clastix.io/v1alpha1
/// kind: Tenant
/// metadata:
///   name: oil
///   annotations:
///     capsule.clastix.io/enable-storageclass-listing: "true"
/// spec:
///   owner:
///     kind: User
///     name: alice
///   storageClasses:
///     allowed: ["fast"]
///     allowedRegex: "^gold-.*"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "capsule.clastix.io",
    version = "v1alpha1",
    kind = "Tenant",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Principal owning the tenant
    pub owner: OwnerSpec,

    /// Storage classes tenant owners may use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_classes: Option<AllowedListSpec>,

    /// Ingress classes tenant owners may use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_classes: Option<AllowedListSpec>,

    /// Node labels identifying the nodes assigned to this tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

/// Tenant owner reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OwnerSpec {
    /// Whether the owner is a user or a group
    pub kind: OwnerKind,
    /// User or group name
    pub name: String,
}

/// Kind of principal owning a tenant
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// A single user
    #[default]
    User,
    /// Every member of a group
    Group,
}

impl OwnerKind {
    /// Key under which the owner index stores tenants owned by `name`
    pub fn index_key(&self, name: &str) -> String {
        format!("{}:{}", self, name)
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKind::User => f.write_str("User"),
            OwnerKind::Group => f.write_str("Group"),
        }
    }
}

/// Allow-list of cluster-scoped resource names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AllowedListSpec {
    /// Names allowed verbatim
    #[serde(rename = "allowed", default, skip_serializing_if = "Vec::is_empty")]
    pub exact: Vec<String>,

    /// Regular expression matching further allowed names
    #[serde(
        rename = "allowedRegex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub regex: Option<String>,
}

impl Tenant {
    /// True when the annotation is present with the literal value `"true"`
    pub fn is_annotation_true(&self, key: &str) -> bool {
        self.annotations()
            .get(key)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
