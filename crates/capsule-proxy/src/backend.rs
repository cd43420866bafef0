//! Control-plane read access
//!
//! Defines the `ControlPlane` trait the filtering pipeline reads tenants and
//! cluster-scoped objects through, decoupling it from a concrete client so
//! tests can inject fixtures. The production implementation is a thin wrapper
//! around `kube::Client`, which is safe to share between concurrent requests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use capsule_common::crd::{OwnerKind, Tenant};
use capsule_common::OWNER_INDEX_FIELD;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::{Api, Client, Resource};
use tracing::debug;

use crate::error::{Error, Result};

/// Cluster-scoped resource kinds the proxy scopes per tenant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopedKind {
    /// `storage.k8s.io/v1` StorageClass
    StorageClass,
    /// `networking.k8s.io/v1` IngressClass
    IngressClass,
    /// `v1` Node
    Node,
}

impl ScopedKind {
    /// API group, empty for the core group
    pub fn group(&self) -> &'static str {
        match self {
            ScopedKind::StorageClass => "storage.k8s.io",
            ScopedKind::IngressClass => "networking.k8s.io",
            ScopedKind::Node => "",
        }
    }

    /// Plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            ScopedKind::StorageClass => "storageclasses",
            ScopedKind::IngressClass => "ingressclasses",
            ScopedKind::Node => "nodes",
        }
    }

    /// Collection path on the control-plane API
    pub fn collection_path(&self) -> &'static str {
        match self {
            ScopedKind::StorageClass => "/apis/storage.k8s.io/v1/storageclasses",
            ScopedKind::IngressClass => "/apis/networking.k8s.io/v1/ingressclasses",
            ScopedKind::Node => "/api/v1/nodes",
        }
    }

    /// Kind name
    pub fn kind(&self) -> &'static str {
        match self {
            ScopedKind::StorageClass => "StorageClass",
            ScopedKind::IngressClass => "IngressClass",
            ScopedKind::Node => "Node",
        }
    }
}

impl fmt::Display for ScopedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Name and labels of a cluster-scoped object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object name
    pub name: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
}

impl ObjectRef {
    /// Object with a name and no labels
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }
}

impl From<ObjectMeta> for ObjectRef {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            name: meta.name.unwrap_or_default(),
            labels: meta.labels.unwrap_or_default(),
        }
    }
}

/// Read-only view of the control plane used by the filtering pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Tenants whose owner index key is `<kind>:<name>`
    async fn tenants_for_owner(&self, kind: OwnerKind, name: &str) -> Result<Vec<Tenant>>;

    /// Every live object of `kind`
    async fn list_objects(&self, kind: ScopedKind) -> Result<Vec<ObjectRef>>;

    /// The named object of `kind`, or `None` when it does not exist
    async fn get_object(&self, kind: ScopedKind, name: &str) -> Result<Option<ObjectRef>>;
}

/// `ControlPlane` backed by the Kubernetes API
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_metadata<K>(&self) -> Result<Vec<ObjectRef>>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api.list_metadata(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(|o| o.metadata.into()).collect())
    }

    async fn get_metadata<K>(&self, name: &str) -> Result<Option<ObjectRef>>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get_metadata_opt(name).await?.map(|o| o.metadata.into()))
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn tenants_for_owner(&self, kind: OwnerKind, name: &str) -> Result<Vec<Tenant>> {
        let api: Api<Tenant> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!(
            "{}={}",
            OWNER_INDEX_FIELD,
            kind.index_key(name)
        ));

        let list = api.list(&lp).await.map_err(|e| {
            Error::BackendUnavailable(format!("cannot retrieve Tenants list: {}", e))
        })?;

        debug!(owner = %kind, name = %name, count = list.items.len(), "Listed tenants for owner");
        Ok(list.items)
    }

    async fn list_objects(&self, kind: ScopedKind) -> Result<Vec<ObjectRef>> {
        match kind {
            ScopedKind::StorageClass => self.list_metadata::<StorageClass>().await,
            ScopedKind::IngressClass => self.list_metadata::<IngressClass>().await,
            ScopedKind::Node => self.list_metadata::<Node>().await,
        }
    }

    async fn get_object(&self, kind: ScopedKind, name: &str) -> Result<Option<ObjectRef>> {
        match kind {
            ScopedKind::StorageClass => self.get_metadata::<StorageClass>(name).await,
            ScopedKind::IngressClass => self.get_metadata::<IngressClass>(name).await,
            ScopedKind::Node => self.get_metadata::<Node>(name).await,
        }
    }
}
