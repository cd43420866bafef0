//! Resource filter modules
//!
//! Each module owns one intercepted route and turns the caller's owned
//! tenants into a selector scoping the forwarded request. The set of modules
//! is fixed; [`registry`] returns them in matching order.

mod cluster_scoped;
mod namespace;
mod scope;

use axum::http::request::Parts;
use axum::http::Method;
use capsule_common::crd::Tenant;

use crate::backend::{ControlPlane, ScopedKind};
use crate::error::{Error, Result, StatusDetails, StatusError};
use crate::selector::Selector;

const LIST_METHODS: &[Method] = &[Method::GET];
const ITEM_METHODS: &[Method] = &[Method::GET, Method::PUT, Method::PATCH, Method::DELETE];

/// A resource filter module
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Module {
    /// `GET /api/v1/namespaces`
    NamespaceList,
    /// Collection of a cluster-scoped kind
    List(ScopedKind),
    /// Single named object of a cluster-scoped kind
    Item(ScopedKind),
}

/// Every module, in matching order
pub fn registry() -> Vec<Module> {
    vec![
        Module::NamespaceList,
        Module::List(ScopedKind::Node),
        Module::Item(ScopedKind::Node),
        Module::List(ScopedKind::IngressClass),
        Module::Item(ScopedKind::IngressClass),
        Module::List(ScopedKind::StorageClass),
        Module::Item(ScopedKind::StorageClass),
    ]
}

impl Module {
    /// Route in axum path syntax
    pub fn path(&self) -> String {
        match self {
            Module::NamespaceList => "/api/v1/namespaces".to_string(),
            Module::List(kind) => kind.collection_path().to_string(),
            Module::Item(kind) => format!("{}/{{name}}", kind.collection_path()),
        }
    }

    /// Methods the module scopes; anything else on its path is passed through
    pub fn methods(&self) -> &'static [Method] {
        match self {
            Module::NamespaceList | Module::List(_) => LIST_METHODS,
            Module::Item(_) => ITEM_METHODS,
        }
    }

    /// Selector scoping the request to `tenants`
    ///
    /// `Ok(None)` means the request needs no scoping. `NoMatchingRequirement`
    /// is returned when nothing is in scope and is left to the caller to turn
    /// into a selector matching nothing.
    pub async fn handle(
        &self,
        tenants: &[Tenant],
        parts: &Parts,
        cluster: &dyn ControlPlane,
    ) -> Result<Option<Selector>> {
        let selector = match *self {
            Module::NamespaceList => namespace::list(tenants)?,
            Module::List(kind) => cluster_scoped::list(kind, &parts.method, tenants, cluster).await?,
            Module::Item(kind) => {
                let name = item_name(kind, parts)?;
                cluster_scoped::get(kind, name, &parts.method, tenants, cluster).await?
            }
        };
        Ok(Some(selector))
    }
}

/// Object name from an item path
fn item_name(kind: ScopedKind, parts: &Parts) -> Result<&str> {
    parts
        .uri
        .path()
        .strip_prefix(kind.collection_path())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| {
            Error::from(StatusError::bad_request(
                "missing object name",
                StatusDetails {
                    name: None,
                    group: Some(kind.group().to_string()),
                    kind: kind.plural().to_string(),
                },
            ))
        })
}
