//! Capsule Proxy
//!
//! A reverse proxy in front of the Kubernetes API server that lets tenant
//! owners list cluster-scoped resources restricted to what their tenants own.
//!
//! # Architecture
//!
//! ```text
//! kubectl ──► Capsule Proxy ──► K8s API Server
//!             (identity, tenants, label selector)
//! ```
//!
//! # Endpoints
//!
//! - `GET /api/v1/namespaces` - Namespaces of the caller's tenants
//! - `GET /api/v1/nodes[/{name}]` - Nodes matching tenant node selectors
//! - `GET /apis/networking.k8s.io/v1/ingressclasses[/{name}]` - Allowed ingress classes
//! - `GET /apis/storage.k8s.io/v1/storageclasses[/{name}]` - Allowed storage classes
//! - `GET /_healthz` - Health check
//!
//! Item routes also accept `PUT`, `PATCH` and `DELETE` when a tenant grants
//! them. Everything else is forwarded unchanged.

#![deny(missing_docs)]

pub mod auth;
pub mod backend;
pub mod cert_auth;
pub mod config;
pub mod error;
pub mod k8s_forwarder;
pub mod merge;
pub mod middleware;
pub mod modules;
pub mod proxy;
pub mod selector;
pub mod server;
pub mod tenant_index;
pub mod token_review;

pub use auth::UserIdentity;
pub use config::{ProxyArgs, ServerConfig};
pub use error::{Error, Result};
pub use selector::{Requirement, Selector};
pub use server::{build_router, start_server, AppState};
