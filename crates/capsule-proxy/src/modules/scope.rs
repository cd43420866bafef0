//! Per-verb scope of cluster-scoped resources
//!
//! A tenant contributes to the scope of a request only when its capability
//! annotations grant the request's verb. Listing is a prerequisite for update
//! and deletion.

use std::collections::BTreeMap;

use axum::http::Method;
use capsule_common::annotations;
use capsule_common::crd::{AllowedListSpec, Tenant};
use kube::ResourceExt;
use regex::Regex;
use tracing::warn;

use crate::backend::{ObjectRef, ScopedKind};

/// Capability annotations of a kind: listing, update, deletion
fn capability_annotations(kind: ScopedKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        ScopedKind::StorageClass => (
            annotations::STORAGE_CLASS_LISTING,
            annotations::STORAGE_CLASS_UPDATE,
            annotations::STORAGE_CLASS_DELETION,
        ),
        ScopedKind::IngressClass => (
            annotations::INGRESS_CLASS_LISTING,
            annotations::INGRESS_CLASS_UPDATE,
            annotations::INGRESS_CLASS_DELETION,
        ),
        ScopedKind::Node => (
            annotations::NODE_LISTING,
            annotations::NODE_UPDATE,
            annotations::NODE_DELETION,
        ),
    }
}

/// Whether `tenant` grants `method` on `kind`
pub(crate) fn grants(tenant: &Tenant, kind: ScopedKind, method: &Method) -> bool {
    let (listing, update, deletion) = capability_annotations(kind);
    let extra = match *method {
        Method::GET => None,
        Method::PUT | Method::PATCH => Some(update),
        Method::DELETE => Some(deletion),
        _ => return false,
    };

    tenant.is_annotation_true(listing) && extra.map_or(true, |a| tenant.is_annotation_true(a))
}

/// Objects of one kind a request may touch
#[derive(Debug)]
pub(crate) enum Scope {
    /// Exact names and name patterns
    Classes {
        /// Sorted, deduplicated
        exact: Vec<String>,
        regex: Vec<Regex>,
    },
    /// Node label selectors; a node matches when it carries every pair of one of them
    Nodes(Vec<BTreeMap<String, String>>),
}

impl Scope {
    /// Scope granted by `tenants` for `method` on `kind`
    pub(crate) fn collect(kind: ScopedKind, method: &Method, tenants: &[Tenant]) -> Self {
        let granting = tenants.iter().filter(|t| grants(t, kind, method));

        match kind {
            ScopedKind::StorageClass => {
                class_scope(granting.map(|t| (t, t.spec.storage_classes.as_ref())))
            }
            ScopedKind::IngressClass => {
                class_scope(granting.map(|t| (t, t.spec.ingress_classes.as_ref())))
            }
            ScopedKind::Node => Scope::Nodes(
                granting
                    .filter_map(|t| t.spec.node_selector.clone())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        }
    }

    /// Whether `object` is within this scope
    pub(crate) fn contains(&self, object: &ObjectRef) -> bool {
        match self {
            Scope::Classes { exact, regex } => {
                regex.iter().any(|r| r.is_match(&object.name))
                    || exact.binary_search(&object.name).is_ok()
            }
            Scope::Nodes(selectors) => selectors.iter().any(|selector| {
                selector
                    .iter()
                    .all(|(k, v)| object.labels.get(k) == Some(v))
            }),
        }
    }
}

fn class_scope<'a>(
    allowed: impl Iterator<Item = (&'a Tenant, Option<&'a AllowedListSpec>)>,
) -> Scope {
    let mut exact: Vec<String> = Vec::new();
    let mut regex = Vec::new();

    for (tenant, spec) in allowed {
        let Some(spec) = spec else { continue };

        for name in &spec.exact {
            if let Err(pos) = exact.binary_search(name) {
                exact.insert(pos, name.clone());
            }
        }

        match spec.regex.as_deref().filter(|r| !r.is_empty()).map(Regex::new) {
            Some(Ok(r)) => regex.push(r),
            Some(Err(e)) => {
                warn!(tenant = %tenant.name_any(), error = %e, "Skipping invalid allowed regex")
            }
            None => {}
        }
    }

    Scope::Classes { exact, regex }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant_index::tests::tenant;
    use capsule_common::crd::OwnerKind;

    fn with_annotations(mut t: Tenant, keys: &[&str]) -> Tenant {
        for key in keys {
            t.annotations_mut().insert(key.to_string(), "true".to_string());
        }
        t
    }

    fn storage_tenant(name: &str, exact: &[&str], regex: Option<&str>) -> Tenant {
        let mut t = tenant(name, OwnerKind::User, "alice");
        t.spec.storage_classes = Some(AllowedListSpec {
            exact: exact.iter().map(|s| s.to_string()).collect(),
            regex: regex.map(str::to_string),
        });
        with_annotations(t, &[annotations::STORAGE_CLASS_LISTING])
    }

    #[test]
    fn test_listing_gates_get() {
        let t = tenant("oil", OwnerKind::User, "alice");
        assert!(!grants(&t, ScopedKind::StorageClass, &Method::GET));

        let t = with_annotations(t, &[annotations::STORAGE_CLASS_LISTING]);
        assert!(grants(&t, ScopedKind::StorageClass, &Method::GET));
        assert!(!grants(&t, ScopedKind::IngressClass, &Method::GET));
    }

    #[test]
    fn test_update_and_deletion_require_listing() {
        let t = with_annotations(
            tenant("oil", OwnerKind::User, "alice"),
            &[annotations::NODE_UPDATE, annotations::NODE_DELETION],
        );
        assert!(!grants(&t, ScopedKind::Node, &Method::PATCH));
        assert!(!grants(&t, ScopedKind::Node, &Method::DELETE));

        let t = with_annotations(t, &[annotations::NODE_LISTING]);
        assert!(grants(&t, ScopedKind::Node, &Method::PUT));
        assert!(grants(&t, ScopedKind::Node, &Method::PATCH));
        assert!(grants(&t, ScopedKind::Node, &Method::DELETE));
        assert!(!grants(&t, ScopedKind::Node, &Method::POST));
    }

    #[test]
    fn test_exact_names_sorted_and_deduplicated() {
        let tenants = vec![
            storage_tenant("oil", &["slow", "fast"], None),
            storage_tenant("gas", &["fast", "archive"], None),
        ];
        match Scope::collect(ScopedKind::StorageClass, &Method::GET, &tenants) {
            Scope::Classes { exact, regex } => {
                assert_eq!(exact, vec!["archive", "fast", "slow"]);
                assert!(regex.is_empty());
            }
            other => panic!("unexpected scope {:?}", other),
        }
    }

    #[test]
    fn test_exact_match_is_case_sensitive() {
        let tenants = vec![storage_tenant("oil", &["fast"], None)];
        let scope = Scope::collect(ScopedKind::StorageClass, &Method::GET, &tenants);
        assert!(scope.contains(&ObjectRef::named("fast")));
        assert!(!scope.contains(&ObjectRef::named("Fast")));
    }

    #[test]
    fn test_regex_match() {
        let tenants = vec![storage_tenant("oil", &[], Some("^gold-.*"))];
        let scope = Scope::collect(ScopedKind::StorageClass, &Method::GET, &tenants);
        assert!(scope.contains(&ObjectRef::named("gold-1")));
        assert!(!scope.contains(&ObjectRef::named("silver-1")));
    }

    #[test]
    fn test_invalid_regex_is_skipped() {
        let tenants = vec![
            storage_tenant("oil", &[], Some("(unclosed")),
            storage_tenant("gas", &["fast"], None),
        ];
        let scope = Scope::collect(ScopedKind::StorageClass, &Method::GET, &tenants);
        assert!(scope.contains(&ObjectRef::named("fast")));
        assert!(!scope.contains(&ObjectRef::named("(unclosed")));
    }

    #[test]
    fn test_tenant_without_grant_does_not_contribute() {
        let mut t = tenant("oil", OwnerKind::User, "alice");
        t.spec.storage_classes = Some(AllowedListSpec {
            exact: vec!["fast".into()],
            regex: None,
        });
        let scope = Scope::collect(ScopedKind::StorageClass, &Method::GET, &[t]);
        assert!(!scope.contains(&ObjectRef::named("fast")));
    }

    #[test]
    fn test_node_selector_superset_match() {
        let mut t = tenant("oil", OwnerKind::User, "alice");
        t.spec.node_selector = Some(BTreeMap::from([("pool".to_string(), "oil".to_string())]));
        let empty = with_annotations(
            tenant("gas", OwnerKind::User, "alice"),
            &[annotations::NODE_LISTING],
        );
        let tenants = vec![with_annotations(t, &[annotations::NODE_LISTING]), empty];
        let scope = Scope::collect(ScopedKind::Node, &Method::GET, &tenants);

        let node = |labels: &[(&str, &str)]| ObjectRef {
            name: "worker".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        assert!(scope.contains(&node(&[("pool", "oil"), ("zone", "a")])));
        assert!(!scope.contains(&node(&[("pool", "gas")])));
        assert!(!scope.contains(&node(&[])));
    }
}
