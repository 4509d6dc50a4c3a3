//! Selector and condition matching
//!
//! Selectors (namespace scope, label selector, field selector) are evaluated
//! first because they are cheap and mirror what the watch already filters on
//! the server side. Conditions need deeper document inspection and run second.

pub mod condition;
pub mod selector;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::crds::GarbageCollectionPolicySpec;

/// Full match of a resource against a policy.
///
/// `namespace` is the resolved watch scope: `Some(ns)` for a single namespace,
/// `None` for all namespaces.
#[must_use]
pub fn matches(
    spec: &GarbageCollectionPolicySpec,
    namespace: Option<&str>,
    resource: &DynamicObject,
    doc: &Value,
) -> bool {
    selector::matches(&spec.target_resource, namespace, resource, doc)
        && condition::matches(spec.conditions.as_ref(), resource, doc)
}
