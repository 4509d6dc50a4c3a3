//! Namespace, label and field selectors
//!
//! Label selectors follow Kubernetes semantics exactly (they are also sent to
//! the API server), so `NotIn` and `DoesNotExist` match objects lacking the key.

use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crds::{LabelSelector, SelectorOperator, TargetResource};
use crate::fieldpath;

/// Field selector keys the API server understands for every resource kind.
const SERVER_SIDE_FIELDS: [&str; 2] = ["metadata.name", "metadata.namespace"];

#[must_use]
pub fn matches(
    target: &TargetResource,
    namespace: Option<&str>,
    resource: &DynamicObject,
    doc: &Value,
) -> bool {
    if let Some(ns) = namespace {
        if resource.metadata.namespace.as_deref() != Some(ns) {
            return false;
        }
    }

    if let Some(selector) = &target.label_selector {
        if !label_selector_matches(selector, resource.metadata.labels.as_ref()) {
            return false;
        }
    }

    if let Some(fields) = &target.field_selector {
        let all = fields.iter().all(|(path, expected)| {
            fieldpath::lookup(doc, path)
                .and_then(fieldpath::as_string)
                .is_some_and(|actual| actual == *expected)
        });
        if !all {
            return false;
        }
    }

    true
}

#[must_use]
pub fn label_selector_matches(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let get = |key: &str| labels.and_then(|l| l.get(key));

    let labels_ok = selector
        .match_labels
        .iter()
        .all(|(key, value)| get(key) == Some(value));

    labels_ok
        && selector.match_expressions.iter().all(|req| {
            let actual = get(&req.key);
            match req.operator {
                SelectorOperator::In => actual.is_some_and(|v| req.values.contains(v)),
                SelectorOperator::NotIn => !actual.is_some_and(|v| req.values.contains(v)),
                SelectorOperator::Exists => actual.is_some(),
                SelectorOperator::DoesNotExist => actual.is_none(),
            }
        })
}

/// Renders a label selector in the API server's string syntax.
#[must_use]
pub fn label_selector_string(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    for req in &selector.match_expressions {
        let values = || req.values.join(",");
        parts.push(match req.operator {
            SelectorOperator::In => format!("{} in ({})", req.key, values()),
            SelectorOperator::NotIn => format!("{} notin ({})", req.key, values()),
            SelectorOperator::Exists => req.key.clone(),
            SelectorOperator::DoesNotExist => format!("!{}", req.key),
        });
    }

    parts.join(",")
}

/// Renders the server-side part of a field selector map.
///
/// Only `metadata.name`/`metadata.namespace` are pushed to the API server; other
/// keys are unsupported for most kinds and are enforced client-side by [`matches`].
#[must_use]
pub fn field_selector_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .filter_map(|(path, value)| {
            let key = path.trim().trim_start_matches('.');
            SERVER_SIDE_FIELDS
                .contains(&key)
                .then(|| format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(",")
}
