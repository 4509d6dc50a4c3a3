//! Condition evaluation (phase, labels, annotations, arbitrary fields)
//!
//! Every declared condition must hold. A condition that references something
//! the resource does not have is false, except an `Exists` check negated with
//! the value `"false"`.

use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crds::{ConditionSet, FieldCondition, FieldOperator, MetadataCondition, MetadataOperator};
use crate::fieldpath;

const PHASE_PATH: &str = ".status.phase";

#[must_use]
pub fn matches(conditions: Option<&ConditionSet>, resource: &DynamicObject, doc: &Value) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };

    phase_matches(&conditions.phase, doc)
        && conditions
            .labels
            .iter()
            .all(|c| metadata_condition(c, resource.metadata.labels.as_ref()))
        && conditions
            .annotations
            .iter()
            .all(|c| metadata_condition(c, resource.metadata.annotations.as_ref()))
        && conditions.fields.iter().all(|c| field_condition(c, doc))
}

fn phase_matches(phases: &[String], doc: &Value) -> bool {
    if phases.is_empty() {
        return true;
    }
    fieldpath::lookup(doc, PHASE_PATH)
        .and_then(fieldpath::as_string)
        .is_some_and(|phase| phases.contains(&phase))
}

fn negated(value: Option<&String>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
}

fn metadata_condition(condition: &MetadataCondition, map: Option<&BTreeMap<String, String>>) -> bool {
    let actual = map.and_then(|m| m.get(&condition.key));

    match condition.operator {
        MetadataOperator::Exists => {
            if negated(condition.value.as_ref()) {
                actual.is_none()
            } else {
                actual.is_some()
            }
        }
        MetadataOperator::Equals => actual.is_some() && actual == condition.value.as_ref(),
        MetadataOperator::In => actual.is_some_and(|v| condition.values.contains(v)),
        MetadataOperator::NotIn => actual.is_some_and(|v| !condition.values.contains(v)),
    }
}

pub(crate) fn field_condition(condition: &FieldCondition, doc: &Value) -> bool {
    let resolved = fieldpath::lookup(doc, &condition.field_path);
    let expected = condition.value.as_deref();

    match (condition.operator, resolved) {
        (FieldOperator::Exists, found) => {
            if negated(condition.value.as_ref()) {
                found.is_none()
            } else {
                found.is_some()
            }
        }
        (_, None) => false,
        (FieldOperator::Equals, Some(actual)) => expected.is_some_and(|e| scalar_eq(actual, e)),
        (FieldOperator::NotEquals, Some(actual)) => expected.is_some_and(|e| !scalar_eq(actual, e)),
        (FieldOperator::In, Some(actual)) => condition.values.iter().any(|e| scalar_eq(actual, e)),
        (FieldOperator::NotIn, Some(actual)) => !condition.values.iter().any(|e| scalar_eq(actual, e)),
        (FieldOperator::GreaterThan, Some(actual)) => expected.is_some_and(|e| greater_than(actual, e)),
    }
}

/// String equality, with numeric equality as a fallback so `3` equals `"3.0"`.
fn scalar_eq(actual: &Value, expected: &str) -> bool {
    if fieldpath::as_string(actual).is_some_and(|s| s == expected) {
        return true;
    }
    match (fieldpath::as_f64(actual), expected.trim().parse::<f64>()) {
        (Some(a), Ok(e)) => (a - e).abs() < f64::EPSILON,
        _ => false,
    }
}

/// Numeric comparison first, then RFC 3339 timestamps.
fn greater_than(actual: &Value, expected: &str) -> bool {
    if let (Some(a), Ok(e)) = (fieldpath::as_f64(actual), expected.trim().parse::<f64>()) {
        return a > e;
    }
    match (
        fieldpath::as_timestamp(actual),
        fieldpath::as_timestamp(&Value::String(expected.to_string())),
    ) {
        (Some(a), Some(e)) => a > e,
        _ => false,
    }
}
