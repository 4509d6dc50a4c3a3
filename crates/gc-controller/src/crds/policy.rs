//! `GarbageCollectionPolicy` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Namespace value that widens a target to every namespace (and to cluster-scoped kinds).
pub const ALL_NAMESPACES: &str = "*";

/// Annotation that exempts an individual resource from collection
pub const ANNOTATION_PRESERVE: &str = "gc.platform/preserve";

/// `GarbageCollectionPolicy` CRD describing what to collect and how fast
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "gc.platform", version = "v1alpha1", kind = "GarbageCollectionPolicy")]
#[kube(namespaced)]
#[kube(status = "GarbageCollectionPolicyStatus")]
#[kube(shortname = "gcp")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetResource.kind"}"#)]
#[kube(printcolumn = r#"{"name":"Matched","type":"integer","jsonPath":".status.resourcesMatched"}"#)]
#[kube(printcolumn = r#"{"name":"Deleted","type":"integer","jsonPath":".status.totalDeleted"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct GarbageCollectionPolicySpec {
    /// Resource type, scope and selectors to watch
    #[serde(rename = "targetResource")]
    pub target_resource: TargetResource,

    /// Expiration rule
    pub ttl: TtlSpec,

    /// Extra conditions a resource must satisfy (all AND-ed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionSet>,

    /// Deletion throughput and semantics
    #[serde(default)]
    pub behavior: Behavior,

    /// Suspend deletions while keeping the watch alive
    #[serde(default)]
    pub paused: bool,
}

/// Target resource descriptor
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TargetResource {
    /// `v1` for the core group, otherwise `group/version`
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    /// Plural resource name; derived from `kind` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Namespace to watch. Unset means the policy's own namespace, `*` means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, rename = "labelSelector", skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// Field path to exact string value
    #[serde(default, rename = "fieldSelector", skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<BTreeMap<String, String>>,
}

impl TargetResource {
    /// Splits `apiVersion` into `(group, version)`; the core group is the empty string.
    #[must_use]
    pub fn group_version(&self) -> (String, String) {
        match self.api_version.trim().split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.trim().to_string()),
        }
    }
}

/// Kubernetes-style label selector
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LabelSelector {
    #[serde(default, rename = "matchLabels", skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, rename = "matchExpressions", skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// TTL rule. Exactly one mode is expected; overlaps resolve as
/// fixed, then field-path/mapped, then relative.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TtlSpec {
    /// Fixed mode: seconds after `metadata.creationTimestamp`
    #[serde(default, rename = "secondsAfterCreation", skip_serializing_if = "Option::is_none")]
    pub seconds_after_creation: Option<i64>,

    /// Field-path mode (or mapped mode when `mappings` is set)
    #[serde(default, rename = "fieldPath", skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,

    /// Mapped mode: field value to TTL seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<BTreeMap<String, i64>>,

    /// Mapped mode fallback when the value has no mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<i64>,

    /// Relative mode: field path holding the reference timestamp
    #[serde(default, rename = "relativeTo", skip_serializing_if = "Option::is_none")]
    pub relative_to: Option<String>,

    /// Relative mode: seconds after the reference timestamp
    #[serde(default, rename = "secondsAfter", skip_serializing_if = "Option::is_none")]
    pub seconds_after: Option<i64>,
}

/// Optional condition set; every declared condition must hold
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ConditionSet {
    /// Allowed values of `.status.phase`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<MetadataCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<MetadataCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldCondition>,
}

/// Condition on a label or annotation key
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetadataCondition {
    pub key: String,
    pub operator: MetadataOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MetadataOperator {
    Exists,
    Equals,
    In,
    NotIn,
}

/// Condition on an arbitrary field path
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct FieldCondition {
    #[serde(rename = "fieldPath")]
    pub field_path: String,
    pub operator: FieldOperator,
    /// Comparison value. For `Exists`, `"false"` negates the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum FieldOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    GreaterThan,
}

/// Deletion behavior
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Behavior {
    /// Token bucket rate and burst; non-positive falls back to the controller default
    #[serde(default, rename = "maxDeletionsPerSecond", skip_serializing_if = "Option::is_none")]
    pub max_deletions_per_second: Option<i32>,

    /// Deletions issued together before moving to the next group
    #[serde(default, rename = "batchSize", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,

    /// Log intended deletions without calling the API server
    #[serde(default, rename = "dryRun")]
    pub dry_run: bool,

    #[serde(default, rename = "propagationPolicy")]
    pub propagation_policy: Propagation,

    #[serde(default, rename = "gracePeriodSeconds", skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Propagation {
    Foreground,
    #[default]
    Background,
    Orphan,
}

impl From<Propagation> for kube::api::PropagationPolicy {
    fn from(value: Propagation) -> Self {
        match value {
            Propagation::Foreground => kube::api::PropagationPolicy::Foreground,
            Propagation::Background => kube::api::PropagationPolicy::Background,
            Propagation::Orphan => kube::api::PropagationPolicy::Orphan,
        }
    }
}

/// Policy phase as reported in status
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PolicyPhase {
    Active,
    Paused,
    Error,
}

impl std::fmt::Display for PolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyPhase::Active => write!(f, "Active"),
            PolicyPhase::Paused => write!(f, "Paused"),
            PolicyPhase::Error => write!(f, "Error"),
        }
    }
}

/// Status of the `GarbageCollectionPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GarbageCollectionPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PolicyPhase>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resources matching selectors and conditions in the last pass
    #[serde(default, rename = "resourcesMatched")]
    pub resources_matched: u32,

    /// Resources deleted in the last pass
    #[serde(default, rename = "resourcesDeleted")]
    pub resources_deleted: u32,

    /// Matched resources whose TTL has not elapsed yet
    #[serde(default, rename = "resourcesPending")]
    pub resources_pending: u32,

    /// Resources deleted since the policy was created
    #[serde(default, rename = "totalDeleted")]
    pub total_deleted: u64,

    /// RFC 3339 timestamp of the last evaluation pass
    #[serde(default, rename = "lastRunTime", skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<String>,

    /// RFC 3339 timestamp of the next scheduled pass
    #[serde(default, rename = "nextRunTime", skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<String>,

    #[serde(default, rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GarbageCollectionPolicySpec {
    /// Structural checks an admission webhook would apply.
    ///
    /// The controller only reports these; evaluation still fails safe
    /// ("no TTL" / "no match") on whatever reaches it.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let target = &self.target_resource;

        if target.api_version.trim().is_empty() {
            problems.push("targetResource.apiVersion must be set".to_string());
        } else {
            let (_, version) = target.group_version();
            if version.is_empty() || version.contains('/') {
                problems.push(format!(
                    "targetResource.apiVersion '{}' is not of the form 'version' or 'group/version'",
                    target.api_version
                ));
            }
        }
        if target.kind.trim().is_empty() {
            problems.push("targetResource.kind must be set".to_string());
        }

        let ttl = &self.ttl;
        let modes = [
            ttl.seconds_after_creation.is_some(),
            ttl.field_path.is_some(),
            ttl.relative_to.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        match modes {
            0 => problems.push(
                "ttl must set one of secondsAfterCreation, fieldPath or relativeTo".to_string(),
            ),
            1 => {}
            _ => problems.push(
                "ttl modes are exclusive; only the highest-priority mode will apply".to_string(),
            ),
        }
        if ttl.mappings.is_some() && ttl.field_path.is_none() {
            problems.push("ttl.mappings requires ttl.fieldPath".to_string());
        }
        if ttl.default.is_some() && ttl.mappings.is_none() {
            problems.push("ttl.default is only used together with ttl.mappings".to_string());
        }
        if ttl.seconds_after.is_some() && ttl.relative_to.is_none() {
            problems.push("ttl.secondsAfter requires ttl.relativeTo".to_string());
        }
        if ttl.seconds_after_creation.is_some_and(|s| s < 0) {
            problems.push("ttl.secondsAfterCreation must not be negative".to_string());
        }

        if let Some(conditions) = &self.conditions {
            for field in &conditions.fields {
                let needs_values = matches!(field.operator, FieldOperator::In | FieldOperator::NotIn);
                let needs_value = matches!(
                    field.operator,
                    FieldOperator::Equals | FieldOperator::NotEquals | FieldOperator::GreaterThan
                );
                if needs_values && field.values.is_empty() {
                    problems.push(format!(
                        "conditions.fields[{}]: operator {:?} requires values",
                        field.field_path, field.operator
                    ));
                }
                if needs_value && field.value.is_none() {
                    problems.push(format!(
                        "conditions.fields[{}]: operator {:?} requires value",
                        field.field_path, field.operator
                    ));
                }
            }
        }

        if self.behavior.batch_size.is_some_and(|b| b < 0) {
            problems.push("behavior.batchSize must not be negative".to_string());
        }

        problems
    }
}
