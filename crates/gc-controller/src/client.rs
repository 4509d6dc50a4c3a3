//! Contracts for the cluster-facing collaborators and their kube-backed
//! implementations
//!
//! The evaluation and reconciliation code only talks to these traits, which
//! keeps them testable with in-memory fakes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crds::{GarbageCollectionPolicy, GarbageCollectionPolicyStatus};
use crate::types::{Error, Result, FIELD_MANAGER};
use crate::watch::WatchTarget;

/// Identity of a policy as seen by status and event collaborators
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PolicyRef {
    pub fn from_policy(policy: &GarbageCollectionPolicy) -> Result<Self> {
        Ok(Self {
            namespace: policy.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?,
            name: policy.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?,
            uid: policy.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        })
    }

    #[must_use]
    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(GarbageCollectionPolicy::api_version(&()).into_owned()),
            kind: Some(GarbageCollectionPolicy::kind(&()).into_owned()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.uid.clone()),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Untyped list and delete against arbitrary resource types
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// Lists objects of `target` within its namespace scope and selectors.
    async fn list(&self, target: &WatchTarget, limit: Option<u32>) -> Result<Vec<DynamicObject>, kube::Error>;

    /// Deletes one object. `namespace` is `None` for cluster-scoped kinds.
    async fn delete(
        &self,
        target: &WatchTarget,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), kube::Error>;
}

#[derive(Clone)]
pub struct KubeDynamicClient {
    client: Client,
}

impl KubeDynamicClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// API handle for `target`, scoped to `namespace` when given.
    #[must_use]
    pub fn api(&self, target: &WatchTarget, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = target.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn list(&self, target: &WatchTarget, limit: Option<u32>) -> Result<Vec<DynamicObject>, kube::Error> {
        let mut params: ListParams = target.list_params();
        if let Some(limit) = limit {
            params = params.limit(limit);
        }
        let list = self.api(target, target.namespace()).list(&params).await?;
        Ok(list.items)
    }

    async fn delete(
        &self,
        target: &WatchTarget,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), kube::Error> {
        self.api(target, namespace).delete(name, params).await?;
        Ok(())
    }
}

/// Writes policy status
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_status(&self, policy: &PolicyRef, status: &GarbageCollectionPolicyStatus) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeStatusUpdater {
    client: Client,
}

impl KubeStatusUpdater {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusUpdater for KubeStatusUpdater {
    async fn update_status(&self, policy: &PolicyRef, status: &GarbageCollectionPolicyStatus) -> Result<()> {
        let policies: Api<GarbageCollectionPolicy> = Api::namespaced(self.client.clone(), &policy.namespace);

        // Still bumps resourceVersion; the reconciler skips passes that are not due
        let status_patch = json!({ "status": status });
        policies
            .patch_status(
                &policy.name,
                &PatchParams::default(),
                &Patch::Merge(&status_patch),
            )
            .await?;

        debug!(policy = %policy, phase = ?status.phase, "Status updated");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Records Kubernetes events against a policy
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, policy: &PolicyRef, kind: EventKind, reason: &str, message: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    #[must_use]
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, policy: &PolicyRef, kind: EventKind, reason: &str, message: &str) -> Result<()> {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "GarbageCollect".to_string(),
            secondary: None,
        };
        self.recorder.publish(&event, &policy.object_reference()).await?;
        Ok(())
    }
}
