//! Per-policy resource watches
//!
//! A [`WatchTarget`] is the normalized, comparable form of a policy's
//! `targetResource`. A [`WatchProvider`] turns it into a running
//! [`WatchEntry`]: a background task keeping a local cache of matching objects
//! up to date, plus the token that stops it.

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{DynamicClient, KubeDynamicClient};
use crate::crds::{GarbageCollectionPolicy, ALL_NAMESPACES};
use crate::matcher::selector::{field_selector_string, label_selector_string};
use crate::types::PolicyError;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("initial list of {target} failed: {source}")]
    Probe {
        target: String,
        #[source]
        source: kube::Error,
    },

    #[error("cache for {target} not ready after {timeout:?}")]
    NotReady { target: String, timeout: Duration },

    #[error("watch for {target} stopped before its cache was ready")]
    Stopped { target: String },
}

/// What a policy watches, normalized so two targets compare equal iff the
/// watch they need is the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    /// `None` means all namespaces
    pub namespace: Option<String>,
    pub label_selector: String,
    pub field_selector: String,
}

impl WatchTarget {
    /// Resolves a policy's target. An unset namespace means the policy's own
    /// namespace and `*` means every namespace.
    pub fn from_policy(policy: &GarbageCollectionPolicy) -> Result<Self, PolicyError> {
        let target = &policy.spec.target_resource;

        if target.api_version.trim().is_empty() {
            return Err(PolicyError::EmptyTargetField { field: "apiVersion" });
        }
        if target.kind.trim().is_empty() {
            return Err(PolicyError::EmptyTargetField { field: "kind" });
        }
        let (group, version) = target.group_version();
        if version.is_empty() || version.contains('/') || (group.is_empty() && target.api_version.contains('/')) {
            return Err(PolicyError::MalformedApiVersion(target.api_version.clone()));
        }

        let namespace = match target.namespace.as_deref().map(str::trim) {
            Some(ALL_NAMESPACES) => None,
            Some(ns) if !ns.is_empty() => Some(ns.to_string()),
            _ => Some(policy.namespace().ok_or(PolicyError::MissingNamespace)?),
        };

        let kind = target.kind.trim().to_string();
        let plural = match target.resource.as_deref().map(str::trim) {
            Some(resource) if !resource.is_empty() => resource.to_string(),
            _ => ApiResource::from_gvk(&GroupVersionKind::gvk(&group, &version, &kind)).plural,
        };

        Ok(Self {
            group,
            version,
            kind,
            plural,
            namespace,
            label_selector: target
                .label_selector
                .as_ref()
                .map(label_selector_string)
                .unwrap_or_default(),
            field_selector: target
                .field_selector
                .as_ref()
                .map(field_selector_string)
                .unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }

    #[must_use]
    pub fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if !self.label_selector.is_empty() {
            params = params.labels(&self.label_selector);
        }
        if !self.field_selector.is_empty() {
            params = params.fields(&self.field_selector);
        }
        params
    }

    #[must_use]
    pub fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if !self.label_selector.is_empty() {
            config = config.labels(&self.label_selector);
        }
        if !self.field_selector.is_empty() {
            config = config.fields(&self.field_selector);
        }
        config
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)?;
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)?;
        }
        match &self.namespace {
            Some(ns) => write!(f, " in {ns}"),
            None => write!(f, " in all namespaces"),
        }
    }
}

/// Read access to a watch's local cache
pub trait ResourceCache: Send + Sync {
    /// Snapshot of every cached object
    fn list(&self) -> Vec<Arc<DynamicObject>>;
}

impl ResourceCache for Store<DynamicObject> {
    fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.state()
    }
}

/// A running watch. Dropping it cancels the background task.
pub struct WatchEntry {
    target: WatchTarget,
    cache: Arc<dyn ResourceCache>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatchEntry {
    pub fn new(
        target: WatchTarget,
        cache: Arc<dyn ResourceCache>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            target,
            cache,
            cancel,
            task,
        }
    }

    #[must_use]
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    #[must_use]
    pub fn cache(&self) -> Arc<dyn ResourceCache> {
        self.cache.clone()
    }

    /// Token cancelled when this watch stops
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the watch and waits for its task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(watch = %self.target, "Watch task panicked");
                }
            }
        }
        debug!(watch = %self.target, "Watch stopped");
    }
}

impl Drop for WatchEntry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchEntry")
            .field("target", &self.target)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Opens watches for targets
#[async_trait]
pub trait WatchProvider: Send + Sync {
    /// Starts a watch whose lifetime is bounded by `parent`.
    async fn open(
        &self,
        target: &WatchTarget,
        parent: &CancellationToken,
    ) -> Result<WatchEntry, WatchError>;
}

/// Watches backed by `kube::runtime::watcher` feeding a reflector store
#[derive(Clone)]
pub struct ReflectorWatchProvider {
    client: KubeDynamicClient,
    ready_timeout: Duration,
}

impl ReflectorWatchProvider {
    #[must_use]
    pub fn new(client: KubeDynamicClient, ready_timeout: Duration) -> Self {
        Self {
            client,
            ready_timeout,
        }
    }
}

#[async_trait]
impl WatchProvider for ReflectorWatchProvider {
    async fn open(
        &self,
        target: &WatchTarget,
        parent: &CancellationToken,
    ) -> Result<WatchEntry, WatchError> {
        // Unknown kinds and missing RBAC surface here instead of as endless watch retries
        self.client
            .list(target, Some(1))
            .await
            .map_err(|source| WatchError::Probe {
                target: target.to_string(),
                source,
            })?;

        let api = self.client.api(target, target.namespace());
        let writer = reflector::store::Writer::new(target.api_resource());
        let store = writer.as_reader();
        let stream = reflector(writer, watcher(api, target.watcher_config())).default_backoff();

        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let label = target.to_string();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(stream);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!(watch = %label, error = %e, "Watch stream error"),
                        None => break,
                    },
                }
            }
        });

        match tokio::time::timeout(self.ready_timeout, store.wait_until_ready()).await {
            Ok(Ok(())) => {
                info!(watch = %target, objects = store.state().len(), "Watch ready");
                Ok(WatchEntry::new(
                    target.clone(),
                    Arc::new(store),
                    cancel,
                    Some(task),
                ))
            }
            Ok(Err(_)) => {
                cancel.cancel();
                Err(WatchError::Stopped {
                    target: target.to_string(),
                })
            }
            Err(_) => {
                cancel.cancel();
                Err(WatchError::NotReady {
                    target: target.to_string(),
                    timeout: self.ready_timeout,
                })
            }
        }
    }
}
