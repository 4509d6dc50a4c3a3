//! Fakes shared by the integration tests
#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gc_controller::backoff::BackoffExecutor;
use gc_controller::client::{DynamicClient, EventKind, EventRecorder, PolicyRef, StatusUpdater};
use gc_controller::clock::ManualClock;
use gc_controller::controller::Reconciler;
use gc_controller::leader::LeadershipSignal;
use gc_controller::watch::{ResourceCache, WatchEntry, WatchError, WatchProvider, WatchTarget};
use gc_controller::{
    ControllerConfig, Evaluator, GarbageCollectionPolicy, GarbageCollectionPolicySpec,
    GarbageCollectionPolicyStatus, PolicyRegistry,
};
use kube::api::{DeleteParams, DynamicObject};
use kube::core::ErrorResponse;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}

/// A namespaced ConfigMap created at `created`
pub fn config_map(
    namespace: &str,
    name: &str,
    created: DateTime<Utc>,
    labels: serde_json::Value,
) -> Arc<DynamicObject> {
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("{namespace}-{name}"),
                "creationTimestamp": created.to_rfc3339(),
                "labels": labels
            },
            "data": {}
        }))
        .unwrap(),
    )
}

pub fn policy(namespace: &str, name: &str, uid: &str, spec_yaml: &str) -> GarbageCollectionPolicy {
    let spec: GarbageCollectionPolicySpec = serde_yaml::from_str(spec_yaml).unwrap();
    let mut policy = GarbageCollectionPolicy::new(name, spec);
    policy.metadata.namespace = Some(namespace.to_string());
    policy.metadata.uid = Some(uid.to_string());
    policy.metadata.generation = Some(1);
    policy
}

#[derive(Default)]
pub struct MemoryCache {
    objects: Mutex<Vec<Arc<DynamicObject>>>,
}

impl MemoryCache {
    pub fn insert(&self, object: Arc<DynamicObject>) {
        self.objects.lock().unwrap().push(object);
    }

    pub fn with(objects: Vec<Arc<DynamicObject>>) -> Self {
        Self {
            objects: Mutex::new(objects),
        }
    }
}

impl ResourceCache for MemoryCache {
    fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.objects.lock().unwrap().clone()
    }
}

/// Hands out one in-memory cache per namespace and remembers every watch it opened
#[derive(Default)]
pub struct FakeProvider {
    caches: Mutex<HashMap<String, Arc<MemoryCache>>>,
    opened: Mutex<Vec<(WatchTarget, CancellationToken)>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FakeProvider {
    pub fn cache(&self, namespace: &str) -> Arc<MemoryCache> {
        self.caches
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<(WatchTarget, CancellationToken)> {
        self.opened.lock().unwrap().clone()
    }

    /// Every `open` call, failed ones included
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatchProvider for FakeProvider {
    async fn open(&self, target: &WatchTarget, parent: &CancellationToken) -> Result<WatchEntry, WatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(WatchError::NotReady {
                target: target.to_string(),
                timeout: Duration::from_secs(30),
            });
        }
        let cache = self.cache(target.namespace().unwrap_or("*"));
        let token = parent.child_token();
        self.opened.lock().unwrap().push((target.clone(), token.clone()));
        Ok(WatchEntry::new(target.clone(), cache, token, None))
    }
}

/// Records deletions; errors can be scripted per object name
#[derive(Default)]
pub struct FakeClient {
    deleted: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, DeleteParams)>>,
    scripted: Mutex<HashMap<String, VecDeque<kube::Error>>>,
    always_fail: Mutex<HashMap<String, u16>>,
}

impl FakeClient {
    pub fn fail_always(&self, name: &str, code: u16) {
        self.always_fail.lock().unwrap().insert(name.to_string(), code);
    }

    pub fn fail_next(&self, name: &str, errors: Vec<kube::Error>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(name.to_string(), errors.into_iter().collect());
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(String, DeleteParams)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DynamicClient for FakeClient {
    async fn list(&self, _: &WatchTarget, _: Option<u32>) -> Result<Vec<DynamicObject>, kube::Error> {
        Ok(Vec::new())
    }

    async fn delete(
        &self,
        _: &WatchTarget,
        _: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), kube::Error> {
        self.calls.lock().unwrap().push((name.to_string(), params.clone()));
        if let Some(code) = self.always_fail.lock().unwrap().get(name) {
            return Err(api_error(*code, "Forbidden"));
        }
        if let Some(err) = self.scripted.lock().unwrap().get_mut(name).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    updates: Mutex<Vec<(PolicyRef, GarbageCollectionPolicyStatus)>>,
}

impl RecordingStatus {
    pub fn last(&self) -> GarbageCollectionPolicyStatus {
        self.updates.lock().unwrap().last().map(|(_, s)| s.clone()).unwrap()
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

#[async_trait]
impl StatusUpdater for RecordingStatus {
    async fn update_status(
        &self,
        policy: &PolicyRef,
        status: &GarbageCollectionPolicyStatus,
    ) -> gc_controller::Result<()> {
        self.updates.lock().unwrap().push((policy.clone(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(EventKind, String, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(_, reason, _)| reason.clone()).collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _, _)| *kind == EventKind::Warning)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(
        &self,
        _: &PolicyRef,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> gc_controller::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((kind, reason.to_string(), message.to_string()));
        Ok(())
    }
}

pub struct SwitchLeader(AtomicBool);

impl SwitchLeader {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl LeadershipSignal for SwitchLeader {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A reconciler wired to fakes
pub struct Harness {
    pub reconciler: Reconciler,
    pub registry: Arc<PolicyRegistry>,
    pub provider: Arc<FakeProvider>,
    pub client: Arc<FakeClient>,
    pub status: Arc<RecordingStatus>,
    pub events: Arc<RecordingEvents>,
    pub leader: Arc<SwitchLeader>,
    pub clock: Arc<ManualClock>,
    pub root: CancellationToken,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_config(now, ControllerConfig::default())
    }

    pub fn with_config(now: DateTime<Utc>, config: ControllerConfig) -> Self {
        let provider = Arc::new(FakeProvider::default());
        let client = Arc::new(FakeClient::default());
        let status = Arc::new(RecordingStatus::default());
        let events = Arc::new(RecordingEvents::default());
        let leader = Arc::new(SwitchLeader::new(true));
        let clock = Arc::new(ManualClock::new(now));
        let root = CancellationToken::new();

        let registry = Arc::new(PolicyRegistry::new(provider.clone(), root.clone()));
        let evaluator = Evaluator::new(
            client.clone(),
            BackoffExecutor::new(config.backoff_policy()),
            events.clone(),
            clock.clone(),
            config.default_batch_size,
            config.dry_run,
        );
        let reconciler = Reconciler::new(
            registry.clone(),
            evaluator,
            status.clone(),
            events.clone(),
            leader.clone(),
            clock.clone(),
            config,
        );

        Self {
            reconciler,
            registry,
            provider,
            client,
            status,
            events,
            leader,
            clock,
            root,
        }
    }
}
