//! Policy reconciliation
//!
//! [`Reconciler`] drives one policy through NotTracked, Active, Paused and
//! Error: it owns nothing itself but coordinates the registry (watch and
//! limiter per UID), the evaluator, and the status/event collaborators.
//! [`reconcile`] and [`run_controller`] wire it into the kube-rs runtime.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerRuntimeConfig, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffExecutor;
use crate::client::{
    EventKind, EventRecorder, KubeDynamicClient, KubeEventRecorder, KubeStatusUpdater, PolicyRef,
    StatusUpdater,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::crds::{
    GarbageCollectionPolicy, GarbageCollectionPolicySpec, GarbageCollectionPolicyStatus, PolicyPhase,
};
use crate::evaluation::{EvaluationResult, Evaluator};
use crate::leader::LeadershipSignal;
use crate::rate_limit::effective_rate;
use crate::registry::PolicyRegistry;
use crate::types::{Error, Result, POLICY_FINALIZER_NAME};
use crate::watch::{ReflectorWatchProvider, WatchError, WatchTarget};

pub use crate::registry::PolicyState;

/// What one [`Reconciler::apply`] call did
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub state: PolicyState,
    /// Counters of the pass; `None` when nothing was evaluated
    pub result: Option<EvaluationResult>,
    pub requeue_after: Duration,
}

/// When a policy last ran, and against which spec
struct LastPass {
    spec: GarbageCollectionPolicySpec,
    at: DateTime<Utc>,
}

pub struct Reconciler {
    registry: Arc<PolicyRegistry>,
    passes: DashMap<String, LastPass>,
    evaluator: Evaluator,
    status: Arc<dyn StatusUpdater>,
    recorder: Arc<dyn EventRecorder>,
    leadership: Arc<dyn LeadershipSignal>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        evaluator: Evaluator,
        status: Arc<dyn StatusUpdater>,
        recorder: Arc<dyn EventRecorder>,
        leadership: Arc<dyn LeadershipSignal>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            passes: DashMap::new(),
            evaluator,
            status,
            recorder,
            leadership,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        self.config.gc_interval()
    }

    /// Followers poll at the lease renew cadence so a new leader starts promptly
    #[must_use]
    pub fn follower_requeue(&self) -> Duration {
        let renew = Duration::from_secs(self.config.leader_election.renew_interval_seconds.max(1));
        self.gc_interval().min(renew)
    }

    /// Brings the engine in line with `policy` and, when it is active, runs
    /// one evaluation pass.
    #[instrument(skip_all, fields(policy = %policy.name_any(), namespace = %policy.namespace().unwrap_or_default()))]
    pub async fn apply(&self, policy: &GarbageCollectionPolicy) -> Result<ReconcileOutcome> {
        let policy_ref = PolicyRef::from_policy(policy)?;
        let uid = policy_ref.uid.as_str();
        let requeue_after = self.gc_interval();

        if !self.is_leader() {
            self.passes.remove(uid);
            if self.registry.remove(uid).await {
                info!(uid, "Not leader, dropped local policy state");
            }
            return Ok(ReconcileOutcome {
                state: PolicyState::NotTracked,
                result: None,
                requeue_after: self.follower_requeue(),
            });
        }

        let previous = self.registry.state(uid).await;

        // Status writes come back as watch events; only spec changes or the
        // interval elapsing start a new pass
        if let Some(wait) = self.not_due(uid, policy) {
            debug!(uid, wait = ?wait, "Policy not due yet");
            return Ok(ReconcileOutcome {
                state: previous,
                result: None,
                requeue_after: wait,
            });
        }
        self.passes.insert(
            uid.to_string(),
            LastPass {
                spec: policy.spec.clone(),
                at: self.clock.now(),
            },
        );
        self.report_problems(policy, &policy_ref).await;

        let target = match WatchTarget::from_policy(policy) {
            Ok(target) => target,
            Err(e) => return Ok(self.fail(policy, &policy_ref, previous, &Error::from(e)).await),
        };

        if policy.spec.paused {
            let handles = match self.registry.handles(uid).await {
                // A target edited while paused still replaces the watch
                Some(handles) if handles.target != target => {
                    let rate = self.effective_rate(policy);
                    if let Err(e) = self.registry.ensure(uid, &target, rate).await {
                        return Ok(self.fail(policy, &policy_ref, previous, &e).await);
                    }
                    self.registry.handles(uid).await
                }
                other => other,
            };
            let result = match handles {
                Some(handles) => self.evaluator.scan(policy, &handles.target, handles.cache.as_ref()),
                None => EvaluationResult::default(),
            };
            self.transition(&policy_ref, previous, PolicyState::Paused).await;
            let message = "Policy is paused; deletions are suspended".to_string();
            self.write_status(policy, &policy_ref, PolicyState::Paused, &result, message)
                .await;
            return Ok(ReconcileOutcome {
                state: PolicyState::Paused,
                result: Some(result),
                requeue_after,
            });
        }

        let rate = self.effective_rate(policy);
        if let Err(e) = self.registry.ensure(uid, &target, rate).await {
            return Ok(self.fail(policy, &policy_ref, previous, &e).await);
        }
        let Some(handles) = self.registry.handles(uid).await else {
            let e = Error::Watch(WatchError::Stopped { target: target.to_string() });
            return Ok(self.fail(policy, &policy_ref, previous, &e).await);
        };

        let result = self
            .evaluator
            .evaluate(
                policy,
                &handles.target,
                handles.cache.as_ref(),
                &handles.limiter,
                &handles.cancel,
            )
            .await;

        self.transition(&policy_ref, previous, PolicyState::Active).await;
        self.record_pass(&policy_ref, &result).await;

        let message = match &result.first_error {
            Some(first) => format!("{} deletion(s) failed; first error: {first}", result.failed),
            None if result.cancelled => "Evaluation interrupted".to_string(),
            None => format!(
                "Matched {} resource(s), deleted {}, pending {}",
                result.matched, result.deleted, result.pending
            ),
        };
        self.write_status(policy, &policy_ref, PolicyState::Active, &result, message)
            .await;

        Ok(ReconcileOutcome {
            state: PolicyState::Active,
            result: Some(result),
            requeue_after,
        })
    }

    /// Releases everything held for `uid`. Safe to call repeatedly.
    pub async fn teardown(&self, uid: &str) -> bool {
        self.passes.remove(uid);
        let removed = self.registry.remove(uid).await;
        if removed {
            info!(uid, "Policy torn down");
        }
        removed
    }

    /// Forgets every policy whose UID is not in `live`
    pub async fn prune(&self, live: &HashSet<String>) -> Vec<String> {
        self.passes.retain(|uid, _| live.contains(uid));
        self.registry.prune(live).await
    }

    fn effective_rate(&self, policy: &GarbageCollectionPolicy) -> f64 {
        effective_rate(
            policy.spec.behavior.max_deletions_per_second,
            self.config.default_max_deletions_per_second,
        )
    }

    /// Time left before `policy` is due again; `None` when it should run now
    fn not_due(&self, uid: &str, policy: &GarbageCollectionPolicy) -> Option<Duration> {
        let last = self.passes.get(uid)?;
        if last.spec != policy.spec {
            return None;
        }
        let elapsed = (self.clock.now() - last.at).to_std().unwrap_or_default();
        self.gc_interval()
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    async fn fail(
        &self,
        policy: &GarbageCollectionPolicy,
        policy_ref: &PolicyRef,
        previous: PolicyState,
        err: &Error,
    ) -> ReconcileOutcome {
        warn!(policy = %policy_ref, error = %err, "Policy cannot be served");
        self.transition(policy_ref, previous, PolicyState::Error).await;
        self.event(policy_ref, EventKind::Warning, "WatchFailed", &err.to_string())
            .await;
        self.write_status(
            policy,
            policy_ref,
            PolicyState::Error,
            &EvaluationResult::default(),
            err.to_string(),
        )
        .await;
        ReconcileOutcome {
            state: PolicyState::Error,
            result: None,
            requeue_after: self.gc_interval(),
        }
    }

    async fn transition(&self, policy_ref: &PolicyRef, previous: PolicyState, next: PolicyState) {
        self.registry.set_state(&policy_ref.uid, next).await;
        if previous == next {
            return;
        }

        info!(policy = %policy_ref, from = %previous, to = %next, "Policy phase changed");
        let kind = if next == PolicyState::Error {
            EventKind::Warning
        } else {
            EventKind::Normal
        };
        let message = format!("Phase changed from {previous} to {next}");
        self.event(policy_ref, kind, "PhaseChanged", &message).await;
    }

    /// Structural warnings, reported once per generation
    async fn report_problems(&self, policy: &GarbageCollectionPolicy, policy_ref: &PolicyRef) {
        let observed = policy.status.as_ref().and_then(|s| s.observed_generation);
        if observed.is_some() && observed == policy.metadata.generation {
            return;
        }
        let problems = policy.spec.validate();
        if problems.is_empty() {
            return;
        }
        warn!(policy = %policy_ref, problems = ?problems, "Policy has structural problems");
        self.event(policy_ref, EventKind::Warning, "InvalidPolicy", &problems.join("; "))
            .await;
    }

    async fn record_pass(&self, policy_ref: &PolicyRef, result: &EvaluationResult) {
        if result.deleted > 0 {
            let message = format!("Deleted {} expired resource(s)", result.deleted);
            self.event(policy_ref, EventKind::Normal, "ResourceDeleted", &message)
                .await;
        }
        if result.dry_run > 0 {
            let message = format!("Dry run: {} resource(s) would be deleted", result.dry_run);
            self.event(policy_ref, EventKind::Normal, "DryRun", &message).await;
        }
    }

    async fn event(&self, policy_ref: &PolicyRef, kind: EventKind, reason: &str, message: &str) {
        if let Err(e) = self.recorder.record(policy_ref, kind, reason, message).await {
            debug!(policy = %policy_ref, reason, error = %e, "Failed to record event");
        }
    }

    async fn write_status(
        &self,
        policy: &GarbageCollectionPolicy,
        policy_ref: &PolicyRef,
        state: PolicyState,
        result: &EvaluationResult,
        message: String,
    ) {
        let status = self.status_for(policy, state, result, message);
        if let Err(e) = self.status.update_status(policy_ref, &status).await {
            warn!(policy = %policy_ref, error = %e, "Failed to update policy status");
        }
    }

    fn status_for(
        &self,
        policy: &GarbageCollectionPolicy,
        state: PolicyState,
        result: &EvaluationResult,
        message: String,
    ) -> GarbageCollectionPolicyStatus {
        let now = self.clock.now();
        let previous_total = policy.status.as_ref().map_or(0, |s| s.total_deleted);
        let next_run = chrono::Duration::from_std(self.gc_interval())
            .ok()
            .and_then(|interval| now.checked_add_signed(interval));

        GarbageCollectionPolicyStatus {
            phase: match state {
                PolicyState::Active => Some(PolicyPhase::Active),
                PolicyState::Paused => Some(PolicyPhase::Paused),
                PolicyState::Error => Some(PolicyPhase::Error),
                PolicyState::NotTracked => None,
            },
            message: Some(message),
            resources_matched: result.matched,
            resources_deleted: result.deleted,
            resources_pending: result.pending,
            total_deleted: previous_total + u64::from(result.deleted),
            last_run_time: Some(now.to_rfc3339()),
            next_run_time: next_run.map(|at| at.to_rfc3339()),
            observed_generation: policy.metadata.generation,
        }
    }
}

/// Shared state handed to every reconcile call
pub struct Context {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
}

#[instrument(skip_all, fields(policy = %policy.name_any(), namespace = %policy.namespace().unwrap_or_default()))]
pub async fn reconcile(policy: Arc<GarbageCollectionPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let reconciler = &ctx.reconciler;

    // Followers neither add nor remove finalizers
    if !reconciler.is_leader() {
        if let Some(uid) = policy.uid() {
            reconciler.teardown(&uid).await;
        }
        return Ok(Action::requeue(reconciler.follower_requeue()));
    }

    let namespace = policy
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let policies: Api<GarbageCollectionPolicy> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&policies, POLICY_FINALIZER_NAME, policy, |event| async {
        match event {
            FinalizerEvent::Apply(policy) => reconciler.apply(&policy).await.map(|outcome| {
                debug!(state = %outcome.state, "Policy reconciled");
                Action::requeue(outcome.requeue_after)
            }),
            FinalizerEvent::Cleanup(policy) => {
                if let Some(uid) = policy.uid() {
                    reconciler.teardown(&uid).await;
                }
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| match e {
        FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
        FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => Error::KubeError(e),
        FinalizerError::UnnamedObject => Error::MissingObjectKey(".metadata.name"),
        FinalizerError::InvalidFinalizer => Error::ConfigError("Invalid finalizer name".to_string()),
    })
}

/// Failed reconciles come back on the regular cadence
pub fn error_policy(policy: Arc<GarbageCollectionPolicy>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = %err,
        policy = %policy.name_any(),
        "Policy reconciliation failed"
    );
    Action::requeue(ctx.reconciler.gc_interval())
}

/// Runs the policy controller until `shutdown` fires.
#[instrument(skip_all)]
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    leadership: Arc<dyn LeadershipSignal>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting GarbageCollectionPolicy controller");

    let dynamic = KubeDynamicClient::new(client.clone());
    let provider = Arc::new(ReflectorWatchProvider::new(dynamic.clone(), config.ready_timeout()));
    let registry = Arc::new(PolicyRegistry::new(provider, shutdown.child_token()));
    let recorder: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(
        client.clone(),
        std::env::var("POD_NAME").ok(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let evaluator = Evaluator::new(
        Arc::new(dynamic),
        BackoffExecutor::new(config.backoff_policy()),
        recorder.clone(),
        clock.clone(),
        config.default_batch_size,
        config.dry_run,
    );
    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        evaluator,
        Arc::new(KubeStatusUpdater::new(client.clone())),
        recorder,
        leadership,
        clock,
        config.clone(),
    ));
    let context = Arc::new(Context {
        client: client.clone(),
        reconciler: reconciler.clone(),
    });

    let policies: Api<GarbageCollectionPolicy> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let controller = Controller::new(policies, watcher::Config::default().any_semantic())
        .with_config(ControllerRuntimeConfig::default().concurrency(config.max_concurrent_evaluations))
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        });

    let pruner = tokio::spawn(prune_deleted(
        controller.store(),
        reconciler,
        config.gc_interval(),
        shutdown.clone(),
    ));
    let stopper = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            let _ = stop_tx.send(());
        }
    });

    controller
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((policy, _)) => debug!(policy = %policy, "Reconciliation successful"),
                Err(e) => warn!(error = %e, "Reconciliation error"),
            }
        })
        .await;

    pruner.abort();
    stopper.abort();
    registry.shutdown().await;

    info!("GarbageCollectionPolicy controller shut down");
    Ok(())
}

/// Drops registry entries whose policy vanished without a cleanup reconcile
async fn prune_deleted(
    store: Store<GarbageCollectionPolicy>,
    reconciler: Arc<Reconciler>,
    every: Duration,
    shutdown: CancellationToken,
) {
    // An empty store before the first list would prune everything
    tokio::select! {
        () = shutdown.cancelled() => return,
        ready = store.wait_until_ready() => {
            if ready.is_err() {
                return;
            }
        }
    }

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let live: HashSet<String> = store.state().iter().filter_map(|policy| policy.uid()).collect();
        reconciler.prune(&live).await;
    }
}
