//! Policy evaluation
//!
//! One pass over a policy's cached resources: match, check TTL, then delete
//! what has expired. Every deletion waits for a rate limiter token and runs
//! under the backoff executor. At most `batchSize` delete calls are in flight
//! at once; a deletion gives its slot back while it sleeps between retries,
//! so one resource's backoff never holds up the rest of the pass.
//!
//! A failing resource never aborts the pass. Cancellation stops issuing new
//! deletions and returns whatever was accomplished.

use futures::stream::{FuturesUnordered, StreamExt};
use kube::api::{DeleteParams, DynamicObject, Preconditions};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{BackoffExecutor, DeleteError, DeleteOutcome};
use crate::client::{DynamicClient, EventKind, EventRecorder, PolicyRef};
use crate::clock::Clock;
use crate::crds::{GarbageCollectionPolicy, ANNOTATION_PRESERVE};
use crate::fieldpath;
use crate::matcher;
use crate::rate_limit::RateLimiter;
use crate::ttl::{self, Expiry};
use crate::watch::{ResourceCache, WatchTarget};

/// Counters for one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationResult {
    /// Resources passing selectors and conditions
    pub matched: u32,
    /// Matched resources whose TTL had elapsed
    pub expired: u32,
    /// Deleted, or found already gone
    pub deleted: u32,
    /// Matched resources whose TTL has not elapsed
    pub pending: u32,
    /// Deletions that failed
    pub failed: u32,
    /// Deletions skipped because of dry run
    pub dry_run: u32,
    /// Matched but exempt: preserved, already terminating, or without a TTL
    pub skipped: u32,
    pub first_error: Option<String>,
    pub cancelled: bool,
}

impl EvaluationResult {
    fn record_failure(&mut self, message: String) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }
}

enum Disposition {
    Deleted,
    DryRun,
    Failed(String),
    Cancelled,
}

/// Shared pacing for the deletions of one pass
#[derive(Clone, Copy)]
struct Lane<'a> {
    limiter: &'a RateLimiter,
    window: &'a Semaphore,
    cancel: &'a CancellationToken,
    dry_run: bool,
}

pub struct Evaluator {
    client: Arc<dyn DynamicClient>,
    executor: BackoffExecutor,
    recorder: Arc<dyn EventRecorder>,
    clock: Arc<dyn Clock>,
    default_batch_size: u32,
    global_dry_run: bool,
}

impl Evaluator {
    pub fn new(
        client: Arc<dyn DynamicClient>,
        executor: BackoffExecutor,
        recorder: Arc<dyn EventRecorder>,
        clock: Arc<dyn Clock>,
        default_batch_size: u32,
        global_dry_run: bool,
    ) -> Self {
        Self {
            client,
            executor,
            recorder,
            clock,
            default_batch_size: default_batch_size.max(1),
            global_dry_run,
        }
    }

    /// Matching and TTL only; nothing is deleted.
    pub fn scan(
        &self,
        policy: &GarbageCollectionPolicy,
        target: &WatchTarget,
        cache: &dyn ResourceCache,
    ) -> EvaluationResult {
        self.partition(policy, target, cache).0
    }

    fn partition(
        &self,
        policy: &GarbageCollectionPolicy,
        target: &WatchTarget,
        cache: &dyn ResourceCache,
    ) -> (EvaluationResult, Vec<Arc<DynamicObject>>) {
        let now = self.clock.now();
        let mut result = EvaluationResult::default();
        let mut deletable = Vec::new();

        for resource in cache.list() {
            let doc = fieldpath::document(&resource);
            if !matcher::matches(&policy.spec, target.namespace(), &resource, &doc) {
                continue;
            }
            result.matched += 1;

            if is_preserved(&resource) || resource.metadata.deletion_timestamp.is_some() {
                result.skipped += 1;
                continue;
            }

            match ttl::check(&policy.spec.ttl, &resource, &doc, now) {
                Expiry::Expired(_) => {
                    result.expired += 1;
                    deletable.push(resource);
                }
                Expiry::Pending(_) => result.pending += 1,
                Expiry::NoTtl => result.skipped += 1,
            }
        }

        (result, deletable)
    }

    /// Runs one evaluation pass.
    #[instrument(skip_all, fields(policy = %policy.name_any(), watch = %target))]
    pub async fn evaluate(
        &self,
        policy: &GarbageCollectionPolicy,
        target: &WatchTarget,
        cache: &dyn ResourceCache,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
    ) -> EvaluationResult {
        if cancel.is_cancelled() {
            return EvaluationResult {
                cancelled: true,
                ..Default::default()
            };
        }

        let (mut result, deletable) = self.partition(policy, target, cache);
        let behavior = &policy.spec.behavior;
        let dry_run = behavior.dry_run || self.global_dry_run;
        let batch_size = behavior
            .batch_size
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .unwrap_or(self.default_batch_size as usize);

        let params = DeleteParams {
            propagation_policy: Some(behavior.propagation_policy.into()),
            grace_period_seconds: behavior.grace_period_seconds,
            ..Default::default()
        };
        let policy_ref = PolicyRef::from_policy(policy).ok();

        debug!(
            matched = result.matched,
            expired = deletable.len(),
            pending = result.pending,
            batch_size,
            dry_run,
            "Evaluating policy"
        );

        let window = Semaphore::new(batch_size);
        let mut settled: FuturesUnordered<_> = deletable
            .iter()
            .map(|resource| {
                let lane = Lane {
                    limiter,
                    window: &window,
                    cancel,
                    dry_run,
                };
                let params = &params;
                async move { (resource, self.delete_one(resource, target, params, lane).await) }
            })
            .collect();

        while let Some((resource, outcome)) = settled.next().await {
            match outcome {
                Disposition::Deleted => result.deleted += 1,
                Disposition::DryRun => result.dry_run += 1,
                Disposition::Cancelled => result.cancelled = true,
                Disposition::Failed(message) => {
                    if let Some(policy_ref) = &policy_ref {
                        let note = format!("Failed to delete {}: {message}", describe(resource));
                        if let Err(e) = self
                            .recorder
                            .record(policy_ref, EventKind::Warning, "DeletionFailed", &note)
                            .await
                        {
                            debug!(error = %e, "Failed to record event");
                        }
                    }
                    result.record_failure(message);
                }
            }
        }

        info!(
            matched = result.matched,
            deleted = result.deleted,
            pending = result.pending,
            failed = result.failed,
            dry_run = result.dry_run,
            cancelled = result.cancelled,
            "Evaluation pass finished"
        );
        result
    }

    async fn delete_one(
        &self,
        resource: &DynamicObject,
        target: &WatchTarget,
        params: &DeleteParams,
        lane: Lane<'_>,
    ) -> Disposition {
        let Lane {
            limiter,
            window,
            cancel,
            dry_run,
        } = lane;
        if cancel.is_cancelled() {
            return Disposition::Cancelled;
        }
        let what = describe(resource);
        if dry_run {
            info!(resource = %what, "Dry run: would delete");
            return Disposition::DryRun;
        }

        if limiter.acquire(cancel).await.is_err() {
            return Disposition::Cancelled;
        }

        // A same-named object recreated since the cache saw it must survive
        let mut params = params.clone();
        params.preconditions = resource.uid().map(|uid| Preconditions {
            uid: Some(uid),
            resource_version: None,
        });

        let client = self.client.as_ref();
        let namespace = resource.metadata.namespace.as_deref();
        let name = resource.name_any();
        let name = name.as_str();
        let params = &params;

        match self
            .executor
            .execute(cancel, move || async move {
                // Held for the call only, released across backoff sleeps
                let _slot = window.acquire().await.ok();
                client.delete(target, namespace, name, params).await
            })
            .await
        {
            Ok(DeleteOutcome::Deleted { attempts }) => {
                info!(resource = %what, attempts, "Deleted expired resource");
                Disposition::Deleted
            }
            Ok(DeleteOutcome::AlreadyGone { .. }) => {
                debug!(resource = %what, "Resource already gone");
                Disposition::Deleted
            }
            Err(DeleteError::Cancelled { .. }) => Disposition::Cancelled,
            Err(e) => {
                warn!(resource = %what, error = %e, "Failed to delete resource");
                Disposition::Failed(format!("{what}: {e}"))
            }
        }
    }
}

fn is_preserved(resource: &DynamicObject) -> bool {
    resource
        .annotations()
        .get(ANNOTATION_PRESERVE)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

fn describe(resource: &DynamicObject) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}
