//! Reconciliation scenarios driven through `Reconciler` with fake collaborators

mod common;

use chrono::Duration;
use common::{config_map, policy, t0, Harness};
use gc_controller::controller::PolicyState;
use gc_controller::crds::PolicyPhase;
use gc_controller::{ControllerConfig, GarbageCollectionPolicyStatus};
use serde_json::json;

const ONE_HOUR_TTL: &str = r"
targetResource: {apiVersion: v1, kind: ConfigMap, namespace: ns-a}
ttl: {secondsAfterCreation: 3600}
";

#[tokio::test]
async fn active_policy_deletes_only_expired_resources() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let cache = harness.provider.cache("ns-a");
    cache.insert(config_map("ns-a", "old-1", t0(), json!({})));
    cache.insert(config_map("ns-a", "old-2", t0(), json!({})));
    cache.insert(config_map("ns-a", "fresh", t0() + Duration::minutes(90), json!({})));

    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();

    assert_eq!(outcome.state, PolicyState::Active);
    let result = outcome.result.unwrap();
    assert_eq!(result.matched, 3);
    assert_eq!(result.deleted, 2);
    assert_eq!(result.pending, 1);

    let mut deleted = harness.client.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["old-1", "old-2"]);

    let status = harness.status.last();
    assert_eq!(status.phase, Some(PolicyPhase::Active));
    assert_eq!(status.resources_deleted, 2);
    assert_eq!(status.resources_pending, 1);
    assert_eq!(status.total_deleted, 2);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.next_run_time.is_some());

    let reasons = harness.events.reasons();
    assert!(reasons.contains(&"PhaseChanged".to_string()));
    assert!(reasons.contains(&"ResourceDeleted".to_string()));
    assert_eq!(outcome.requeue_after, ControllerConfig::default().gc_interval());
}

#[tokio::test]
async fn namespace_change_replaces_the_watch() {
    let harness = Harness::new(t0() + Duration::hours(2));
    harness.provider.cache("ns-a").insert(config_map("ns-a", "in-a", t0(), json!({})));
    harness.provider.cache("ns-b").insert(config_map("ns-b", "in-b", t0(), json!({})));

    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(harness.client.deleted(), vec!["in-a"]);

    gcp.spec.target_resource.namespace = Some("ns-b".to_string());
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Active);

    let opened = harness.provider.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[0].0.namespace(), Some("ns-a"));
    assert!(opened[0].1.is_cancelled(), "old watch must be stopped");
    assert_eq!(opened[1].0.namespace(), Some("ns-b"));
    assert!(!opened[1].1.is_cancelled());

    assert_eq!(harness.client.deleted(), vec!["in-a", "in-b"]);
    assert_eq!(
        harness.registry.target("uid-1").await.unwrap().namespace(),
        Some("ns-b")
    );
}

#[tokio::test]
async fn unchanged_policy_reuses_its_watch() {
    let harness = Harness::new(t0());
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);

    harness.reconciler.apply(&gcp).await.unwrap();
    harness.clock.advance(Duration::minutes(5));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert!(outcome.result.is_some());

    assert_eq!(harness.provider.opened().len(), 1);
    assert_eq!(harness.registry.len(), 1);
    // One transition into Active, none for the second pass
    let transitions = harness
        .events
        .reasons()
        .into_iter()
        .filter(|r| r == "PhaseChanged")
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn paused_policy_keeps_watch_and_deletes_nothing() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();

    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    gcp.spec.paused = true;
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();

    assert_eq!(outcome.state, PolicyState::Paused);
    let result = outcome.result.unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.expired, 1);
    assert_eq!(result.deleted, 0);
    assert!(harness.client.deleted().is_empty());

    let opened = harness.provider.opened();
    assert_eq!(opened.len(), 1);
    assert!(!opened[0].1.is_cancelled(), "paused policies keep their watch");
    assert_eq!(harness.registry.state("uid-1").await, PolicyState::Paused);
    assert_eq!(harness.status.last().phase, Some(PolicyPhase::Paused));

    gcp.spec.paused = false;
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Active);
    assert_eq!(harness.client.deleted(), vec!["old"]);
    assert_eq!(harness.provider.opened().len(), 1);
}

#[tokio::test]
async fn paused_policy_follows_a_target_change() {
    let harness = Harness::new(t0() + Duration::hours(2));
    harness.provider.cache("ns-a").insert(config_map("ns-a", "in-a", t0(), json!({})));
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();

    harness.provider.cache("ns-a").insert(config_map("ns-a", "late-a", t0(), json!({})));
    harness.provider.cache("ns-b").insert(config_map("ns-b", "in-b-1", t0(), json!({})));
    harness.provider.cache("ns-b").insert(config_map("ns-b", "in-b-2", t0(), json!({})));
    gcp.spec.paused = true;
    gcp.spec.target_resource.namespace = Some("ns-b".to_string());
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();

    assert_eq!(outcome.state, PolicyState::Paused);
    assert_eq!(outcome.result.unwrap().matched, 2);
    let opened = harness.provider.opened();
    assert_eq!(opened.len(), 2);
    assert!(opened[0].1.is_cancelled(), "stale ns-a watch must be stopped");
    assert_eq!(
        harness.registry.target("uid-1").await.unwrap().namespace(),
        Some("ns-b")
    );
    assert_eq!(harness.status.last().resources_matched, 2);
    assert_eq!(harness.client.deleted(), vec!["in-a"]);
}

#[tokio::test]
async fn passes_are_paced_by_the_gc_interval() {
    let harness = Harness::new(t0() + Duration::hours(2));
    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    let interval = ControllerConfig::default().gc_interval();

    harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(harness.status.count(), 1);

    // The status write comes back as a watch event with an unchanged spec
    gcp.status = Some(harness.status.last());
    harness.clock.advance(Duration::seconds(10));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Active);
    assert!(outcome.result.is_none());
    assert_eq!(outcome.requeue_after, interval - std::time::Duration::from_secs(10));
    assert_eq!(harness.status.count(), 1, "skipped pass must not write status");

    harness.clock.advance(Duration::seconds(50));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert!(outcome.result.is_some());
    assert_eq!(outcome.requeue_after, interval);
    assert_eq!(harness.status.count(), 2);
}

#[tokio::test]
async fn spec_change_runs_before_the_interval() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();

    gcp.spec.behavior.dry_run = true;
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert!(outcome.result.is_some());
    assert_eq!(harness.status.count(), 2);
}

#[tokio::test]
async fn error_phase_is_retried_on_the_interval() {
    let harness = Harness::new(t0());
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.provider.set_failing(true);

    harness.reconciler.apply(&gcp).await.unwrap();
    harness.clock.advance(Duration::seconds(1));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Error);
    assert!(outcome.requeue_after < ControllerConfig::default().gc_interval());
    assert_eq!(harness.status.count(), 1);
    assert_eq!(harness.provider.open_attempts(), 1);
}

#[tokio::test]
async fn paused_policy_without_watch_reports_zeros() {
    let harness = Harness::new(t0());
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    gcp.spec.paused = true;

    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Paused);
    assert_eq!(outcome.result.unwrap().matched, 0);
    assert!(harness.provider.opened().is_empty());
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let harness = Harness::new(t0());
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();

    assert!(harness.reconciler.teardown("uid-1").await);
    assert!(!harness.reconciler.teardown("uid-1").await);
    // A recreated policy with the same UID starts a fresh pass
    assert!(harness.reconciler.apply(&gcp).await.unwrap().result.is_some());
    assert!(harness.reconciler.teardown("uid-1").await);
    assert!(harness.registry.is_empty());
    assert_eq!(harness.registry.state("uid-1").await, PolicyState::NotTracked);
    assert!(harness.provider.opened()[0].1.is_cancelled());
}

#[tokio::test]
async fn watch_failure_sets_error_phase_and_recovers() {
    let harness = Harness::new(t0());
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);

    harness.provider.set_failing(true);
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Error);
    assert_eq!(outcome.requeue_after, ControllerConfig::default().gc_interval());
    assert_eq!(harness.status.last().phase, Some(PolicyPhase::Error));
    assert!(harness.events.warnings().contains(&"WatchFailed".to_string()));
    assert_eq!(harness.registry.state("uid-1").await, PolicyState::Error);

    harness.provider.set_failing(false);
    harness.clock.advance(Duration::minutes(5));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Active);
    assert_eq!(harness.status.last().phase, Some(PolicyPhase::Active));
}

#[tokio::test]
async fn malformed_target_is_an_error_phase() {
    let harness = Harness::new(t0());
    let gcp = policy(
        "ns-a",
        "broken",
        "uid-9",
        r"
targetResource: {apiVersion: '', kind: ConfigMap}
ttl: {secondsAfterCreation: 60}
",
    );

    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(outcome.state, PolicyState::Error);
    assert!(harness.provider.opened().is_empty());
    let warnings = harness.events.warnings();
    assert!(warnings.contains(&"InvalidPolicy".to_string()));
    assert!(warnings.contains(&"WatchFailed".to_string()));
}

#[tokio::test]
async fn follower_drops_local_state() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(harness.registry.len(), 1);

    harness.leader.set(false);
    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    let outcome = harness.reconciler.apply(&gcp).await.unwrap();

    assert_eq!(outcome.state, PolicyState::NotTracked);
    assert!(outcome.result.is_none());
    assert_eq!(outcome.requeue_after, harness.reconciler.follower_requeue());
    assert!(outcome.requeue_after < ControllerConfig::default().gc_interval());
    assert!(harness.registry.is_empty());
    assert!(harness.client.deleted().is_empty());
    assert!(harness.provider.opened()[0].1.is_cancelled());
}

#[tokio::test]
async fn dry_run_counts_without_deleting() {
    let harness = Harness::new(t0() + Duration::hours(2));
    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    let gcp = policy(
        "ns-a",
        "stale",
        "uid-1",
        r"
targetResource: {apiVersion: v1, kind: ConfigMap, namespace: ns-a}
ttl: {secondsAfterCreation: 3600}
behavior: {dryRun: true}
",
    );

    let result = harness.reconciler.apply(&gcp).await.unwrap().result.unwrap();
    assert_eq!(result.dry_run, 1);
    assert_eq!(result.deleted, 0);
    assert!(harness.client.calls().is_empty());
    assert!(harness.events.reasons().contains(&"DryRun".to_string()));
}

#[tokio::test]
async fn global_dry_run_overrides_policies() {
    let config = ControllerConfig {
        dry_run: true,
        ..ControllerConfig::default()
    };
    let harness = Harness::with_config(t0() + Duration::hours(2), config);
    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);

    let result = harness.reconciler.apply(&gcp).await.unwrap().result.unwrap();
    assert_eq!(result.dry_run, 1);
    assert!(harness.client.calls().is_empty());
}

#[tokio::test]
async fn failed_deletion_is_reported_without_stopping_others() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let cache = harness.provider.cache("ns-a");
    for name in ["a", "b", "c"] {
        cache.insert(config_map("ns-a", name, t0(), json!({})));
    }
    harness.client.fail_always("b", 403);
    let gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);

    let outcome = harness.reconciler.apply(&gcp).await.unwrap();
    let result = outcome.result.unwrap();
    assert_eq!(outcome.state, PolicyState::Active);
    assert_eq!(result.deleted, 2);
    assert_eq!(result.failed, 1);
    assert!(result.first_error.as_deref().unwrap().contains("ns-a/b"));

    let status = harness.status.last();
    assert!(status.message.unwrap().contains("1 deletion(s) failed"));
    assert!(harness.events.warnings().contains(&"DeletionFailed".to_string()));
}

#[tokio::test]
async fn total_deleted_accumulates_across_passes() {
    let harness = Harness::new(t0() + Duration::hours(2));
    harness.provider.cache("ns-a").insert(config_map("ns-a", "old", t0(), json!({})));
    let mut gcp = policy("ns-a", "stale", "uid-1", ONE_HOUR_TTL);
    gcp.status = Some(GarbageCollectionPolicyStatus {
        total_deleted: 5,
        observed_generation: Some(1),
        ..Default::default()
    });

    harness.reconciler.apply(&gcp).await.unwrap();
    assert_eq!(harness.status.last().total_deleted, 6);
}

#[tokio::test]
async fn selectors_and_conditions_narrow_the_match() {
    let harness = Harness::new(t0() + Duration::hours(2));
    let cache = harness.provider.cache("ns-a");
    cache.insert(config_map("ns-a", "web-tmp", t0(), json!({"app": "web", "tier": "tmp"})));
    cache.insert(config_map("ns-a", "web-keep", t0(), json!({"app": "web", "tier": "core"})));
    cache.insert(config_map("ns-a", "api-tmp", t0(), json!({"app": "api", "tier": "tmp"})));
    let gcp = policy(
        "ns-a",
        "web-tmp",
        "uid-2",
        r"
targetResource:
  apiVersion: v1
  kind: ConfigMap
  namespace: ns-a
  labelSelector:
    matchLabels: {app: web}
ttl: {secondsAfterCreation: 3600}
conditions:
  labels:
    - {key: tier, operator: In, values: [tmp, scratch]}
",
    );

    let result = harness.reconciler.apply(&gcp).await.unwrap().result.unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(harness.client.deleted(), vec!["web-tmp"]);
}
