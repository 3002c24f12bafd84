use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rekon_core::{
    ActionKind, AttributeDiff, EngineError, LockError, LockManager, LockToken, MemoryBackend, MemoryProvider, NoRisk,
    Outcome, Reconciler, Reference, ResourceGraph, ResourceId, ResourceSpec, RetryPolicy, RiskPolicy, RunOptions,
    SkipReason, StateKey, StateSnapshot, StateStore, StoreError, Value, VersionId,
};
use serde_json::json;
use tokio::sync::watch;

fn id(s: &str) -> ResourceId { s.parse().unwrap() }

fn reference(s: &str) -> Value { Value::Ref(s.parse::<Reference>().unwrap()) }

fn key() -> StateKey { StateKey::from("security-lab") }

fn fast_retry() -> RetryPolicy {
    RetryPolicy { attempts: 4, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) }
}

fn reconciler(backend: &Arc<MemoryBackend>, provider: &Arc<MemoryProvider>) -> Reconciler {
    Reconciler::new(backend.clone(), backend.clone(), provider.clone(), Arc::new(NoRisk)).with_retry(fast_retry())
}

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

fn chain() -> ResourceGraph {
    ResourceGraph::build(vec![
        ResourceSpec::new(id("a.key")).attr("alias", "lab"),
        ResourceSpec::new(id("b.bucket")).attr("kms", reference("a.key.arn")),
        ResourceSpec::new(id("c.policy")).attr("bucket_arn", reference("b.bucket.arn")),
    ])
    .unwrap()
}

#[tokio::test]
async fn single_bucket_converges() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let graph = ResourceGraph::build(vec![ResourceSpec::new(id("aws_s3_bucket.logs")).attr("bucket", "lab-logs")]).unwrap();
    let opts = RunOptions::default();

    let plan = rec.plan(&key(), &graph, &opts).await.unwrap();
    assert_eq!(plan.kinds(), vec![("aws_s3_bucket.logs".to_string(), ActionKind::Create)]);

    let out = rec.apply(&key(), &graph, &opts, no_cancel()).await.unwrap();
    assert!(out.report.is_success());
    assert_eq!(out.saved, Some(VersionId(1)));

    let snap = backend.load(&key()).await.unwrap();
    let bucket = snap.get(&id("aws_s3_bucket.logs")).unwrap();
    assert!(bucket.computed["arn"].as_str().unwrap().starts_with("arn:mem:aws_s3_bucket:"));

    let again = rec.plan(&key(), &graph, &opts).await.unwrap();
    assert!(!again.has_changes());
    assert_eq!(backend.current(&key()).await.unwrap(), None);
}

#[tokio::test]
async fn second_apply_is_a_no_op() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let graph = chain();
    let opts = RunOptions::default();

    rec.apply(&key(), &graph, &opts, no_cancel()).await.unwrap();
    let calls = provider.calls().len();
    assert_eq!(calls, 3);

    let second = rec.apply(&key(), &graph, &opts, no_cancel()).await.unwrap();
    assert!(second.plan.actions.iter().all(|a| a.kind == ActionKind::NoOp));
    assert!(second.report.actions.iter().all(|a| a.outcome == Outcome::NoOp));
    assert_eq!(second.saved, None);
    assert_eq!(provider.calls().len(), calls);
    assert_eq!(backend.list_versions(&key()).await.unwrap(), vec![VersionId(1)]);
}

#[tokio::test]
async fn failure_skips_dependents_and_keeps_successes() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    provider.fail_type("b");
    let rec = reconciler(&backend, &provider);
    let graph = chain();

    let out = rec.apply(&key(), &graph, &RunOptions::default(), no_cancel()).await.unwrap();
    assert_eq!(out.report.outcome_of("a.key"), Some(&Outcome::Applied));
    assert!(matches!(out.report.outcome_of("b.bucket"), Some(Outcome::Failed { .. })));
    assert_eq!(out.report.outcome_of("c.policy"), Some(&Outcome::Skipped(SkipReason::BlockedBy(id("b.bucket")))));
    assert_eq!(out.report.worst().severity(), 3);

    let snap = backend.load(&key()).await.unwrap();
    assert!(snap.get(&id("a.key")).is_some());
    assert!(snap.get(&id("b.bucket")).is_none());
    assert!(snap.get(&id("c.policy")).is_none());

    provider.heal_type("b");
    let retry = rec.apply(&key(), &graph, &RunOptions::default(), no_cancel()).await.unwrap();
    assert_eq!(
        retry.plan.kinds(),
        vec![
            ("a.key".to_string(), ActionKind::NoOp),
            ("b.bucket".to_string(), ActionKind::Create),
            ("c.policy".to_string(), ActionKind::Create),
        ]
    );
    assert!(retry.report.is_success());
}

#[tokio::test]
async fn independent_branch_survives_a_failure() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    provider.fail_type("broken");
    let rec = reconciler(&backend, &provider);
    let graph = ResourceGraph::build(vec![
        ResourceSpec::new(id("broken.x")),
        ResourceSpec::new(id("role.r")),
        ResourceSpec::new(id("policy.p")).attr("role", reference("role.r.arn")),
    ])
    .unwrap();

    let out = rec.apply(&key(), &graph, &RunOptions::default(), no_cancel()).await.unwrap();
    assert_eq!(out.report.outcome_of("role.r"), Some(&Outcome::Applied));
    assert_eq!(out.report.outcome_of("policy.p"), Some(&Outcome::Applied));
    assert!(!out.report.is_success());
}

#[tokio::test]
async fn immutable_change_replaces_before_dependents_update() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let v1 = ResourceGraph::build(vec![
        ResourceSpec::new(id("bucket.logs")).attr("bucket", "lab-logs-1").immutable("bucket"),
        ResourceSpec::new(id("policy.read")).attr("bucket_arn", reference("bucket.logs.arn")),
    ])
    .unwrap();
    rec.apply(&key(), &v1, &RunOptions::default(), no_cancel()).await.unwrap();
    let old_arn = backend.load(&key()).await.unwrap().get(&id("bucket.logs")).unwrap().computed["arn"].clone();

    let v2 = ResourceGraph::build(vec![
        ResourceSpec::new(id("bucket.logs")).attr("bucket", "lab-logs-2").immutable("bucket"),
        ResourceSpec::new(id("policy.read")).attr("bucket_arn", reference("bucket.logs.arn")),
    ])
    .unwrap();
    let plan = rec.plan(&key(), &v2, &RunOptions::default()).await.unwrap();
    assert_eq!(
        plan.kinds(),
        vec![
            ("bucket.logs".to_string(), ActionKind::Delete),
            ("bucket.logs".to_string(), ActionKind::Create),
            ("policy.read".to_string(), ActionKind::Update),
        ]
    );
    assert_eq!(plan.actions[2].after, vec![1]);

    let out = rec.apply(&key(), &v2, &RunOptions::default(), no_cancel()).await.unwrap();
    assert!(out.report.is_success());
    let snap = backend.load(&key()).await.unwrap();
    let new_arn = snap.get(&id("bucket.logs")).unwrap().computed["arn"].clone();
    assert_ne!(new_arn, old_arn);
    assert_eq!(snap.get(&id("policy.read")).unwrap().attributes["bucket_arn"], new_arn);
    assert_eq!(snap.get(&id("bucket.logs")).unwrap().attributes["bucket"], json!("lab-logs-2"));
}

#[tokio::test]
async fn removed_resources_are_deleted_dependents_first() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    rec.apply(&key(), &chain(), &RunOptions::default(), no_cancel()).await.unwrap();

    let only_key = ResourceGraph::build(vec![ResourceSpec::new(id("a.key")).attr("alias", "lab")]).unwrap();
    let out = rec.apply(&key(), &only_key, &RunOptions::default(), no_cancel()).await.unwrap();
    assert_eq!(
        out.plan.kinds(),
        vec![
            ("c.policy".to_string(), ActionKind::Delete),
            ("b.bucket".to_string(), ActionKind::Delete),
            ("a.key".to_string(), ActionKind::NoOp),
        ]
    );
    let calls = provider.calls();
    assert_eq!(&calls[calls.len() - 2..], &["delete c".to_string(), "delete b".to_string()]);
    assert_eq!(provider.live_count(), 1);
}

#[tokio::test]
async fn actions_start_after_their_dependencies() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    provider.delay_type("base", Duration::from_millis(20));
    let rec = reconciler(&backend, &provider);
    let graph = ResourceGraph::build(vec![
        ResourceSpec::new(id("top.t")).attr("l", reference("left.l.arn")).attr("r", reference("right.r.arn")),
        ResourceSpec::new(id("left.l")).attr("b", reference("base.b.arn")),
        ResourceSpec::new(id("right.r")).depends_on(id("base.b")),
        ResourceSpec::new(id("base.b")),
        ResourceSpec::new(id("loner.x")),
    ])
    .unwrap();
    let mut opts = RunOptions::default();
    opts.execute.parallelism = 4;
    rec.apply(&key(), &graph, &opts, no_cancel()).await.unwrap();

    let calls = provider.calls();
    let pos = |t: &str| calls.iter().position(|c| c == &format!("create {t}")).unwrap();
    assert!(pos("base") < pos("left"));
    assert!(pos("base") < pos("right"));
    assert!(pos("left") < pos("top"));
    assert!(pos("right") < pos("top"));
}

#[tokio::test]
async fn held_lock_blocks_apply_without_side_effects() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let stale = backend.acquire(&key(), "crashed-ci", "apply").await.unwrap();

    let err = rec.apply(&key(), &chain(), &RunOptions::default(), no_cancel()).await.unwrap_err();
    assert!(matches!(err, EngineError::Lock(LockError::AlreadyLocked { ref holder, .. }) if holder == "crashed-ci"));
    assert!(provider.calls().is_empty());

    let err = rec.force_unlock(&key(), "not-the-id").await.unwrap_err();
    assert!(matches!(err, EngineError::LockIdMismatch { .. }));
    let removed = rec.force_unlock(&key(), &stale.id).await.unwrap();
    assert_eq!(removed.holder, "crashed-ci");

    rec.apply(&key(), &chain(), &RunOptions::default(), no_cancel()).await.unwrap();
}

struct EverythingRisky;

impl RiskPolicy for EverythingRisky {
    fn replacement_risk(&self, spec: &ResourceSpec, _diffs: &[AttributeDiff]) -> Option<String> {
        Some(format!("{} has a globally unique name", spec.id))
    }
}

#[tokio::test]
async fn high_risk_replacement_needs_consent() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = Reconciler::new(backend.clone(), backend.clone(), provider.clone(), Arc::new(EverythingRisky));
    let v1 = ResourceGraph::build(vec![ResourceSpec::new(id("bucket.b")).attr("bucket", "one").immutable("bucket")]).unwrap();
    let v2 = ResourceGraph::build(vec![ResourceSpec::new(id("bucket.b")).attr("bucket", "two").immutable("bucket")]).unwrap();
    rec.apply(&key(), &v1, &RunOptions::default(), no_cancel()).await.unwrap();
    let calls = provider.calls().len();

    let err = rec.apply(&key(), &v2, &RunOptions::default(), no_cancel()).await.unwrap_err();
    assert!(matches!(err, EngineError::HighRisk(ref ids) if ids == &vec!["bucket.b".to_string()]));
    assert_eq!(provider.calls().len(), calls);
    assert_eq!(backend.current(&key()).await.unwrap(), None);

    let opts = RunOptions { allow_high_risk: true, ..RunOptions::default() };
    let out = rec.apply(&key(), &v2, &opts, no_cancel()).await.unwrap();
    assert!(out.report.is_success());
}

#[tokio::test]
async fn transient_store_outage_is_retried() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    backend.fail_next(2);
    let out = rec.apply(&key(), &chain(), &RunOptions::default(), no_cancel()).await.unwrap();
    assert_eq!(out.saved, Some(VersionId(1)));
}

/// Store whose writes always lose the race to another writer.
struct RacingStore(Arc<MemoryBackend>);

#[async_trait]
impl StateStore for RacingStore {
    async fn load(&self, key: &StateKey) -> Result<StateSnapshot, StoreError> { self.0.load(key).await }

    async fn load_version(&self, key: &StateKey, version: VersionId) -> Result<StateSnapshot, StoreError> {
        self.0.load_version(key, version).await
    }

    async fn save(&self, key: &StateKey, _t: &LockToken, _e: Option<VersionId>, _s: &StateSnapshot) -> Result<VersionId, StoreError> {
        Err(StoreError::VersionConflict { key: key.clone(), expected: "<none>".into(), found: "v7".into() })
    }

    async fn list_versions(&self, key: &StateKey) -> Result<Vec<VersionId>, StoreError> { self.0.list_versions(key).await }
}

#[tokio::test]
async fn version_conflict_asks_for_a_replan_and_unlocks() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = Reconciler::new(Arc::new(RacingStore(backend.clone())), backend.clone(), provider, Arc::new(NoRisk));
    let err = rec.apply(&key(), &chain(), &RunOptions::default(), no_cancel()).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::VersionConflict { .. })));
    assert!(err.to_string().contains("re-run plan"));
    assert_eq!(backend.current(&key()).await.unwrap(), None);
}

#[tokio::test]
async fn refresh_recreates_resources_deleted_out_of_band() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let graph = ResourceGraph::build(vec![ResourceSpec::new(id("role.r")).attr("name", "reader")]).unwrap();
    rec.apply(&key(), &graph, &RunOptions::default(), no_cancel()).await.unwrap();
    let pid = backend.load(&key()).await.unwrap().get(&id("role.r")).unwrap().provider_id.clone();
    provider.forget(&pid);

    let stale = rec.plan(&key(), &graph, &RunOptions::default()).await.unwrap();
    assert!(!stale.has_changes());
    let opts = RunOptions { refresh: true, ..RunOptions::default() };
    let fresh = rec.plan(&key(), &graph, &opts).await.unwrap();
    assert_eq!(fresh.kinds(), vec![("role.r".to_string(), ActionKind::Create)]);
}

#[tokio::test]
async fn replace_reaches_dependents_of_dependents_in_one_apply() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let graph = |name: &str| {
        ResourceGraph::build(vec![
            ResourceSpec::new(id("bucket.b")).attr("bucket", name).immutable("bucket"),
            ResourceSpec::new(id("policy.p")).attr("target", reference("bucket.b.arn")),
            ResourceSpec::new(id("attach.c")).attr("copy", reference("policy.p.target")),
        ])
        .unwrap()
    };
    rec.apply(&key(), &graph("one"), &RunOptions::default(), no_cancel()).await.unwrap();

    let out = rec.apply(&key(), &graph("two"), &RunOptions::default(), no_cancel()).await.unwrap();
    assert!(out.report.is_success());
    assert_eq!(
        out.plan.kinds(),
        vec![
            ("bucket.b".to_string(), ActionKind::Delete),
            ("bucket.b".to_string(), ActionKind::Create),
            ("policy.p".to_string(), ActionKind::Update),
            ("attach.c".to_string(), ActionKind::Update),
        ]
    );
    let snap = backend.load(&key()).await.unwrap();
    let arn = snap.get(&id("bucket.b")).unwrap().computed["arn"].clone();
    assert_eq!(snap.get(&id("policy.p")).unwrap().attributes["target"], arn);
    assert_eq!(snap.get(&id("attach.c")).unwrap().attributes["copy"], arn);

    let replan = rec.plan(&key(), &graph("two"), &RunOptions::default()).await.unwrap();
    assert!(!replan.has_changes(), "{replan}");
}

#[tokio::test]
async fn refresh_findings_are_saved_without_actions() {
    let backend = Arc::new(MemoryBackend::new());
    let provider = Arc::new(MemoryProvider::new());
    let rec = reconciler(&backend, &provider);
    let graph = ResourceGraph::build(vec![ResourceSpec::new(id("role.r")).attr("name", "reader")]).unwrap();
    rec.apply(&key(), &graph, &RunOptions::default(), no_cancel()).await.unwrap();
    let pid = backend.load(&key()).await.unwrap().get(&id("role.r")).unwrap().provider_id.clone();
    provider.forget(&pid);

    let empty = ResourceGraph::build(vec![]).unwrap();
    let opts = RunOptions { refresh: true, ..RunOptions::default() };
    let out = rec.apply(&key(), &empty, &opts, no_cancel()).await.unwrap();
    assert!(out.plan.kinds().is_empty());
    assert_eq!(out.saved, Some(VersionId(2)));
    assert!(backend.load(&key()).await.unwrap().is_empty());

    let replan = rec.plan(&key(), &empty, &RunOptions::default()).await.unwrap();
    assert!(!replan.has_changes());
}
