//! End-to-end reconciliation against the in-memory provisioner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keel_core::manifest::parse_manifests;
use keel_core::{
    BackoffConfig, ClaimPhase, EngineConfig, ErrorClass, ManifestSet, ObservedStatus,
    ReconcilableUnit, ResourceStore, SyncStatus, UnitId, UnitPhase,
};
use keel_sync::{CallKind, DriftDetector, DriftKind, MemoryProvisioner, ProvisionerRegistry, Scheduler};
use serde_json::json;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const PLATFORM: &str = r#"
kind: ResourceDefinition
metadata:
  name: databases
spec:
  claimKind: Database
  compositeKind: XDatabase
  schema:
    type: object
    required: [size]
    properties:
      size:
        type: string
      region:
        type: string
        default: eu-west-1
---
kind: Composition
metadata:
  name: db-standard
spec:
  definition: databases
  resources:
    - name: network
      base:
        kind: Network
        spec: {}
      patches:
        - type: fromClaimFieldPath
          from: spec.region
          to: spec.region
    - name: instance
      dependsOn: [network]
      base:
        kind: Instance
        spec: {}
      patches:
        - type: fromClaimFieldPath
          from: spec.size
          to: spec.size
"#;

const NETWORK: &str = "shop-orders-network";
const INSTANCE: &str = "shop-orders-instance";

fn claim(extra_spec: &str) -> String {
    format!(
        "kind: Claim\nmetadata: {{name: orders, namespace: shop}}\nspec:\n  claimKind: Database\n  parameters: {{size: small}}\n{extra_spec}"
    )
}

fn app(name: &str, extra_spec: &str) -> String {
    format!(
        "kind: Application\nmetadata: {{name: {name}}}\nspec:\n  resource: {{kind: ConfigMap, data: {{owner: {name}}}}}\n{extra_spec}"
    )
}

fn manifests(docs: &[&str]) -> ManifestSet {
    let mut set = ManifestSet::default();
    for doc in docs {
        for manifest in parse_manifests(doc, Path::new("test.yaml")).expect("parse") {
            set.insert(manifest).expect("insert");
        }
    }
    set
}

fn config() -> EngineConfig {
    EngineConfig {
        apply_timeout_ms: 1_000,
        watchdog_grace_ms: 500,
        resync_interval_ms: 100,
        max_concurrency: 4,
        delete_max_attempts: 2,
        backoff: BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            max_attempts: 3,
            jitter: 0.0,
        },
        ..EngineConfig::default()
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    live: Arc<MemoryProvisioner>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let live = Arc::new(MemoryProvisioner::new());
        let registry = ProvisionerRegistry::with_default(live.clone());
        let scheduler = Arc::new(Scheduler::new(ResourceStore::new(), registry, config));
        Self { scheduler, live }
    }

    async fn with(docs: &[&str]) -> Self {
        let h = Self::new(config());
        h.scheduler
            .ingest(&manifests(docs), "test", None)
            .await
            .expect("ingest");
        h
    }

    async fn unit(&self, id: &str) -> ReconcilableUnit {
        let store = self.scheduler.store();
        let store = store.lock().await;
        store
            .get(&UnitId::from(id))
            .map(|e| e.unit.clone())
            .unwrap_or_else(|| panic!("{id} not in store"))
    }

    async fn tombstone(&self, id: &str) -> Option<ReconcilableUnit> {
        let store = self.scheduler.store();
        let store = store.lock().await;
        store.tombstone(&UnitId::from(id)).cloned()
    }

    async fn contains(&self, id: &str) -> bool {
        self.scheduler.store().lock().await.contains(&UnitId::from(id))
    }
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_converges_and_stays_idempotent() {
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim]).await;

    h.scheduler.run_until_settled(10).await.expect("settle");

    let c = h.unit("claim/shop/orders").await;
    assert_eq!(c.claim_phase, Some(ClaimPhase::Ready));
    assert_eq!(c.sync_status, SyncStatus::Synced);
    assert!(h.unit("xr/shop-orders").await.ready);
    assert_eq!(
        h.live.get(NETWORK),
        Some(json!({"kind": "Network", "spec": {"region": "eu-west-1"}}))
    );

    // Same source, more passes: nothing is written again.
    h.scheduler
        .ingest(&manifests(&[PLATFORM, &claim]), "test", None)
        .await
        .expect("re-ingest");
    let report = h.scheduler.run_until_settled(10).await.expect("settle again");
    assert!(report.applied.is_empty());
    assert_eq!(h.live.apply_count(NETWORK), 1);
    assert_eq!(h.live.apply_count(INSTANCE), 1);
}

#[tokio::test]
async fn dependencies_are_applied_first() {
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");

    let network = h.live.first_call(CallKind::Apply, NETWORK).expect("network applied");
    let instance = h.live.first_call(CallKind::Apply, INSTANCE).expect("instance applied");
    assert!(network < instance);
    assert_eq!(h.unit("mr/shop-orders/instance").await.wave.effective(), 3);
}

#[tokio::test(start_paused = true)]
async fn dependent_waits_until_its_dependency_is_ready() {
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.live.set_ready(NETWORK, false);

    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.apply_count(NETWORK), 1);
    assert_eq!(h.live.apply_count(INSTANCE), 0);
    let instance = h.unit("mr/shop-orders/instance").await;
    assert_eq!(instance.phase, UnitPhase::Pending);
    assert!(instance.message.contains("waiting for mr/shop-orders/network"));
    assert_ne!(h.unit("claim/shop/orders").await.sync_status, SyncStatus::Synced);

    h.live.set_ready(NETWORK, true);
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.apply_count(INSTANCE), 1);
    assert_eq!(h.unit("mr/shop-orders/instance").await.phase, UnitPhase::Healthy);
    assert_eq!(h.unit("claim/shop/orders").await.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn cycle_members_are_never_scheduled() {
    let a = app("a", "  dependsOn: [app/b]\n");
    let b = app("b", "  dependsOn: [app/a]\n");
    let c = app("c", "");
    let h = Harness::with(&[&a, &b, &c]).await;

    let report = h.scheduler.run_until_settled(5).await.expect("settle");

    assert_eq!(report.cycle_errors.len(), 1);
    assert_eq!(h.live.apply_count("a"), 0);
    assert_eq!(h.live.apply_count("b"), 0);
    assert_eq!(h.unit("app/a").await.phase, UnitPhase::Error);
    assert!(h.unit("app/b").await.message.contains("dependency cycle"));
    assert_eq!(h.live.apply_count("c"), 1);
    assert_eq!(h.unit("app/c").await.phase, UnitPhase::Healthy);
}

#[tokio::test]
async fn patch_ordering_error_writes_nothing() {
    let broken = r#"
kind: Composition
metadata:
  name: db-standard
spec:
  definition: databases
  resources:
    - name: network
      base: {kind: Network}
      patches:
        - type: fromCompositeFieldPath
          resource: instance
          from: spec.size
          to: spec.size
    - name: instance
      base: {kind: Instance, spec: {size: small}}
"#;
    let definition = PLATFORM.split("---").next().expect("definition doc");
    let claim = claim("");
    let h = Harness::new(config());
    let report = h
        .scheduler
        .ingest(&manifests(&[definition, broken, &claim]), "test", None)
        .await
        .expect("ingest");
    assert_eq!(report.worst_class(), Some(ErrorClass::Template));

    h.scheduler.run_until_settled(5).await.expect("settle");

    assert!(h.live.calls().is_empty());
    assert!(!h.contains("xr/shop-orders").await);
    let c = h.unit("claim/shop/orders").await;
    assert_eq!(c.phase, UnitPhase::Error);
    assert_eq!(c.fatal.map(|f| f.class), Some(ErrorClass::Template));
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphan_policy_leaves_live_objects() {
    let claim = claim("  deletionPolicy: Orphan\n");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");

    let ids = h
        .scheduler
        .request_delete(&UnitId::from("claim/shop/orders"), false)
        .await
        .expect("delete");
    assert_eq!(ids.len(), 4);
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert!(h.live.contains(NETWORK));
    assert!(h.live.contains(INSTANCE));
    assert_eq!(h.live.delete_count(NETWORK), 0);
    let gone = h.tombstone("claim/shop/orders").await.expect("tombstone");
    assert_eq!(gone.phase, UnitPhase::Deleted);
    assert_eq!(gone.claim_phase, Some(ClaimPhase::Deleted));
    assert!(!h.contains("mr/shop-orders/network").await);
}

#[tokio::test]
async fn delete_removes_dependents_before_dependencies() {
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");

    h.scheduler
        .request_delete(&UnitId::from("claim/shop/orders"), false)
        .await
        .expect("delete");
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert!(h.live.names().is_empty());
    let instance = h.live.first_call(CallKind::Delete, INSTANCE).expect("instance deleted");
    let network = h.live.first_call(CallKind::Delete, NETWORK).expect("network deleted");
    assert!(instance < network);
}

#[tokio::test(start_paused = true)]
async fn stuck_delete_needs_force() {
    let sticky = app("sticky", "");
    let h = Harness::with(&[&sticky]).await;
    h.scheduler.run_until_settled(5).await.expect("settle");
    h.live.fail_deletes("sticky", u32::MAX);

    let id = UnitId::from("app/sticky");
    h.scheduler.request_delete(&id, false).await.expect("delete");
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.delete_count("sticky"), 2);
    let unit = h.unit("app/sticky").await;
    assert!(unit.deletion.as_ref().is_some_and(|d| d.stuck));
    assert!(unit.message.contains("force delete required"));

    h.scheduler.force_delete(&id).await.expect("force");
    h.scheduler.reconcile_pass().await.expect("pass");

    assert_eq!(h.live.delete_count("sticky"), 2);
    assert!(h.live.contains("sticky"), "finalizer bypass leaves the object");
    assert!(!h.contains("app/sticky").await);
    assert_eq!(
        h.tombstone("app/sticky").await.map(|u| u.phase),
        Some(UnitPhase::Deleted)
    );
}

#[tokio::test(start_paused = true)]
async fn queued_apply_is_cancelled_by_delete() {
    let a = app("a", "");
    let b = app("b", "");
    let h = Harness::new(EngineConfig {
        max_concurrency: 1,
        ..config()
    });
    h.scheduler
        .ingest(&manifests(&[&a, &b]), "test", None)
        .await
        .expect("ingest");
    h.live.set_latency(Some(Duration::from_millis(500)));

    let scheduler = Arc::clone(&h.scheduler);
    let pass = tokio::spawn(async move { scheduler.reconcile_pass().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scheduler
        .request_delete(&UnitId::from("app/b"), false)
        .await
        .expect("delete");
    pass.await.expect("join").expect("pass");

    assert_eq!(h.live.apply_count("a"), 1);
    assert_eq!(h.live.apply_count("b"), 0);
    assert_eq!(h.live.delete_count("b"), 0);
    assert_eq!(
        h.tombstone("app/b").await.map(|u| u.phase),
        Some(UnitPhase::Deleted)
    );
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn prune_waits_for_its_wave_to_be_healthy() {
    let with_cache = format!(
        "{PLATFORM}    - name: cache\n      base:\n        kind: Cache\n        spec: {{size: 1}}\n"
    );
    let without_cache = PLATFORM.replace(
        "        kind: Network\n        spec: {}",
        "        kind: Network\n        spec: {tier: v2}",
    );
    let claim = claim("  syncPolicy: {autoPrune: true}\n");
    let h = Harness::with(&[&with_cache, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");
    assert!(h.live.contains("shop-orders-cache"));

    h.live.set_ready(NETWORK, false);
    let report = h
        .scheduler
        .ingest(&manifests(&[&without_cache, &claim]), "test", None)
        .await
        .expect("ingest");
    assert_eq!(report.prune_pending, vec![UnitId::from("mr/shop-orders/cache")]);

    h.scheduler.reconcile_pass().await.expect("pass");
    assert!(h.live.contains("shop-orders-cache"), "network is not ready yet");
    assert!(h.unit("mr/shop-orders/cache").await.message.contains("prune deferred"));

    h.live.set_ready(NETWORK, true);
    h.scheduler.run_until_settled(10).await.expect("settle");
    assert!(!h.live.contains("shop-orders-cache"));
    assert_eq!(h.live.delete_count("shop-orders-cache"), 1);
    assert!(!h.contains("mr/shop-orders/cache").await);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_retries_degrade_the_unit() {
    let flaky = app("flaky", "");
    let h = Harness::with(&[&flaky]).await;
    h.live.fail_applies("flaky", u32::MAX);

    h.scheduler.run_until_settled(20).await.expect("settle");

    assert_eq!(h.live.apply_count("flaky"), 3);
    let unit = h.unit("app/flaky").await;
    assert_eq!(unit.phase, UnitPhase::Degraded);
    assert_eq!(unit.observed_status, ObservedStatus::Degraded);
    assert_eq!(unit.retry_after, None);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let flaky = app("flaky", "");
    let h = Harness::with(&[&flaky]).await;
    h.live.fail_applies("flaky", 1);

    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.apply_count("flaky"), 2);
    let unit = h.unit("app/flaky").await;
    assert_eq!(unit.phase, UnitPhase::Healthy);
    assert_eq!(unit.attempts, 0);
    assert_eq!(unit.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn slow_apply_times_out() {
    let slow = app("slow", "");
    let h = Harness::with(&[&slow]).await;
    h.live.set_latency(Some(Duration::from_secs(2)));

    let report = h.scheduler.reconcile_pass().await.expect("pass");

    assert_eq!(report.failed, vec![UnitId::from("app/slow")]);
    let unit = h.unit("app/slow").await;
    assert_eq!(unit.phase, UnitPhase::Error);
    assert!(unit.message.contains("TimeoutError"));
    assert_eq!(unit.last_error, Some(ErrorClass::Timeout));
    assert_eq!(unit.attempts, 1);
    assert!(unit.retry_after.is_some());
}

#[tokio::test]
async fn invalid_resource_is_not_retried() {
    let bad = app("bad", "");
    let h = Harness::with(&[&bad]).await;
    h.live.reject("bad");

    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.apply_count("bad"), 1);
    let unit = h.unit("app/bad").await;
    assert_eq!(unit.fatal.map(|f| f.class), Some(ErrorClass::Validation));

    h.scheduler.force_sync(&UnitId::from("app/bad")).await.expect("force");
    h.scheduler.reconcile_pass().await.expect("pass");
    assert_eq!(h.live.apply_count("bad"), 2);
}

#[tokio::test(start_paused = true)]
async fn desired_change_during_apply_is_a_conflict() {
    let v1 = app("web", "");
    let v2 = "kind: Application\nmetadata: {name: web}\nspec:\n  resource: {kind: ConfigMap, data: {owner: v2}}\n";
    let h = Harness::with(&[&v1]).await;
    h.live.set_latency(Some(Duration::from_millis(500)));

    let scheduler = Arc::clone(&h.scheduler);
    let pass = tokio::spawn(async move { scheduler.reconcile_pass().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scheduler
        .ingest(&manifests(&[v2]), "test", None)
        .await
        .expect("ingest v2");
    let report = pass.await.expect("join").expect("pass");

    assert_eq!(report.conflicts, vec![UnitId::from("app/web")]);
    let unit = h.unit("app/web").await;
    assert_eq!(unit.phase, UnitPhase::Pending);
    assert_eq!(unit.last_applied_hash, None);

    h.live.set_latency(None);
    h.scheduler.run_until_settled(10).await.expect("settle");
    assert_eq!(
        h.live.get("web"),
        Some(json!({"kind": "ConfigMap", "data": {"owner": "v2"}}))
    );
}

// ---------------------------------------------------------------------------
// Wave barrier
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_lower_wave_holds_back_higher_waves() {
    let base = app("base", "");
    let later = app("later", "  wave: 1\n");
    let h = Harness::with(&[&base, &later]).await;
    h.live.reject("base");

    h.scheduler.run_until_settled(10).await.expect("settle");

    let base = h.unit("app/base").await;
    assert_eq!(base.phase, UnitPhase::Error);
    assert_eq!(base.fatal.map(|f| f.class), Some(ErrorClass::Validation));
    assert_eq!(h.live.apply_count("later"), 0);
    let later = h.unit("app/later").await;
    assert_eq!(later.phase, UnitPhase::Pending);
    assert_eq!(later.sync_status, SyncStatus::OutOfSync);
    assert!(later.message.contains("waiting for app/base"));
}

#[tokio::test(start_paused = true)]
async fn degraded_lower_wave_holds_back_higher_waves_until_it_recovers() {
    let base = app("base", "");
    let later = app("later", "  wave: 1\n");
    let h = Harness::with(&[&base, &later]).await;
    h.live.fail_applies("base", u32::MAX);

    h.scheduler.run_until_settled(20).await.expect("settle");

    assert_eq!(h.unit("app/base").await.phase, UnitPhase::Degraded);
    assert_eq!(h.live.apply_count("later"), 0);
    let held = h.unit("app/later").await;
    assert_ne!(held.sync_status, SyncStatus::Synced);
    assert!(held.message.contains("waiting for app/base"));

    h.live.fail_applies("base", 0);
    h.scheduler.force_sync(&UnitId::from("app/base")).await.expect("force");
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.live.apply_count("later"), 1);
    let later = h.unit("app/later").await;
    assert_eq!(later.phase, UnitPhase::Healthy);
    assert_eq!(later.sync_status, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn composite_sync_respects_the_wave_barrier() {
    let base = app("base", "");
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim, &base]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");
    assert_eq!(h.unit("xr/shop-orders").await.sync_status, SyncStatus::Synced);

    // base (wave 0) disappears and cannot be recreated.
    h.live.remove_out_of_band("base");
    h.live.fail_applies("base", u32::MAX);
    let mut detector = DriftDetector::with_interval(Arc::clone(&h.scheduler), Duration::from_secs(30));
    detector.tick().await.expect("tick");
    h.scheduler.run_until_settled(20).await.expect("settle");

    assert_eq!(h.unit("app/base").await.phase, UnitPhase::Degraded);
    let xr = h.unit("xr/shop-orders").await;
    assert!(xr.ready);
    assert_eq!(xr.sync_status, SyncStatus::Syncing);
    assert!(xr.message.contains("waiting for app/base"));
    let network = h.unit("mr/shop-orders/network").await;
    assert_eq!(network.sync_status, SyncStatus::Syncing);
    // Same wave as base: not held back.
    assert_eq!(h.unit("claim/shop/orders").await.sync_status, SyncStatus::Synced);

    h.live.fail_applies("base", 0);
    h.scheduler.force_sync(&UnitId::from("app/base")).await.expect("force");
    h.scheduler.run_until_settled(10).await.expect("settle");

    assert_eq!(h.unit("xr/shop-orders").await.sync_status, SyncStatus::Synced);
    assert_eq!(h.unit("mr/shop-orders/network").await.sync_status, SyncStatus::Synced);
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drift_is_healed_within_one_tick() {
    let claim = claim("  syncPolicy: {selfHeal: true}\n");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");

    h.live.mutate(NETWORK, |v| v["spec"]["region"] = json!("tampered"));
    let mut detector = DriftDetector::with_interval(Arc::clone(&h.scheduler), Duration::from_secs(30));
    let events = detector.tick().await.expect("tick");

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, DriftKind::Drifted);
    assert_eq!(
        h.live.get(NETWORK).map(|v| v["spec"]["region"].clone()),
        Some(json!("eu-west-1"))
    );
    let unit = h.unit("mr/shop-orders/network").await;
    assert!(!unit.drifted);
    assert_eq!(unit.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn drift_without_self_heal_is_reported() {
    let claim = claim("");
    let h = Harness::with(&[PLATFORM, &claim]).await;
    h.scheduler.run_until_settled(10).await.expect("settle");

    h.live.mutate(NETWORK, |v| v["spec"]["region"] = json!("tampered"));
    let mut detector = DriftDetector::with_interval(Arc::clone(&h.scheduler), Duration::from_secs(30));
    let events = detector.tick().await.expect("tick");

    assert_eq!(events.len(), 1);
    assert_eq!(h.live.apply_count(NETWORK), 1);
    let unit = h.unit("mr/shop-orders/network").await;
    assert!(unit.drifted);
    assert_eq!(unit.sync_status, SyncStatus::OutOfSync);

    // Reported once, not on every tick.
    detector.notify(&UnitId::from("mr/shop-orders/network"));
    assert!(detector.tick().await.expect("tick").is_empty());
}

#[tokio::test]
async fn missing_live_object_is_recreated() {
    let web = app("web", "");
    let h = Harness::with(&[&web]).await;
    h.scheduler.run_until_settled(5).await.expect("settle");

    h.live.remove_out_of_band("web");
    let mut detector = DriftDetector::new(Arc::clone(&h.scheduler));
    let events = detector.tick().await.expect("tick");

    assert_eq!(events[0].kind, DriftKind::Missing);
    assert!(h.live.contains("web"));
    assert_eq!(h.live.apply_count("web"), 2);
}
