//! Rollout lifecycle integration tests.
//!
//! Walks full rollouts through the reconcile state machine against an
//! in-memory store: initialization, installer workload creation, progress
//! folding as the external installer labels nodes, finalization, runtime
//! exposure, and deletion. All tests run in-process.

use std::collections::BTreeMap;

use enclave_controller::progress::{SUCCESS_LABEL_KEY, SUCCESS_LABEL_VALUE};
use enclave_controller::resources::RUNTIME_VARIANTS;
use enclave_controller::selector::DEFAULT_WORKER_LABEL_KEY;
use enclave_controller::{
    Reconcile, ReconcileError, RolloutController, MONITOR_POLL_INTERVAL,
};
use enclave_state::{NodeRecord, RolloutRequest, StateStore};

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

fn test_request(name: &str) -> RolloutRequest {
    RolloutRequest {
        name: name.to_string(),
        node_selector: None,
        source_image: "registry.local/enclave:1.0".to_string(),
        deleted: false,
        created_at: 1000,
    }
}

fn worker_node(name: &str) -> NodeRecord {
    let mut labels = BTreeMap::new();
    labels.insert(DEFAULT_WORKER_LABEL_KEY.to_string(), String::new());
    NodeRecord {
        name: name.to_string(),
        labels,
        registered_at: 1000,
    }
}

fn seed_workers(store: &StateStore, count: u32) {
    for i in 1..=count {
        store.put_node(&worker_node(&format!("node-{i}"))).unwrap();
    }
}

/// Simulate the external installer finishing on a node.
fn mark_installed(store: &StateStore, node: &str) {
    store
        .label_node(node, SUCCESS_LABEL_KEY, SUCCESS_LABEL_VALUE)
        .unwrap();
}

// ── Scenario A: fresh rollout, no node labeled yet ────────────────

#[test]
fn fresh_rollout_pins_target_and_creates_workload() {
    let store = test_store();
    seed_workers(&store, 3);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    let outcome = controller.reconcile("default").unwrap();

    let stored = store.get_rollout("default").unwrap().unwrap();
    assert_eq!(stored.status.target_node_count, 3);
    assert_eq!(stored.status.in_progress.count, 0);
    assert_eq!(stored.status.completed.count, 0);

    let workloads = store.list_workloads().unwrap();
    assert_eq!(workloads.len(), 1);
    assert_eq!(workloads[0].name, "enclave-installer-install");
    assert_eq!(workloads[0].image, "registry.local/enclave:1.0");

    // Still waiting for nodes, so monitoring continues.
    assert_eq!(outcome, Reconcile::RequeueAfter(MONITOR_POLL_INTERVAL));
}

// ── Scenario B: partial progress ──────────────────────────────────

#[test]
fn partial_progress_folds_labeled_nodes_and_requeues() {
    let store = test_store();
    seed_workers(&store, 3);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    controller.reconcile("default").unwrap();

    mark_installed(&store, "node-1");
    mark_installed(&store, "node-3");

    let outcome = controller.reconcile("default").unwrap();

    let stored = store.get_rollout("default").unwrap().unwrap();
    assert_eq!(stored.status.in_progress.count, 2);
    assert_eq!(stored.status.completed.count, 0);
    assert!(stored.status.exposed_runtime_names.is_empty());

    // Workload untouched, re-invocation requested.
    assert_eq!(store.list_workloads().unwrap().len(), 1);
    assert_eq!(outcome, Reconcile::RequeueAfter(MONITOR_POLL_INTERVAL));
}

// ── Scenario C: completion and exposure ───────────────────────────

#[test]
fn full_progress_finalizes_and_exposes_runtime() {
    let store = test_store();
    seed_workers(&store, 3);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    controller.reconcile("default").unwrap();

    for i in 1..=3 {
        mark_installed(&store, &format!("node-{i}"));
    }

    // Folding pass: every node reported, finalize on the next invocation.
    let outcome = controller.reconcile("default").unwrap();
    assert_eq!(outcome, Reconcile::Requeue);

    // Finalization pass.
    let outcome = controller.reconcile("default").unwrap();
    assert_eq!(outcome, Reconcile::Done);

    let stored = store.get_rollout("default").unwrap().unwrap();
    assert_eq!(stored.status.completed.count, 3);
    assert_eq!(stored.status.in_progress.count, 0);
    assert_eq!(
        stored.status.exposed_runtime_names,
        RUNTIME_VARIANTS.join(",")
    );

    let classes = store.list_runtime_classes().unwrap();
    assert_eq!(classes.len(), RUNTIME_VARIANTS.len());
    for class in &classes {
        assert_eq!(class.name, class.handler);
        assert!(class.node_selector.is_some());
    }

    // Steady state: a further reconcile is a no-op.
    let outcome = controller.reconcile("default").unwrap();
    assert_eq!(outcome, Reconcile::Done);
    assert_eq!(store.list_runtime_classes().unwrap().len(), RUNTIME_VARIANTS.len());
}

// ── Scenario D: deletion marker ───────────────────────────────────

#[test]
fn deletion_marker_is_a_noop_at_any_state() {
    let store = test_store();
    seed_workers(&store, 2);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    controller.reconcile("default").unwrap();
    let before = store.get_rollout("default").unwrap().unwrap();

    store.mark_rollout_deleted("default").unwrap();
    let outcome = controller.reconcile("default").unwrap();

    assert_eq!(outcome, Reconcile::Done);
    let after = store.get_rollout("default").unwrap().unwrap();
    assert_eq!(after.status, before.status);
}

// ── Scenario E: missing source image ──────────────────────────────

#[test]
fn missing_image_reports_precondition_without_side_effects() {
    let store = test_store();
    seed_workers(&store, 2);
    let mut request = test_request("default");
    request.source_image = String::new();
    store.create_rollout(&request).unwrap();

    let controller = RolloutController::new(store.clone());
    let err = controller.reconcile("default").unwrap_err();

    assert!(matches!(err, ReconcileError::SourceImageUnset));
    assert!(err.retry_after().is_some());
    assert!(store.list_workloads().unwrap().is_empty());
    assert!(store.list_runtime_classes().unwrap().is_empty());

    // Setting the image heals the rollout on the next pass.
    request.source_image = "registry.local/enclave:1.0".to_string();
    store.update_rollout_request(&request).unwrap();

    controller.reconcile("default").unwrap();
    assert_eq!(store.list_workloads().unwrap().len(), 1);
}

// ── Idempotency and invariants ────────────────────────────────────

#[test]
fn repeated_reconciles_create_each_side_effect_once() {
    let store = test_store();
    seed_workers(&store, 2);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    for i in 1..=2 {
        mark_installed(&store, &format!("node-{i}"));
    }

    // Drive to steady state, then keep reconciling.
    for _ in 0..6 {
        controller.reconcile("default").unwrap();
    }

    assert_eq!(store.list_workloads().unwrap().len(), 1);
    assert_eq!(store.list_runtime_classes().unwrap().len(), RUNTIME_VARIANTS.len());
}

#[test]
fn progress_is_monotonic_across_arbitrary_reentry() {
    let store = test_store();
    seed_workers(&store, 3);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    let mut last_completed = 0;

    for step in 0..10 {
        // Label one more node every few passes.
        if step % 3 == 0 && step / 3 < 3 {
            mark_installed(&store, &format!("node-{}", step / 3 + 1));
        }
        controller.reconcile("default").unwrap();

        let status = store.get_rollout("default").unwrap().unwrap().status;
        assert!(status.completed.count >= last_completed);
        assert!(status.in_progress.count + status.completed.count <= status.target_node_count);
        last_completed = status.completed.count;
    }

    let status = store.get_rollout("default").unwrap().unwrap().status;
    assert_eq!(status.completed.count, 3);
}

#[test]
fn exposure_happens_only_after_every_node_reports() {
    let store = test_store();
    seed_workers(&store, 2);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    controller.reconcile("default").unwrap();

    mark_installed(&store, "node-1");
    controller.reconcile("default").unwrap();
    controller.reconcile("default").unwrap();
    assert!(store.list_runtime_classes().unwrap().is_empty());

    mark_installed(&store, "node-2");
    controller.reconcile("default").unwrap();
    controller.reconcile("default").unwrap();
    assert_eq!(store.list_runtime_classes().unwrap().len(), RUNTIME_VARIANTS.len());
}

#[test]
fn stale_revision_write_is_rejected_and_retry_succeeds() {
    let store = test_store();
    seed_workers(&store, 1);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());

    // A concurrent writer bumps the revision between the controller's read
    // and its write.
    let stored = store.get_rollout("default").unwrap().unwrap();
    store
        .update_rollout_status("default", &stored.status, stored.revision)
        .unwrap();

    // The controller reads fresh state each pass, so its own pass succeeds
    // against the new revision.
    controller.reconcile("default").unwrap();
    let stored = store.get_rollout("default").unwrap().unwrap();
    assert_eq!(stored.status.target_node_count, 1);
}

#[test]
fn cascade_delete_removes_all_side_effects() {
    let store = test_store();
    seed_workers(&store, 1);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    mark_installed(&store, "node-1");
    for _ in 0..3 {
        controller.reconcile("default").unwrap();
    }
    assert!(!store.list_workloads().unwrap().is_empty());
    assert!(!store.list_runtime_classes().unwrap().is_empty());

    store.delete_rollout("default").unwrap();

    assert!(store.list_workloads().unwrap().is_empty());
    assert!(store.list_runtime_classes().unwrap().is_empty());
    // Reconciling the deleted rollout is a clean no-op.
    assert_eq!(controller.reconcile("default").unwrap(), Reconcile::Done);
}

#[test]
fn target_count_is_snapshotted_once() {
    let store = test_store();
    seed_workers(&store, 2);
    store.create_rollout(&test_request("default")).unwrap();

    let controller = RolloutController::new(store.clone());
    controller.reconcile("default").unwrap();
    assert_eq!(
        store.get_rollout("default").unwrap().unwrap().status.target_node_count,
        2
    );

    // More workers appear after the target was pinned.
    seed_workers(&store, 4);
    controller.reconcile("default").unwrap();

    // The snapshot is never re-derived.
    assert_eq!(
        store.get_rollout("default").unwrap().unwrap().status.target_node_count,
        2
    );
}
