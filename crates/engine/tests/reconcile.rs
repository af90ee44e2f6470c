#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use steward_core::{
    labels, ChangeKind, ErrorKind, ManagedObjectRef, ObjectKind, OperandContext, OwnerLink,
    ReconcileOutcome,
};
use steward_engine::{PassCancel, Reconciler};
use steward_store::{ClusterStore, MemStore};

fn ctx() -> OperandContext {
    OperandContext {
        name: "node-labeller".into(),
        namespace: "kubevirt".into(),
        component: "schedule".into(),
        part_of: "steward".into(),
        version: "v0.3.0".into(),
        owner: Some(OwnerLink {
            api_version: "steward.io/v1".into(),
            kind: "Steward".into(),
            name: "steward".into(),
            uid: "6f1c3b8e-0000-0000-0000-000000000000".into(),
        }),
    }
}

fn engine() -> (Arc<MemStore>, Reconciler) {
    let store = Arc::new(MemStore::new());
    let rec = Reconciler::new(store.clone() as Arc<dyn ClusterStore>);
    (store, rec)
}

fn outcome_for(report: &steward_core::PassReport, kind: ObjectKind) -> &ReconcileOutcome {
    &report
        .outcomes
        .iter()
        .find(|o| o.object.kind == kind)
        .unwrap_or_else(|| panic!("no outcome for {}", kind.kind()))
        .outcome
}

fn config_map_ref(c: &OperandContext) -> ManagedObjectRef {
    ManagedObjectRef::namespaced(
        ObjectKind::ConfigMap,
        &c.namespace,
        steward_catalogue::node_labeller::CONFIG_MAP_NAME,
    )
}

#[tokio::test]
async fn first_pass_creates_everything_second_pass_is_idle() {
    let c = ctx();
    let (store, rec) = engine();

    let first = rec.reconcile_once(&c).await;
    assert_eq!(first.outcomes.len(), 6);
    assert!(first.healthy());
    for o in &first.outcomes {
        assert_eq!(o.outcome, ReconcileOutcome::Created, "{}", o.object);
    }

    // Report order follows the catalogue regardless of concurrent completion.
    let expected: Vec<_> = steward_catalogue::entries(&c)
        .into_iter()
        .map(|e| e.object)
        .collect();
    let got: Vec<_> = first.outcomes.iter().map(|o| o.object.clone()).collect();
    assert_eq!(got, expected);

    let second = rec.reconcile_once(&c).await;
    assert!(second.healthy());
    for o in &second.outcomes {
        assert_eq!(o.outcome, ReconcileOutcome::Unchanged, "{}", o.object);
    }

    // Created objects really carry the identity labels.
    let live = store.get(&config_map_ref(&c)).await.unwrap().unwrap();
    assert!(labels::owned_by_us(&live["metadata"]["labels"], &c));
}

#[tokio::test]
async fn deleted_object_is_recreated_and_only_that_object() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    let binding = ManagedObjectRef::cluster(
        ObjectKind::ClusterRoleBinding,
        steward_catalogue::node_labeller::CLUSTER_ROLE_BINDING_NAME,
    );
    store.delete(&binding).await.unwrap();

    let report = rec.reconcile_once(&c).await;
    assert!(report.healthy());
    let created: Vec<_> = report
        .outcomes
        .iter()
        .filter(|o| o.outcome == ReconcileOutcome::Created)
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].object, binding);
    assert_eq!(
        report
            .outcomes
            .iter()
            .filter(|o| o.outcome == ReconcileOutcome::Unchanged)
            .count(),
        5
    );

    let live = store.get(&binding).await.unwrap().unwrap();
    assert!(labels::owned_by_us(&live["metadata"]["labels"], &c));
    assert!(live["subjects"].is_array());
    assert!(live["roleRef"].is_object());
}

#[tokio::test]
async fn non_authoritative_changes_are_left_alone() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    let cm = config_map_ref(&c);
    store
        .mutate(&cm, |v| {
            v["metadata"]["annotations"] = json!({ "scribbled-by": "somebody-else" });
            // Extra labels beyond the identity set are foreign property too.
            v["metadata"]["labels"]["team"] = json!("virt");
        })
        .unwrap();
    let rv_before = store.get(&cm).await.unwrap().unwrap()["metadata"]["resourceVersion"].clone();

    let report = rec.reconcile_once(&c).await;
    assert_eq!(*outcome_for(&report, ObjectKind::ConfigMap), ReconcileOutcome::Unchanged);

    let live = store.get(&cm).await.unwrap().unwrap();
    assert_eq!(live["metadata"]["resourceVersion"], rv_before);
    assert_eq!(live["metadata"]["annotations"]["scribbled-by"], json!("somebody-else"));
    assert_eq!(live["metadata"]["labels"]["team"], json!("virt"));
}

#[tokio::test]
async fn authoritative_drift_is_patched_back_preserving_foreign_fields() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    let cm = config_map_ref(&c);
    let desired_data = store.get(&cm).await.unwrap().unwrap()["data"].clone();
    store
        .mutate(&cm, |v| {
            v["data"] = json!({ "rogue-key": "rogue" });
            v["metadata"]["annotations"] = json!({ "keep": "me" });
        })
        .unwrap();

    let report = rec.reconcile_once(&c).await;
    assert!(report.healthy());
    assert_eq!(*outcome_for(&report, ObjectKind::ConfigMap), ReconcileOutcome::Updated);
    for o in &report.outcomes {
        if o.object.kind != ObjectKind::ConfigMap {
            assert_eq!(o.outcome, ReconcileOutcome::Unchanged, "{}", o.object);
        }
    }

    let live = store.get(&cm).await.unwrap().unwrap();
    assert_eq!(live["data"], desired_data);
    // resourceVersion replacement only; the patch never touched annotations.
    assert_eq!(live["metadata"]["annotations"]["keep"], json!("me"));
    assert!(labels::owned_by_us(&live["metadata"]["labels"], &c));
}

#[tokio::test]
async fn keys_added_inside_authoritative_fields_are_removed() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    // A foreign writer extends the owned data map without touching our key.
    let cm = config_map_ref(&c);
    let desired_data = store.get(&cm).await.unwrap().unwrap()["data"].clone();
    store
        .mutate(&cm, |v| {
            v["data"]["rogue-key"] = json!("rogue");
        })
        .unwrap();

    let report = rec.reconcile_once(&c).await;
    assert_eq!(*outcome_for(&report, ObjectKind::ConfigMap), ReconcileOutcome::Updated);

    let live = store.get(&cm).await.unwrap().unwrap();
    assert_eq!(live["data"], desired_data);
    assert!(live["data"].get("rogue-key").is_none());

    // Converged for good: the next pass has nothing left to do.
    let next = rec.reconcile_once(&c).await;
    assert_eq!(*outcome_for(&next, ObjectKind::ConfigMap), ReconcileOutcome::Unchanged);
}

#[tokio::test]
async fn version_label_alone_never_triggers_an_update() {
    let mut c = ctx();
    let (_store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    // A rolling upgrade bumps the stamped version; identity is unchanged and
    // authoritative fields are unchanged, so the pass stays idle.
    c.version = "v0.4.0".into();
    let report = rec.reconcile_once(&c).await;
    assert!(report.healthy());
    for o in &report.outcomes {
        assert_eq!(o.outcome, ReconcileOutcome::Unchanged, "{}", o.object);
    }
}

#[tokio::test]
async fn foreign_owner_in_identity_slot_is_never_touched() {
    let c = ctx();
    let (store, rec) = engine();

    let cm = config_map_ref(&c);
    let foreign = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "labels": { "app.kubernetes.io/managed-by": "helm" } },
        "data": { "theirs": "true" }
    });
    store.create(&cm, &foreign).await.unwrap();
    let rv_before = store.get(&cm).await.unwrap().unwrap()["metadata"]["resourceVersion"].clone();

    let report = rec.reconcile_once(&c).await;
    assert!(!report.healthy());
    assert_eq!(
        *outcome_for(&report, ObjectKind::ConfigMap),
        ReconcileOutcome::ConflictForeignOwner
    );
    // The rest of the catalogue still converges.
    for o in &report.outcomes {
        if o.object.kind != ObjectKind::ConfigMap {
            assert_eq!(o.outcome, ReconcileOutcome::Created, "{}", o.object);
        }
    }

    let live = store.get(&cm).await.unwrap().unwrap();
    assert_eq!(live["metadata"]["resourceVersion"], rv_before);
    assert_eq!(live["data"]["theirs"], json!("true"));
}

#[tokio::test]
async fn single_conflict_is_retried_with_a_fresh_token() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    let cm = config_map_ref(&c);
    store.mutate(&cm, |v| v["data"] = json!({ "rogue": "1" })).unwrap();
    store.conflict_next_patches(1);

    let report = rec.reconcile_once(&c).await;
    assert!(report.healthy());
    assert_eq!(*outcome_for(&report, ObjectKind::ConfigMap), ReconcileOutcome::Updated);
}

#[tokio::test]
async fn second_conflict_defers_to_the_next_pass() {
    let c = ctx();
    let (store, rec) = engine();
    assert!(rec.reconcile_once(&c).await.healthy());

    let cm = config_map_ref(&c);
    store.mutate(&cm, |v| v["data"] = json!({ "rogue": "1" })).unwrap();
    store.conflict_next_patches(2);

    let report = rec.reconcile_once(&c).await;
    assert!(!report.healthy());
    assert_eq!(
        *outcome_for(&report, ObjectKind::ConfigMap),
        ReconcileOutcome::Error(ErrorKind::UpdateConflict)
    );

    // The deferral resolves itself: the next pass converges.
    let next = rec.reconcile_once(&c).await;
    assert!(next.healthy());
    assert_eq!(*outcome_for(&next, ObjectKind::ConfigMap), ReconcileOutcome::Updated);
}

#[tokio::test]
async fn fetch_failure_is_isolated_to_its_entry() {
    let c = ctx();
    let (store, rec) = engine();
    store.fail_gets(ObjectKind::ClusterRole, 1);

    let report = rec.reconcile_once(&c).await;
    assert!(!report.healthy());
    assert_eq!(
        *outcome_for(&report, ObjectKind::ClusterRole),
        ReconcileOutcome::Error(ErrorKind::Fetch)
    );
    for o in &report.outcomes {
        if o.object.kind != ObjectKind::ClusterRole {
            assert_eq!(o.outcome, ReconcileOutcome::Created, "{}", o.object);
        }
    }

    // Fault exhausted; the degraded entry heals on the next pass.
    let next = rec.reconcile_once(&c).await;
    assert!(next.healthy());
    assert_eq!(*outcome_for(&next, ObjectKind::ClusterRole), ReconcileOutcome::Created);
}

#[tokio::test]
async fn cancelled_pass_starts_nothing_new() {
    let c = ctx();
    let (store, rec) = engine();

    let cancel = PassCancel::new();
    cancel.cancel();
    let report = rec.reconcile_with(&c, &cancel).await;
    assert!(report.outcomes.is_empty());
    for e in steward_catalogue::entries(&c) {
        assert!(store.get(&e.object).await.unwrap().is_none(), "{}", e.object);
    }
}

#[tokio::test]
async fn watch_delivers_changes_to_owned_objects_only() {
    let c = ctx();
    let (store, rec) = engine();

    let handle = rec.watch(&c).await.unwrap();
    let mut rx = handle.rx;

    // An unrelated object in the same namespace never reaches the stream.
    let stranger = ManagedObjectRef::namespaced(ObjectKind::ConfigMap, &c.namespace, "stranger");
    store
        .create(&stranger, &json!({ "apiVersion": "v1", "kind": "ConfigMap", "data": {} }))
        .await
        .unwrap();

    assert!(rec.reconcile_once(&c).await.healthy());

    let mut seen = Vec::new();
    for _ in 0..6 {
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watch event in time")
            .expect("stream open");
        assert_eq!(ev.change, ChangeKind::Applied);
        assert_ne!(ev.name, "stranger");
        seen.push(ev.kind);
    }
    for kind in ObjectKind::ALL {
        assert!(seen.contains(&kind), "no event for {}", kind.kind());
    }

    let binding = ManagedObjectRef::cluster(
        ObjectKind::ClusterRoleBinding,
        steward_catalogue::node_labeller::CLUSTER_ROLE_BINDING_NAME,
    );
    store.delete(&binding).await.unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delete event in time")
        .expect("stream open");
    assert_eq!(ev.change, ChangeKind::Deleted);
    assert_eq!(ev.kind, ObjectKind::ClusterRoleBinding);

    // Cancelling tears down the per-kind watchers and closes the stream.
    handle.cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "stream did not close after cancel");
}
