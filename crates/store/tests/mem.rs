#![forbid(unsafe_code)]

use serde_json::json;
use steward_core::{ChangeKind, ManagedObjectRef, ObjectKind};
use steward_store::{ClusterStore, MemStore, StoreError};

fn cm(name: &str) -> ManagedObjectRef {
    ManagedObjectRef::namespaced(ObjectKind::ConfigMap, "kubevirt", name)
}

fn body(data: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "labels": { "app.kubernetes.io/managed-by": "steward-operator" } },
        "data": { "k": data }
    })
}

#[tokio::test]
async fn create_assigns_server_metadata_and_rejects_duplicates() {
    let store = MemStore::new();
    let created = store.create(&cm("a"), &body("v")).await.unwrap();
    assert_eq!(created["metadata"]["name"], json!("a"));
    assert_eq!(created["metadata"]["namespace"], json!("kubevirt"));
    assert!(created["metadata"]["uid"].is_string());
    assert!(created["metadata"]["resourceVersion"].is_string());
    assert!(created["metadata"]["creationTimestamp"].is_string());

    match store.create(&cm("a"), &body("v")).await {
        Err(StoreError::AlreadyExists) => {}
        other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn patch_requires_fresh_resource_version_token() {
    let store = MemStore::new();
    let created = store.create(&cm("a"), &body("v")).await.unwrap();
    let rv = created["metadata"]["resourceVersion"].as_str().unwrap().to_string();

    // Stale token is a conflict
    let stale = json!({ "metadata": { "resourceVersion": "0" }, "data": { "k": "w" } });
    assert!(matches!(store.patch(&cm("a"), &stale).await, Err(StoreError::Conflict(_))));

    // Fresh token applies and bumps the version
    let ok = json!({ "metadata": { "resourceVersion": rv }, "data": { "k": "w" } });
    let patched = store.patch(&cm("a"), &ok).await.unwrap();
    assert_eq!(patched["data"]["k"], json!("w"));
    assert_ne!(patched["metadata"]["resourceVersion"], created["metadata"]["resourceVersion"]);
}

#[tokio::test]
async fn injected_conflicts_fire_before_token_checks() {
    let store = MemStore::new();
    let created = store.create(&cm("a"), &body("v")).await.unwrap();
    let rv = created["metadata"]["resourceVersion"].as_str().unwrap().to_string();
    store.conflict_next_patches(1);

    let patch = json!({ "metadata": { "resourceVersion": rv }, "data": { "k": "w" } });
    assert!(matches!(store.patch(&cm("a"), &patch).await, Err(StoreError::Conflict(_))));
    // Token is still fresh, so the retry goes through
    assert!(store.patch(&cm("a"), &patch).await.is_ok());
}

#[tokio::test]
async fn watch_filters_by_kind_namespace_and_labels() {
    let store = MemStore::new();
    let mut handle = store
        .watch(
            ObjectKind::ConfigMap,
            Some("kubevirt"),
            Some("app.kubernetes.io/managed-by=steward-operator"),
        )
        .await
        .unwrap();

    // Matching create
    store.create(&cm("a"), &body("v")).await.unwrap();
    // Different namespace, same kind: ignored
    let other_ns = ManagedObjectRef::namespaced(ObjectKind::ConfigMap, "other", "b");
    store.create(&other_ns, &body("v")).await.unwrap();
    // Same namespace, no identity labels: ignored
    let unlabeled = ManagedObjectRef::namespaced(ObjectKind::ConfigMap, "kubevirt", "c");
    store.create(&unlabeled, &json!({ "data": {} })).await.unwrap();
    // Deletion of the matching object
    store.delete(&cm("a")).await.unwrap();

    let first = handle.rx.recv().await.unwrap();
    assert_eq!(first.name, "a");
    assert_eq!(first.change, ChangeKind::Applied);
    let second = handle.rx.recv().await.unwrap();
    assert_eq!(second.name, "a");
    assert_eq!(second.change, ChangeKind::Deleted);
    handle.cancel.cancel();
}

#[tokio::test]
async fn injected_fetch_failures_are_scoped_and_one_shot() {
    let store = MemStore::new();
    store.create(&cm("a"), &body("v")).await.unwrap();
    store.fail_gets(ObjectKind::ConfigMap, 1);

    assert!(store.get(&cm("a")).await.is_err());
    assert!(store.get(&cm("a")).await.unwrap().is_some());
    // Other kinds are unaffected
    let role = ManagedObjectRef::cluster(ObjectKind::ClusterRole, "r");
    assert!(store.get(&role).await.unwrap().is_none());
}
