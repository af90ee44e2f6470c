//! In-memory [`ClusterStore`] used by tests and offline runs.
//!
//! Mirrors the semantics the engine relies on from a real API server:
//! generated uid/creationTimestamp/resourceVersion on create, RFC 7386 merge
//! patches gated by the resourceVersion token, and change events. Fault
//! injection hooks let tests force fetch failures and patch conflicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use steward_core::{ChangeEvent, ChangeKind, ManagedObjectRef, ObjectKind};

use crate::{parse_selector, queue_cap, CancelHandle, ClusterStore, StoreError, StoreResult, StreamHandle};

pub struct MemStore {
    objects: Mutex<HashMap<ManagedObjectRef, Value>>,
    rv: AtomicU64,
    forced_conflicts: AtomicUsize,
    get_faults: Mutex<HashMap<ObjectKind, usize>>,
    events: broadcast::Sender<(ChangeEvent, Value)>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: Mutex::new(HashMap::new()),
            rv: AtomicU64::new(1),
            forced_conflicts: AtomicUsize::new(0),
            get_faults: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Force the next `n` patches to fail with a conflict regardless of token.
    pub fn conflict_next_patches(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Force the next `n` gets of `kind` to fail with an api error.
    pub fn fail_gets(&self, kind: ObjectKind, n: usize) {
        self.get_faults.lock().expect("get_faults lock").insert(kind, n);
    }

    /// Mutate a stored object in place, outside the engine's view. Test hook
    /// simulating a foreign writer; bumps the resourceVersion like a real
    /// server would.
    pub fn mutate(&self, obj: &ManagedObjectRef, f: impl FnOnce(&mut Value)) -> StoreResult<()> {
        let mut map = self.objects.lock().expect("objects lock");
        let stored = map.get_mut(obj).ok_or(StoreError::NotFound)?;
        f(stored);
        let rv = self.rv.fetch_add(1, Ordering::SeqCst);
        stored["metadata"]["resourceVersion"] = json!(rv.to_string());
        let labels = stored["metadata"]["labels"].clone();
        self.emit(obj, ChangeKind::Applied, labels);
        Ok(())
    }

    fn next_rv(&self) -> String {
        self.rv.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn emit(&self, obj: &ManagedObjectRef, change: ChangeKind, labels: Value) {
        let ev = ChangeEvent {
            kind: obj.kind,
            namespace: obj.namespace.clone(),
            name: obj.name.clone(),
            change,
        };
        let _ = self.events.send((ev, labels));
    }
}

/// RFC 7386 merge: null removes, objects merge recursively, everything else
/// replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[async_trait]
impl ClusterStore for MemStore {
    async fn get(&self, obj: &ManagedObjectRef) -> StoreResult<Option<Value>> {
        {
            let mut faults = self.get_faults.lock().expect("get_faults lock");
            if let Some(n) = faults.get_mut(&obj.kind) {
                if *n > 0 {
                    *n -= 1;
                    return Err(StoreError::Api("injected fetch failure".into()));
                }
            }
        }
        let map = self.objects.lock().expect("objects lock");
        Ok(map.get(obj).cloned())
    }

    async fn create(&self, obj: &ManagedObjectRef, body: &Value) -> StoreResult<Value> {
        let mut map = self.objects.lock().expect("objects lock");
        if map.contains_key(obj) {
            return Err(StoreError::AlreadyExists);
        }
        let mut stored = body.clone();
        if !stored["metadata"].is_object() {
            stored["metadata"] = json!({});
        }
        stored["metadata"]["name"] = json!(obj.name);
        if let Some(ns) = &obj.namespace {
            stored["metadata"]["namespace"] = json!(ns);
        }
        if stored["metadata"]["uid"].is_null() {
            stored["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if stored["metadata"]["creationTimestamp"].is_null() {
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            stored["metadata"]["creationTimestamp"] = json!(ts);
        }
        stored["metadata"]["resourceVersion"] = json!(self.next_rv());
        map.insert(obj.clone(), stored.clone());
        let labels = stored["metadata"]["labels"].clone();
        drop(map);
        self.emit(obj, ChangeKind::Applied, labels);
        Ok(stored)
    }

    async fn patch(&self, obj: &ManagedObjectRef, patch: &Value) -> StoreResult<Value> {
        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict("injected conflict".into()));
        }
        let mut map = self.objects.lock().expect("objects lock");
        let stored = map.get_mut(obj).ok_or(StoreError::NotFound)?;
        let token = patch["metadata"]["resourceVersion"].as_str();
        let live_rv = stored["metadata"]["resourceVersion"].as_str().unwrap_or("");
        match token {
            None => return Err(StoreError::Conflict("missing resourceVersion token".into())),
            Some(t) if t != live_rv => {
                return Err(StoreError::Conflict(format!(
                    "stale resourceVersion {} (live {})",
                    t, live_rv
                )))
            }
            Some(_) => {}
        }
        merge_patch(stored, patch);
        stored["metadata"]["resourceVersion"] = json!(self.next_rv());
        let out = stored.clone();
        let labels = out["metadata"]["labels"].clone();
        drop(map);
        self.emit(obj, ChangeKind::Applied, labels);
        Ok(out)
    }

    async fn delete(&self, obj: &ManagedObjectRef) -> StoreResult<()> {
        let mut map = self.objects.lock().expect("objects lock");
        let removed = map.remove(obj).ok_or(StoreError::NotFound)?;
        drop(map);
        self.emit(obj, ChangeKind::Deleted, removed["metadata"]["labels"].clone());
        Ok(())
    }

    async fn watch(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> StoreResult<StreamHandle<ChangeEvent>> {
        let mut sub = self.events.subscribe();
        let (tx, rx) = mpsc::channel(queue_cap());
        let ns = namespace.map(|s| s.to_string());
        let selector = label_selector.map(parse_selector).unwrap_or_default();
        let task = tokio::spawn(async move {
            while let Ok((ev, labels)) = sub.recv().await {
                if ev.kind != kind {
                    continue;
                }
                if let Some(want_ns) = &ns {
                    if ev.namespace.as_deref() != Some(want_ns.as_str()) {
                        continue;
                    }
                }
                let matches = selector.iter().all(|(k, v)| {
                    labels.get(k).and_then(|x| x.as_str()) == Some(v.as_str())
                });
                if !matches {
                    continue;
                }
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = json!({
            "metadata": { "name": "x", "labels": { "a": "1" } },
            "data": { "keep": "v", "drop": "v" },
            "spec": { "replicas": 1 }
        });
        let patch = json!({
            "data": { "drop": null, "added": "w" },
            "spec": { "replicas": 3 }
        });
        merge_patch(&mut target, &patch);
        assert_eq!(target["data"], json!({ "keep": "v", "added": "w" }));
        assert_eq!(target["spec"]["replicas"], json!(3));
        assert_eq!(target["metadata"]["labels"]["a"], json!("1"));
    }
}
