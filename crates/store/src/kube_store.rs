//! kube-rs backed [`ClusterStore`].
//!
//! The kind set is closed, so `ApiResource`s are declared statically instead
//! of going through discovery. All calls are bounded by the per-call timeout
//! and mapped into the store error taxonomy.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use steward_core::{ChangeEvent, ChangeKind, ManagedObjectRef, ObjectKind};

use crate::{call_timeout, queue_cap, CancelHandle, ClusterStore, StoreError, StoreResult, StreamHandle};

/// Field manager name stamped on our mutations.
const FIELD_MANAGER: &str = "steward";

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api_resource(kind: ObjectKind) -> ApiResource {
        ApiResource {
            group: kind.group().to_string(),
            version: kind.version().to_string(),
            api_version: kind.api_version(),
            kind: kind.kind().to_string(),
            plural: kind.plural().to_string(),
        }
    }

    fn api_for(&self, obj: &ManagedObjectRef) -> StoreResult<Api<DynamicObject>> {
        let ar = Self::api_resource(obj.kind);
        if obj.kind.namespaced() {
            match obj.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(StoreError::Api(format!(
                    "namespace required for namespaced kind {}",
                    obj.kind
                ))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

fn map_kube_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
        kube::Error::Api(ae) if ae.reason == "AlreadyExists" => StoreError::AlreadyExists,
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        other => StoreError::Api(other.to_string()),
    }
}

/// Run one store call under the configured timeout budget.
async fn bounded<T, F>(op: &'static str, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    let budget = call_timeout();
    let t0 = Instant::now();
    let res = match tokio::time::timeout(budget, fut).await {
        Ok(inner) => inner.map_err(map_kube_err),
        Err(_) => Err(StoreError::Timeout(budget)),
    };
    histogram!("store_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if res.is_err() {
        counter!("store_call_errors", 1u64, "op" => op);
    }
    res
}

fn to_dynamic(body: &Value) -> StoreResult<DynamicObject> {
    serde_json::from_value(body.clone())
        .map_err(|e| StoreError::Api(format!("invalid object body: {}", e)))
}

fn to_value(obj: &DynamicObject) -> StoreResult<Value> {
    serde_json::to_value(obj).map_err(|e| StoreError::Api(format!("serializing object: {}", e)))
}

fn event_from(kind: ObjectKind, obj: &DynamicObject, change: ChangeKind) -> ChangeEvent {
    ChangeEvent {
        kind,
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        change,
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, obj: &ManagedObjectRef) -> StoreResult<Option<Value>> {
        counter!("store_get_total", 1u64);
        let api = self.api_for(obj)?;
        let name = obj.name.clone();
        let live = bounded("get", async move { api.get_opt(&name).await }).await?;
        match live {
            Some(o) => Ok(Some(to_value(&o)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &ManagedObjectRef, body: &Value) -> StoreResult<Value> {
        counter!("store_create_total", 1u64);
        let api = self.api_for(obj)?;
        let dyn_obj = to_dynamic(body)?;
        let created = bounded("create", async move {
            api.create(&PostParams::default(), &dyn_obj).await
        })
        .await?;
        to_value(&created)
    }

    async fn patch(&self, obj: &ManagedObjectRef, patch: &Value) -> StoreResult<Value> {
        counter!("store_patch_total", 1u64);
        let api = self.api_for(obj)?;
        let name = obj.name.clone();
        let body = patch.clone();
        let patched = bounded("patch", async move {
            let pp = PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            api.patch(&name, &pp, &Patch::Merge(&body)).await
        })
        .await?;
        to_value(&patched)
    }

    async fn delete(&self, obj: &ManagedObjectRef) -> StoreResult<()> {
        counter!("store_delete_total", 1u64);
        let api = self.api_for(obj)?;
        let name = obj.name.clone();
        bounded("delete", async move {
            api.delete(&name, &DeleteParams::default()).await
        })
        .await?;
        Ok(())
    }

    async fn watch(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> StoreResult<StreamHandle<ChangeEvent>> {
        let ar = Self::api_resource(kind);
        let api: Api<DynamicObject> = if kind.namespaced() {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let mut cfg = watcher::Config::default();
        if let Some(sel) = label_selector {
            cfg = cfg.labels(sel);
        }

        let (tx, rx) = mpsc::channel::<ChangeEvent>(queue_cap());
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, cfg);
            futures::pin_mut!(stream);
            info!(kind = %kind, "store watch started");
            'watch: loop {
                match stream.try_next().await {
                    Ok(Some(ev)) => {
                        let events: Vec<ChangeEvent> = match ev {
                            Event::Applied(o) => vec![event_from(kind, &o, ChangeKind::Applied)],
                            Event::Deleted(o) => vec![event_from(kind, &o, ChangeKind::Deleted)],
                            Event::Restarted(list) => list
                                .iter()
                                .map(|o| event_from(kind, o, ChangeKind::Applied))
                                .collect(),
                        };
                        for ce in events {
                            // receiver gone: stop watching
                            if tx.send(ce).await.is_err() {
                                break 'watch;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(kind = %kind, "store watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "store watch failed");
                        break;
                    }
                }
            }
        });

        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}
