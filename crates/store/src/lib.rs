//! Steward store: the cluster object store seam.
//!
//! The engine never talks to the API server directly; it goes through
//! [`ClusterStore`], injected as a collaborator so tests can substitute the
//! in-memory implementation. Bodies are plain `serde_json::Value` k8s objects
//! since the kind set is closed and the engine only touches the fields it
//! projects.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use steward_core::{ChangeEvent, ManagedObjectRef, ObjectKind};

pub mod kube_store;
pub mod mem;

pub use kube_store::KubeStore;
pub use mem::MemStore;

/// Store failure taxonomy. `NotFound` on get is not an error (see the trait),
/// but delete reports it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("api: {0}")]
    Api(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cancellation handle that aborts the underlying watch task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn noop() -> Self {
        Self { task: None }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic handle returned by streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Typed access to the cluster's object storage, one object at a time.
///
/// Optimistic concurrency: `patch` bodies carry the live object's
/// `metadata.resourceVersion` as the token; a stale token yields
/// `StoreError::Conflict`. Implementations bound every call with the
/// `STEWARD_CALL_TIMEOUT_SECS` budget and surface overruns as
/// `StoreError::Timeout` rather than hanging a pass.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a live object snapshot. `Ok(None)` means not found.
    async fn get(&self, obj: &ManagedObjectRef) -> StoreResult<Option<Value>>;

    /// Create the object from a full desired body.
    async fn create(&self, obj: &ManagedObjectRef, body: &Value) -> StoreResult<Value>;

    /// Targeted merge patch. The body must contain only the fields the caller
    /// is authoritative for, plus `metadata.resourceVersion`.
    async fn patch(&self, obj: &ManagedObjectRef, patch: &Value) -> StoreResult<Value>;

    /// Used by the external teardown path and by tests simulating manual
    /// deletion. The reconcile loop itself never deletes.
    async fn delete(&self, obj: &ManagedObjectRef) -> StoreResult<()>;

    /// Stream change events for one kind, optionally filtered by namespace
    /// and label selector (`k=v,k=v`).
    async fn watch(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> StoreResult<StreamHandle<ChangeEvent>>;
}

pub(crate) fn call_timeout() -> Duration {
    let secs = std::env::var("STEWARD_CALL_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

pub(crate) fn queue_cap() -> usize {
    std::env::var("STEWARD_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// Parse a `k=v,k=v` selector into pairs. Invalid segments are ignored.
pub(crate) fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|seg| {
            let (k, v) = seg.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
