//! Steward reconcile engine.
//!
//! One pass walks the operand's catalogue: fetch the live object, recreate it
//! if it is gone, leave it alone if a foreign owner sits in its slot, patch
//! the authoritative fields if they drifted. Entries are independent: a
//! failing entry never aborts the pass, and every entry produces exactly one
//! outcome in the report.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use steward_catalogue::DesiredEntry;
use steward_core::{
    labels, ChangeEvent, ErrorKind, ManagedObjectRef, ObjectKind, OperandContext, OutcomeEntry,
    PassReport, ReconcileOutcome,
};
use steward_drift::{is_drifted, patch_body};
use steward_store::{ClusterStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

fn pass_concurrency() -> usize {
    std::env::var("STEWARD_PASS_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4)
        .max(1)
}

fn queue_cap() -> usize {
    std::env::var("STEWARD_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// Cooperative cancellation for an in-flight pass. Entries already started
/// run to completion; nothing new starts once the flag is set.
#[derive(Clone, Debug, Default)]
pub struct PassCancel {
    flag: Arc<AtomicBool>,
}

impl PassCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cancellation for a merged watch stream: stops the per-kind watchers, then
/// lets the merged channel drain and close.
pub struct WatchCancel {
    tx: Option<oneshot::Sender<()>>,
}

impl WatchCancel {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct WatchHandle {
    pub rx: mpsc::Receiver<ChangeEvent>,
    pub cancel: WatchCancel,
}

/// The reconcile loop. Holds the injected store handle and one lock per
/// operand so passes for the same operand never overlap; different operands
/// reconcile concurrently.
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store, locks: Mutex::new(HashMap::new()) }
    }

    fn operand_lock(&self, operand: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("operand lock map");
        locks
            .entry(operand.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one full reconcile pass for the operand.
    pub async fn reconcile_once(&self, ctx: &OperandContext) -> PassReport {
        self.reconcile_with(ctx, &PassCancel::new()).await
    }

    /// Run one pass under a cancellation token.
    pub async fn reconcile_with(&self, ctx: &OperandContext, cancel: &PassCancel) -> PassReport {
        let lock = self.operand_lock(&ctx.name);
        let _serialized = lock.lock().await;

        let t0 = Instant::now();
        counter!("reconcile_passes", 1u64);
        // Desired state is derived fresh every pass; operand context can
        // change between passes.
        let entries = steward_catalogue::entries(ctx);
        info!(operand = %ctx.name, entries = entries.len(), "reconcile pass start");

        let indexed: Vec<(usize, Option<OutcomeEntry>)> = futures::stream::iter(
            entries.into_iter().enumerate().map(|(idx, entry)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (idx, None);
                    }
                    (idx, Some(self.reconcile_entry(ctx, &entry).await))
                }
            }),
        )
        .buffer_unordered(pass_concurrency())
        .collect()
        .await;

        let skipped = indexed.iter().filter(|(_, o)| o.is_none()).count();
        if skipped > 0 {
            warn!(operand = %ctx.name, skipped, "pass cancelled before all entries started");
        }

        let mut outcomes: Vec<(usize, OutcomeEntry)> = indexed
            .into_iter()
            .filter_map(|(idx, o)| o.map(|o| (idx, o)))
            .collect();
        outcomes.sort_by_key(|(idx, _)| *idx);
        let outcomes: Vec<OutcomeEntry> = outcomes.into_iter().map(|(_, o)| o).collect();

        for o in &outcomes {
            counter!("reconcile_outcomes", 1u64, "outcome" => o.outcome.to_string());
        }
        let report = PassReport { operand: ctx.name.clone(), outcomes };
        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            operand = %ctx.name,
            healthy = report.healthy(),
            took_ms = %t0.elapsed().as_millis(),
            "reconcile pass done"
        );
        report
    }

    /// Fetch → absent-check → ownership → drift → patch, for one entry.
    async fn reconcile_entry(&self, ctx: &OperandContext, entry: &DesiredEntry) -> OutcomeEntry {
        let obj = &entry.object;
        let live = match self.store.get(obj).await {
            Ok(live) => live,
            Err(e) => {
                warn!(object = %obj, error = %e, "fetch failed");
                return outcome(obj, ReconcileOutcome::Error(ErrorKind::Fetch), Some(e.to_string()));
            }
        };

        match live {
            // Every catalogue entry must exist; absence means recreation,
            // unconditionally. Parent teardown bypasses this loop entirely
            // via owner-reference cascade delete.
            None => match self.store.create(obj, &entry.body).await {
                Ok(_) => {
                    info!(object = %obj, "created");
                    outcome(obj, ReconcileOutcome::Created, None)
                }
                Err(e) => {
                    warn!(object = %obj, error = %e, "create failed");
                    outcome(obj, ReconcileOutcome::Error(ErrorKind::Create), Some(e.to_string()))
                }
            },
            Some(live) => {
                if !labels::owned_by_us(&live["metadata"]["labels"], ctx) {
                    warn!(object = %obj, "foreign owner in identity slot; not touching");
                    return outcome(
                        obj,
                        ReconcileOutcome::ConflictForeignOwner,
                        Some("identity labels missing or differing".into()),
                    );
                }
                if !is_drifted(obj.kind, &live, &entry.body) {
                    debug!(object = %obj, "unchanged");
                    return outcome(obj, ReconcileOutcome::Unchanged, None);
                }
                self.update_entry(ctx, entry, &live).await
            }
        }
    }

    /// Patch the authoritative fields, retrying once with a re-fetched token
    /// on conflict. A second conflict defers to the next pass.
    async fn update_entry(
        &self,
        ctx: &OperandContext,
        entry: &DesiredEntry,
        live: &serde_json::Value,
    ) -> OutcomeEntry {
        let obj = &entry.object;
        let rv = match live["metadata"]["resourceVersion"].as_str() {
            Some(rv) => rv.to_string(),
            None => {
                return outcome(
                    obj,
                    ReconcileOutcome::Error(ErrorKind::Update),
                    Some("live object has no resourceVersion".into()),
                )
            }
        };

        match self.store.patch(obj, &patch_body(obj.kind, live, &entry.body, &rv)).await {
            Ok(_) => {
                info!(object = %obj, "updated");
                return outcome(obj, ReconcileOutcome::Updated, None);
            }
            Err(StoreError::Conflict(msg)) => {
                debug!(object = %obj, msg = %msg, "update conflict; retrying once");
            }
            Err(e) => {
                warn!(object = %obj, error = %e, "update failed");
                return outcome(obj, ReconcileOutcome::Error(ErrorKind::Update), Some(e.to_string()));
            }
        }

        // Retry path: somebody moved the object under us. Re-fetch, re-check,
        // patch once more with the fresh token.
        let fresh = match self.store.get(obj).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                return outcome(
                    obj,
                    ReconcileOutcome::Error(ErrorKind::UpdateConflict),
                    Some("object deleted during update; next pass recreates".into()),
                )
            }
            Err(e) => {
                return outcome(obj, ReconcileOutcome::Error(ErrorKind::Fetch), Some(e.to_string()))
            }
        };
        if !labels::owned_by_us(&fresh["metadata"]["labels"], ctx) {
            return outcome(
                obj,
                ReconcileOutcome::ConflictForeignOwner,
                Some("identity labels lost during update".into()),
            );
        }
        if !is_drifted(obj.kind, &fresh, &entry.body) {
            // The conflicting writer converged it for us.
            return outcome(obj, ReconcileOutcome::Unchanged, None);
        }
        let fresh_rv = fresh["metadata"]["resourceVersion"].as_str().unwrap_or_default();
        match self.store.patch(obj, &patch_body(obj.kind, &fresh, &entry.body, fresh_rv)).await {
            Ok(_) => {
                info!(object = %obj, "updated after conflict retry");
                outcome(obj, ReconcileOutcome::Updated, None)
            }
            Err(StoreError::Conflict(msg)) => {
                warn!(object = %obj, msg = %msg, "second conflict; deferring to next pass");
                outcome(obj, ReconcileOutcome::Error(ErrorKind::UpdateConflict), Some(msg))
            }
            Err(e) => outcome(obj, ReconcileOutcome::Error(ErrorKind::Update), Some(e.to_string())),
        }
    }

    /// Merged change stream over every kind the operand's catalogue declares,
    /// filtered to objects carrying the operand's identity labels. Consumers
    /// treat any event as "schedule another pass".
    pub async fn watch(&self, ctx: &OperandContext) -> Result<WatchHandle, EngineError> {
        let selector = labels::identity_selector(ctx);
        let mut kinds: Vec<ObjectKind> = Vec::new();
        for e in steward_catalogue::entries(ctx) {
            if !kinds.contains(&e.object.kind) {
                kinds.push(e.object.kind);
            }
        }

        let (tx, rx) = mpsc::channel(queue_cap());
        let mut children: Vec<steward_store::CancelHandle> = Vec::new();
        let mut forwards: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        for kind in kinds {
            let ns = kind.namespaced().then(|| ctx.namespace.clone());
            let mut handle = match self.store.watch(kind, ns.as_deref(), Some(&selector)).await {
                Ok(h) => h,
                Err(e) => {
                    for c in children {
                        c.cancel();
                    }
                    for f in forwards {
                        f.abort();
                    }
                    return Err(e.into());
                }
            };
            children.push(handle.cancel);
            let tx = tx.clone();
            forwards.push(tokio::spawn(async move {
                while let Some(ev) = handle.rx.recv().await {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = cancel_rx.await;
            for c in children {
                c.cancel();
            }
            for f in forwards {
                f.abort();
            }
        });
        info!(operand = %ctx.name, "watch wired");
        Ok(WatchHandle { rx, cancel: WatchCancel { tx: Some(cancel_tx) } })
    }
}

fn outcome(obj: &ManagedObjectRef, outcome: ReconcileOutcome, message: Option<String>) -> OutcomeEntry {
    OutcomeEntry { object: obj.clone(), outcome, message }
}
