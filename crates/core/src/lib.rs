//! Steward core types: the closed kind set, managed object references,
//! per-pass outcomes, and the operand context handed to catalogue builders.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod labels;

/// The closed set of object kinds the engine owns. Dispatch over kinds is an
/// exhaustive match, never discovery or reflection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ClusterRole,
    ClusterRoleBinding,
    ServiceAccount,
    SecurityContextConstraints,
    ConfigMap,
    DaemonSet,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::ClusterRole,
        ObjectKind::ClusterRoleBinding,
        ObjectKind::ServiceAccount,
        ObjectKind::SecurityContextConstraints,
        ObjectKind::ConfigMap,
        ObjectKind::DaemonSet,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding => {
                "rbac.authorization.k8s.io"
            }
            ObjectKind::SecurityContextConstraints => "security.openshift.io",
            ObjectKind::ServiceAccount | ObjectKind::ConfigMap => "",
            ObjectKind::DaemonSet => "apps",
        }
    }

    pub fn version(&self) -> &'static str {
        "v1"
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() {
            self.version().to_string()
        } else {
            format!("{}/{}", self.group(), self.version())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKind::ClusterRole => "ClusterRole",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::SecurityContextConstraints => "SecurityContextConstraints",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ObjectKind::ClusterRole => "clusterroles",
            ObjectKind::ClusterRoleBinding => "clusterrolebindings",
            ObjectKind::ServiceAccount => "serviceaccounts",
            ObjectKind::SecurityContextConstraints => "securitycontextconstraints",
            ObjectKind::ConfigMap => "configmaps",
            ObjectKind::DaemonSet => "daemonsets",
        }
    }

    pub fn namespaced(&self) -> bool {
        matches!(
            self,
            ObjectKind::ServiceAccount | ObjectKind::ConfigMap | ObjectKind::DaemonSet
        )
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Identity of one object the engine owns. Namespace is `None` for
/// cluster-scoped kinds. Declared by the catalogue, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ManagedObjectRef {
    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }

    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }
}

impl std::fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Which engine operation failed for an `Error` outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Fetch,
    Create,
    Update,
    UpdateConflict,
}

/// Result of reconciling one managed object within a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Created,
    Updated,
    ConflictForeignOwner,
    Error(ErrorKind),
}

impl ReconcileOutcome {
    /// Healthy outcomes converge or already were converged.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Unchanged | ReconcileOutcome::Created | ReconcileOutcome::Updated
        )
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileOutcome::Unchanged => f.write_str("unchanged"),
            ReconcileOutcome::Created => f.write_str("created"),
            ReconcileOutcome::Updated => f.write_str("updated"),
            ReconcileOutcome::ConflictForeignOwner => f.write_str("conflict-foreign-owner"),
            ReconcileOutcome::Error(ErrorKind::Fetch) => f.write_str("error-fetch"),
            ReconcileOutcome::Error(ErrorKind::Create) => f.write_str("error-create"),
            ReconcileOutcome::Error(ErrorKind::Update) => f.write_str("error-update"),
            ReconcileOutcome::Error(ErrorKind::UpdateConflict) => f.write_str("update-conflict"),
        }
    }
}

/// One line of a pass report: which object, what happened, optional detail
/// (underlying store error text, foreign label diagnostics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub object: ManagedObjectRef,
    pub outcome: ReconcileOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything one reconcile pass produced. Built per pass, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub operand: String,
    pub outcomes: Vec<OutcomeEntry>,
}

impl PassReport {
    /// A pass is healthy only when every entry converged.
    pub fn healthy(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_healthy())
    }
}

/// Back-link to the parent operator resource, consumed by the cluster's own
/// cascade-delete mechanism. Attached at creation time only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerLink {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Install-specific context for one operand. Built by the caller (CLI,
/// manager loop) and passed into every pass; desired bodies are derived from
/// it fresh each time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperandContext {
    /// Operand name, e.g. "node-labeller". Also the identity `name` label.
    pub name: String,
    /// Namespace for the namespace-scoped catalogue entries.
    pub namespace: String,
    /// Identity `component` label value.
    pub component: String,
    /// Identity `part-of` label value (the logical application group).
    #[serde(default = "default_part_of")]
    pub part_of: String,
    /// Release version. Stamped as a label but excluded from identity and
    /// drift checks.
    pub version: String,
    /// Parent resource for owner references, when running under an operator.
    #[serde(default)]
    pub owner: Option<OwnerLink>,
}

fn default_part_of() -> String {
    "steward".to_string()
}

/// Change notification emitted by store watches; consumed by the run loop to
/// schedule the next pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
    pub change: ChangeKind,
}
