//! Steward catalogue: the fixed, enumerable set of objects each operand owns,
//! plus the per-kind table of authoritative fields.
//!
//! Builders produce full k8s JSON bodies carrying the canonical label set and
//! (for namespaced objects) the owner back-reference. Bodies are built fresh
//! on every pass; nothing here caches.

#![forbid(unsafe_code)]

use serde_json::Value;

use steward_core::{ManagedObjectRef, ObjectKind, OperandContext};

pub mod node_labeller;

/// One catalogue entry: the identity slot and the desired body for it.
#[derive(Debug, Clone)]
pub struct DesiredEntry {
    pub object: ManagedObjectRef,
    pub body: Value,
}

/// Top-level fields the engine is authoritative for, per kind. Explicit
/// configuration, not inferred from the object schema: the boundary between
/// owned and foreign fields cannot be derived mechanically. An empty slice
/// means recreate-on-delete only; the kind never yields `Updated`.
pub fn authoritative_paths(kind: ObjectKind) -> &'static [&'static str] {
    match kind {
        ObjectKind::ClusterRole => &["rules"],
        ObjectKind::ClusterRoleBinding => &["subjects", "roleRef"],
        ObjectKind::ServiceAccount => &[],
        ObjectKind::SecurityContextConstraints => {
            &["users", "allowPrivilegedContainer", "runAsUser", "seLinuxContext"]
        }
        ObjectKind::ConfigMap => &["data"],
        ObjectKind::DaemonSet => &["spec"],
    }
}

/// Desired entries for an operand. Order is presentation only; the loop
/// treats entries independently. Invariant: no two entries share a
/// `ManagedObjectRef`.
pub fn entries(ctx: &OperandContext) -> Vec<DesiredEntry> {
    node_labeller::entries(ctx)
}
