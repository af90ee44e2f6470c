//! The node-labeller operand: a daemon that inspects node CPU features and
//! stamps them back as node labels. Owns six objects: RBAC pair, service
//! account, security policy, plugin config, and the daemon workload.

use serde_json::{json, Value};

use steward_core::{labels, ManagedObjectRef, ObjectKind, OperandContext};

use crate::DesiredEntry;

pub const CLUSTER_ROLE_NAME: &str = "node-labeller";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "node-labeller";
pub const SERVICE_ACCOUNT_NAME: &str = "node-labeller";
pub const SECURITY_CONTEXT_CONSTRAINTS_NAME: &str = "node-labeller";
pub const CONFIG_MAP_NAME: &str = "node-labeller-config";
pub const DAEMON_SET_NAME: &str = "node-labeller";

/// Key under which the plugin configuration is stored in the config map.
pub const CONFIG_MAP_KEY: &str = "cpu-plugin-configmap.yaml";

fn labeller_image() -> String {
    std::env::var("STEWARD_NODE_LABELLER_IMAGE")
        .unwrap_or_else(|_| "quay.io/steward/node-labeller:latest".to_string())
}

fn metadata(ctx: &OperandContext, name: &str, namespaced: bool) -> Value {
    let mut meta = json!({
        "name": name,
        "labels": labels::labels(ctx),
    });
    if namespaced {
        meta["namespace"] = json!(ctx.namespace);
        // Owner back-link for the cluster's cascade delete. Cluster-scoped
        // objects cannot reference a namespaced owner, so they rely on the
        // identity labels alone.
        if let Some(owner) = &ctx.owner {
            meta["ownerReferences"] = json!([{
                "apiVersion": owner.api_version,
                "kind": owner.kind,
                "name": owner.name,
                "uid": owner.uid,
                "controller": true,
                "blockOwnerDeletion": true,
            }]);
        }
    }
    meta
}

fn cluster_role(ctx: &OperandContext) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": metadata(ctx, CLUSTER_ROLE_NAME, false),
        "rules": [{
            "apiGroups": [""],
            "resources": ["nodes"],
            "verbs": ["get", "list", "watch", "patch"],
        }],
    })
}

fn cluster_role_binding(ctx: &OperandContext) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": metadata(ctx, CLUSTER_ROLE_BINDING_NAME, false),
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": CLUSTER_ROLE_NAME,
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": SERVICE_ACCOUNT_NAME,
            "namespace": ctx.namespace,
        }],
    })
}

fn service_account(ctx: &OperandContext) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": metadata(ctx, SERVICE_ACCOUNT_NAME, true),
    })
}

fn security_context_constraints(ctx: &OperandContext) -> Value {
    json!({
        "apiVersion": "security.openshift.io/v1",
        "kind": "SecurityContextConstraints",
        "metadata": metadata(ctx, SECURITY_CONTEXT_CONSTRAINTS_NAME, false),
        "allowPrivilegedContainer": true,
        "runAsUser": { "type": "RunAsAny" },
        "seLinuxContext": { "type": "RunAsAny" },
        "users": [
            format!("system:serviceaccount:{}:{}", ctx.namespace, SERVICE_ACCOUNT_NAME),
        ],
    })
}

fn config_map(ctx: &OperandContext) -> Value {
    // Obsolete CPU models and the oldest usable baseline for labelling.
    let plugin_config = "obsoleteCPUs:\n  - 486\n  - pentium\n  - pentium2\n  - pentium3\n  - pentiumpro\nminCPU: Penryn\n";
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(ctx, CONFIG_MAP_NAME, true),
        "data": { (CONFIG_MAP_KEY): plugin_config },
    })
}

fn daemon_set(ctx: &OperandContext) -> Value {
    // Identity labels only: the template sits inside the authoritative spec,
    // so the per-release version key would read as drift on every upgrade.
    let pod_labels = labels::identity_labels(ctx);
    json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": metadata(ctx, DAEMON_SET_NAME, true),
        "spec": {
            "selector": {
                "matchLabels": { (labels::K8S_NAME): ctx.name }
            },
            "template": {
                "metadata": { "labels": pod_labels },
                "spec": {
                    "serviceAccountName": SERVICE_ACCOUNT_NAME,
                    "containers": [{
                        "name": "node-labeller",
                        "image": labeller_image(),
                        "args": ["--config", format!("/config/{}", CONFIG_MAP_KEY)],
                        "securityContext": { "privileged": true },
                        "volumeMounts": [{
                            "name": "config",
                            "mountPath": "/config",
                            "readOnly": true,
                        }],
                    }],
                    "volumes": [{
                        "name": "config",
                        "configMap": { "name": CONFIG_MAP_NAME },
                    }],
                    "tolerations": [{
                        "key": "CriticalAddonsOnly",
                        "operator": "Exists",
                    }],
                },
            },
        },
    })
}

pub fn entries(ctx: &OperandContext) -> Vec<DesiredEntry> {
    vec![
        DesiredEntry {
            object: ManagedObjectRef::cluster(ObjectKind::ClusterRole, CLUSTER_ROLE_NAME),
            body: cluster_role(ctx),
        },
        DesiredEntry {
            object: ManagedObjectRef::cluster(
                ObjectKind::ClusterRoleBinding,
                CLUSTER_ROLE_BINDING_NAME,
            ),
            body: cluster_role_binding(ctx),
        },
        DesiredEntry {
            object: ManagedObjectRef::namespaced(
                ObjectKind::ServiceAccount,
                ctx.namespace.clone(),
                SERVICE_ACCOUNT_NAME,
            ),
            body: service_account(ctx),
        },
        DesiredEntry {
            object: ManagedObjectRef::cluster(
                ObjectKind::SecurityContextConstraints,
                SECURITY_CONTEXT_CONSTRAINTS_NAME,
            ),
            body: security_context_constraints(ctx),
        },
        DesiredEntry {
            object: ManagedObjectRef::namespaced(
                ObjectKind::ConfigMap,
                ctx.namespace.clone(),
                CONFIG_MAP_NAME,
            ),
            body: config_map(ctx),
        },
        DesiredEntry {
            object: ManagedObjectRef::namespaced(
                ObjectKind::DaemonSet,
                ctx.namespace.clone(),
                DAEMON_SET_NAME,
            ),
            body: daemon_set(ctx),
        },
    ]
}
