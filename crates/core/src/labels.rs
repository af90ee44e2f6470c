//! Canonical identity labels for managed objects.
//!
//! Uses the Kubernetes well-known `app.kubernetes.io/*` keys. The identity
//! subset (name/component/part-of/managed-by) must stay stable across
//! releases so ownership checks survive upgrades; the version key changes per
//! release and is deliberately outside the identity subset.

use std::collections::BTreeMap;

use crate::OperandContext;

/// Standard label for the name of the application.
pub const K8S_NAME: &str = "app.kubernetes.io/name";

/// Standard label for the component within the architecture.
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard label for the higher-level application this object is part of.
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Standard label for the tool managing this object.
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the current release version. Not identity.
pub const K8S_VERSION: &str = "app.kubernetes.io/version";

/// Value for `app.kubernetes.io/managed-by` on everything this engine owns.
pub const MANAGED_BY: &str = "steward-operator";

/// The identity keys checked by `owned_by_us`. Order matters only for
/// deterministic selector rendering.
pub const IDENTITY_KEYS: [&str; 4] = [K8S_NAME, K8S_COMPONENT, K8S_PART_OF, K8S_MANAGED_BY];

/// Full canonical label set stamped on every object the engine creates.
/// Pure and deterministic.
pub fn labels(ctx: &OperandContext) -> BTreeMap<String, String> {
    let mut out = identity_labels(ctx);
    out.insert(K8S_VERSION.to_string(), ctx.version.clone());
    out
}

/// The identity subset: everything except the per-release version key.
pub fn identity_labels(ctx: &OperandContext) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(K8S_NAME.to_string(), ctx.name.clone());
    out.insert(K8S_COMPONENT.to_string(), ctx.component.clone());
    out.insert(K8S_PART_OF.to_string(), ctx.part_of.clone());
    out.insert(K8S_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    out
}

/// Ownership check: every identity key must be present with exactly the
/// expected value. Foreign-added extra labels do not disqualify an object;
/// a missing or differing identity value does.
pub fn owned_by_us(live_labels: &serde_json::Value, ctx: &OperandContext) -> bool {
    let expected = identity_labels(ctx);
    let live = match live_labels.as_object() {
        Some(m) => m,
        None => return false,
    };
    expected
        .iter()
        .all(|(k, v)| live.get(k).and_then(|x| x.as_str()) == Some(v.as_str()))
}

/// Label selector string for the identity subset, `key=value` joined by
/// commas, suitable for list/watch filtering.
pub fn identity_selector(ctx: &OperandContext) -> String {
    identity_labels(ctx)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> OperandContext {
        OperandContext {
            name: "node-labeller".into(),
            namespace: "kubevirt".into(),
            component: "schedule".into(),
            part_of: "steward".into(),
            version: "v0.3.0".into(),
            owner: None,
        }
    }

    #[test]
    fn full_set_is_identity_plus_version() {
        let c = ctx();
        let full = labels(&c);
        let identity = identity_labels(&c);
        assert_eq!(full.len(), identity.len() + 1);
        for (k, v) in identity.iter() {
            assert_eq!(full.get(k), Some(v));
        }
        assert_eq!(full.get(K8S_VERSION).map(String::as_str), Some("v0.3.0"));
    }

    #[test]
    fn ownership_tolerates_foreign_extra_labels() {
        let c = ctx();
        let mut live = serde_json::Map::new();
        for (k, v) in identity_labels(&c) {
            live.insert(k, serde_json::Value::String(v));
        }
        live.insert("acme.io/team".into(), serde_json::Value::String("dns".into()));
        assert!(owned_by_us(&serde_json::Value::Object(live), &c));
    }

    #[test]
    fn ownership_rejects_missing_or_differing_identity_value() {
        let c = ctx();
        let mut live = serde_json::Map::new();
        for (k, v) in identity_labels(&c) {
            live.insert(k, serde_json::Value::String(v));
        }
        let mut wrong = live.clone();
        wrong.insert(K8S_MANAGED_BY.into(), serde_json::Value::String("helm".into()));
        assert!(!owned_by_us(&serde_json::Value::Object(wrong), &c));

        let mut missing = live.clone();
        missing.remove(K8S_COMPONENT);
        assert!(!owned_by_us(&serde_json::Value::Object(missing), &c));
    }

    #[test]
    fn version_skew_does_not_break_identity() {
        let mut newer = ctx();
        newer.version = "v0.4.0".into();
        let mut live = serde_json::Map::new();
        for (k, v) in labels(&ctx()) {
            live.insert(k, serde_json::Value::String(v));
        }
        assert!(owned_by_us(&serde_json::Value::Object(live), &newer));
    }

    #[test]
    fn selector_renders_all_identity_keys() {
        let s = identity_selector(&ctx());
        for k in IDENTITY_KEYS {
            assert!(s.contains(k), "selector missing {}", k);
        }
        assert!(!s.contains(K8S_VERSION));
    }
}
