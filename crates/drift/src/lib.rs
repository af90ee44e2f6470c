//! Steward drift detection.
//!
//! Compares only the fields the engine is authoritative for (the per-kind
//! table in the catalogue), never the whole object: store-assigned metadata,
//! status, and foreign-added annotations must not trigger updates. The same
//! projection feeds the merge-patch body, so an update can only ever touch
//! fields the engine owns.

#![forbid(unsafe_code)]

use serde_json::{json, Map, Value};

use steward_catalogue::authoritative_paths;
use steward_core::ObjectKind;

/// Extract the authoritative subset of an object for its kind. Paths absent
/// from the object are simply not represented.
pub fn project(kind: ObjectKind, body: &Value) -> Value {
    let mut out = Map::new();
    for path in authoritative_paths(kind) {
        if let Some(v) = body.get(*path) {
            out.insert((*path).to_string(), v.clone());
        }
    }
    Value::Object(out)
}

/// True when the live object's authoritative fields diverge from desired.
/// Absence of the live object is not drift; that is the recreation policy's
/// concern and is handled before this is consulted.
pub fn is_drifted(kind: ObjectKind, live: &Value, desired: &Value) -> bool {
    project(kind, live) != project(kind, desired)
}

/// Merge-patch body turning the live authoritative fields into the desired
/// ones, carrying the live resourceVersion as the optimistic-concurrency
/// token. Keys a foreign writer added inside an authoritative field are
/// removed with explicit RFC 7386 nulls; a plain re-send of the desired
/// subtree would silently keep them. Never a full-object overwrite.
pub fn patch_body(kind: ObjectKind, live: &Value, desired: &Value, resource_version: &str) -> Value {
    let mut patch = diff_merge(&project(kind, live), &project(kind, desired));
    patch["metadata"] = json!({ "resourceVersion": resource_version });
    patch
}

/// RFC 7386 patch converting `live` into `desired`: live-only keys map to
/// null, changed keys recurse, equal keys are left out. Non-object values
/// (arrays included) replace wholesale.
fn diff_merge(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => {
            let mut out = Map::new();
            for (k, lv) in l {
                match d.get(k) {
                    None => {
                        out.insert(k.clone(), Value::Null);
                    }
                    Some(dv) if dv != lv => {
                        out.insert(k.clone(), diff_merge(lv, dv));
                    }
                    Some(_) => {}
                }
            }
            for (k, dv) in d {
                if !l.contains_key(k) {
                    out.insert(k.clone(), dv.clone());
                }
            }
            Value::Object(out)
        }
        (_, d) => d.clone(),
    }
}
