//! Generic commit of reconciler results
//!
//! Reconcilers mutate an owned copy of the object they process; [`commit`]
//! diffs it against the original and issues at most one merge patch for
//! metadata+spec and one for status. An unchanged object produces no writes,
//! which is what makes reconciliation idempotent at the storage layer.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::clients::Patcher;
use crate::cluster::LogicalClusterName;
use crate::error::Result;

/// The diffable dimensions of a resource.
pub struct Resource<'a, Sp, St> {
    pub meta: &'a ObjectMeta,
    pub spec: &'a Sp,
    pub status: &'a St,
}

/// Diffs `old` against `new` and patches what changed.
///
/// Only annotations and finalizers are committed from metadata; everything
/// else on `ObjectMeta` is server-owned.
pub async fn commit<Sp, St>(
    patcher: &dyn Patcher,
    cluster: &LogicalClusterName,
    name: &str,
    old: &Resource<'_, Sp, St>,
    new: &Resource<'_, Sp, St>,
) -> Result<()>
where
    Sp: Serialize + PartialEq,
    St: Serialize + PartialEq,
{
    let mut patch = Map::new();

    let old_meta = committable_meta(old.meta);
    let new_meta = committable_meta(new.meta);
    if let Some(diff) = merge_patch_diff(&old_meta, &new_meta) {
        patch.insert("metadata".to_string(), diff);
    }

    if old.spec != new.spec {
        if let Some(diff) = merge_patch_diff(
            &serde_json::to_value(old.spec)?,
            &serde_json::to_value(new.spec)?,
        ) {
            patch.insert("spec".to_string(), diff);
        }
    }

    if !patch.is_empty() {
        let patch = Value::Object(patch);
        debug!(cluster = %cluster, name, %patch, "patching resource");
        patcher.patch(cluster, name, patch).await?;
    }

    if old.status != new.status {
        if let Some(diff) = merge_patch_diff(
            &serde_json::to_value(old.status)?,
            &serde_json::to_value(new.status)?,
        ) {
            let patch = json!({ "status": diff });
            debug!(cluster = %cluster, name, %patch, "patching resource status");
            patcher.patch_status(cluster, name, patch).await?;
        }
    }

    Ok(())
}

fn committable_meta(meta: &ObjectMeta) -> Value {
    json!({
        "annotations": meta.annotations.clone().unwrap_or_default(),
        "finalizers": meta.finalizers.clone().unwrap_or_default(),
    })
}

/// Computes the RFC 7386 merge patch that turns `old` into `new`. `None`
/// when the values are equal. Keys present in `old` but not in `new` map to
/// `null`; arrays and scalars are replaced wholesale.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, old_value) in old_map {
                match new_map.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(diff) = merge_patch_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// Applies an RFC 7386 merge patch in place.
pub fn apply_merge_patch(doc: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *doc = patch.clone();
        return;
    };
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    if let Value::Object(doc_map) = doc {
        for (key, patch_value) in patch_map {
            if patch_value.is_null() {
                doc_map.remove(key);
            } else if patch_value.is_object() {
                let entry = doc_map.entry(key.clone()).or_insert(Value::Null);
                apply_merge_patch(entry, patch_value);
            } else {
                doc_map.insert(key.clone(), patch_value.clone());
            }
        }
    }
}
