//! Reconcilers for the API binding subsystem
//!
//! Three controllers cooperate here: the binding controller materializes
//! exported schemas as bound resource definitions and drives binding status,
//! the endpoint slice controller computes the virtual workspace URLs an
//! export is reachable at, and the annotation sync controller propagates a
//! designated annotation prefix from exports to their bindings.
//!
//! Every controller owns a work queue fed by cache event handlers and drains
//! it with a configurable number of workers; all writes go through the
//! committer or a patch client, never through the caches.

pub mod annotation_sync;
pub mod binding;
pub mod committer;
pub mod conditions;
pub mod endpoint_slice;

mod binding_reconcile;

#[cfg(test)]
mod binding_test;

pub use binding_reconcile::bound_crd_name;

use std::sync::Arc;

use crate::api::export::ApiExport;
use crate::cache::{ClusterStore, StoreObject};
use crate::cluster::LogicalClusterPath;
use crate::error::{Error, Result};
use crate::indexers;

/// Looks up an export by `path:name`, trying the local cache first and the
/// cross-shard global cache on a miss. Callers never see which tier answered.
pub(crate) fn resolve_api_export(
    local: &ClusterStore<ApiExport>,
    global: &ClusterStore<ApiExport>,
    path: &LogicalClusterPath,
    name: &str,
) -> Result<Arc<ApiExport>> {
    match export_by_path_and_name(local, path, name) {
        Err(err) if err.is_not_found() => export_by_path_and_name(global, path, name),
        other => other,
    }
}

fn export_by_path_and_name(
    store: &ClusterStore<ApiExport>,
    path: &LogicalClusterPath,
    name: &str,
) -> Result<Arc<ApiExport>> {
    let found = store.by_index(
        indexers::BY_LOGICAL_CLUSTER_PATH_AND_NAME,
        path.join(name).as_str(),
    )?;
    found
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(ApiExport::KIND, path.join(name).to_string()))
}
