//! ApiExportEndpointSlice controller
//!
//! Keeps each slice's status URL list equal to the set of shard virtual
//! workspace endpoints at which the referenced export is served. The list is
//! sorted and duplicate-free so consumers can diff it stably.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::api::endpoint_slice::{ApiExportEndpoint, ApiExportEndpointSlice};
use crate::api::export::ApiExport;
use crate::api::shard::Shard;
use crate::cache::{split_cluster_aware_key, to_cluster_aware_key, ClusterStore, Event, StoreObject};
use crate::clients::Patcher;
use crate::cluster::{path_annotation_from, LogicalClusterName, LogicalClusterPath};
use crate::error::Result;
use crate::indexers;
use crate::queue::WorkQueue;

use super::committer::{self, Resource};
use super::conditions::{
    mark_false, mark_true, API_EXPORT_ENDPOINT_SLICE_URLS_READY, API_EXPORT_VALID,
    REASON_API_EXPORT_NOT_FOUND, REASON_ERROR_GENERATING_URLS, REASON_INTERNAL_ERROR,
};

pub const CONTROLLER_NAME: &str = "apimesh-apiexportendpointslice";

/// Path components under which the virtual workspace server exposes exports:
/// `{base}/services/apiexport/{cluster}/{export}`.
const ROOT_PATH_PREFIX: &str = "services";
const VIRTUAL_WORKSPACE_NAME: &str = "apiexport";

pub struct ApiExportEndpointSliceController {
    queue: Arc<WorkQueue>,

    slices: Arc<ClusterStore<ApiExportEndpointSlice>>,
    exports: Arc<ClusterStore<ApiExport>>,
    global_exports: Arc<ClusterStore<ApiExport>>,
    shards: Arc<ClusterStore<Shard>>,

    slice_patcher: Arc<dyn Patcher>,
}

impl ApiExportEndpointSliceController {
    pub fn new(
        slices: Arc<ClusterStore<ApiExportEndpointSlice>>,
        exports: Arc<ClusterStore<ApiExport>>,
        global_exports: Arc<ClusterStore<ApiExport>>,
        shards: Arc<ClusterStore<Shard>>,
        slice_patcher: Arc<dyn Patcher>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(CONTROLLER_NAME);

        slices.add_indexer(
            indexers::ENDPOINT_SLICES_BY_API_EXPORT,
            Box::new(indexers::index_endpoint_slice_by_api_export),
        );
        for store in [&exports, &global_exports] {
            store.add_indexer(
                indexers::BY_LOGICAL_CLUSTER_PATH_AND_NAME,
                Box::new(indexers::index_by_logical_cluster_path_and_name),
            );
        }

        {
            let queue = Arc::clone(&queue);
            slices.add_event_handler(Box::new(move |event: &Event<ApiExportEndpointSlice>| {
                enqueue_slice(&queue, event.object(), "");
            }));
        }
        for store in [&exports, &global_exports] {
            let queue = Arc::clone(&queue);
            let slices = Arc::clone(&slices);
            store.add_event_handler(Box::new(move |event: &Event<ApiExport>| {
                enqueue_slices_for_export(&queue, &slices, event.object());
            }));
        }
        {
            // Any shard change can add or remove endpoints on every slice.
            let queue = Arc::clone(&queue);
            let slices = Arc::clone(&slices);
            shards.add_event_handler(Box::new(move |_event: &Event<Shard>| {
                for slice in slices.list() {
                    enqueue_slice(&queue, &slice, " because of Shard");
                }
            }));
        }

        Arc::new(ApiExportEndpointSliceController {
            queue,
            slices,
            exports,
            global_exports,
            shards,
            slice_patcher,
        })
    }

    /// Runs `workers` worker loops until `shutdown` is cancelled, then drains
    /// and waits for them.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken, workers: usize) {
        info!(controller = CONTROLLER_NAME, workers, "starting controller");
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move { controller.worker().await }));
        }

        shutdown.cancelled().await;
        self.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = CONTROLLER_NAME, "controller shut down");
    }

    async fn worker(&self) {
        while let Some(key) = self.queue.get().await {
            self.process_next(&key).await;
            self.queue.done(&key);
        }
    }

    async fn process_next(&self, key: &str) {
        match AssertUnwindSafe(self.process(key)).catch_unwind().await {
            Ok(Ok(())) => self.queue.forget(key),
            Ok(Err(err)) => {
                error!(controller = CONTROLLER_NAME, key, error = %err, "failed to sync");
                self.queue.add_rate_limited(key);
            }
            Err(_) => {
                error!(controller = CONTROLLER_NAME, key, "panic while processing key");
                self.queue.add_rate_limited(key);
            }
        }
    }

    #[instrument(name = "reconcile", skip(self), fields(controller = CONTROLLER_NAME))]
    async fn process(&self, key: &str) -> Result<()> {
        let (cluster, name) = match split_cluster_aware_key(key) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "dropping malformed key");
                return Ok(());
            }
        };

        let slice = match self.slices.get(&cluster, &name) {
            Ok(slice) => slice,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let old = slice.as_ref();
        let mut updated = old.clone();

        // Scoped so the borrowing closures are gone before the commit await.
        let result = {
            let reconciler = EndpointsReconciler {
                list_shards: &|| Ok(self.shards.list()),
                get_api_export: &|path, name| {
                    super::resolve_api_export(&self.exports, &self.global_exports, path, name)
                },
            };
            reconciler.reconcile(&mut updated)
        };

        let commit_result = committer::commit(
            self.slice_patcher.as_ref(),
            &cluster,
            &name,
            &Resource {
                meta: &old.metadata,
                spec: &old.spec,
                status: &old.status,
            },
            &Resource {
                meta: &updated.metadata,
                spec: &updated.spec,
                status: &updated.status,
            },
        )
        .await;

        match (result, commit_result) {
            (Ok(()), commit_result) => commit_result,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(commit_err)) => {
                error!(error = %commit_err, "failed to commit reconcile result");
                Err(err)
            }
        }
    }
}

/// The endpoint computation, separated from the controller plumbing so it can
/// be driven with plain closures.
struct EndpointsReconciler<'a> {
    list_shards: &'a dyn Fn() -> Result<Vec<Arc<Shard>>>,
    get_api_export: &'a dyn Fn(&LogicalClusterPath, &str) -> Result<Arc<ApiExport>>,
}

impl EndpointsReconciler<'_> {
    fn reconcile(&self, slice: &mut ApiExportEndpointSlice) -> Result<()> {
        let export_ref = slice.spec.api_export.clone();
        let path = if export_ref.path.is_empty() {
            slice.logical_cluster().path()
        } else {
            export_ref.path.clone()
        };

        let export = match (self.get_api_export)(&path, &export_ref.name) {
            Ok(export) => export,
            Err(err) if err.is_not_found() => {
                // Don't keep endpoints for an export that no longer exists.
                slice.status.api_export_endpoints.clear();
                mark_false(
                    &mut slice.status.conditions,
                    API_EXPORT_VALID,
                    REASON_API_EXPORT_NOT_FOUND,
                    &format!("APIExport {} not found", path.join(&export_ref.name)),
                );
                return Ok(());
            }
            Err(err) => {
                mark_false(
                    &mut slice.status.conditions,
                    API_EXPORT_VALID,
                    REASON_INTERNAL_ERROR,
                    &format!("error getting APIExport {}", path.join(&export_ref.name)),
                );
                return Err(err);
            }
        };
        mark_true(&mut slice.status.conditions, API_EXPORT_VALID);

        if let Err(err) = self.update_endpoints(slice, &export) {
            mark_false(
                &mut slice.status.conditions,
                API_EXPORT_ENDPOINT_SLICE_URLS_READY,
                REASON_ERROR_GENERATING_URLS,
                &err.to_string(),
            );
            return Err(err);
        }
        mark_true(
            &mut slice.status.conditions,
            API_EXPORT_ENDPOINT_SLICE_URLS_READY,
        );

        Ok(())
    }

    fn update_endpoints(
        &self,
        slice: &mut ApiExportEndpointSlice,
        export: &ApiExport,
    ) -> Result<()> {
        let shards = (self.list_shards)()?;

        let mut desired = BTreeSet::new();
        for shard in shards {
            if shard.spec.virtual_workspace_url.is_empty() {
                continue;
            }
            match endpoint_url(
                &shard.spec.virtual_workspace_url,
                &export.logical_cluster(),
                export.name(),
            ) {
                Ok(url) => {
                    desired.insert(url);
                }
                Err(err) => {
                    // Should never happen; shard URLs are validated upstream.
                    error!(
                        shard = shard.name(),
                        url = %shard.spec.virtual_workspace_url,
                        error = %err,
                        "error parsing shard virtual workspace URL"
                    );
                    continue;
                }
            }
        }

        slice.status.api_export_endpoints = desired
            .into_iter()
            .map(|url| ApiExportEndpoint { url })
            .collect();

        Ok(())
    }
}

fn endpoint_url(
    base: &str,
    cluster: &LogicalClusterName,
    export_name: &str,
) -> std::result::Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    let path = format!(
        "{}/{ROOT_PATH_PREFIX}/{VIRTUAL_WORKSPACE_NAME}/{cluster}/{export_name}",
        url.path().trim_end_matches('/'),
    );
    url.set_path(&path);
    Ok(url.to_string())
}

fn enqueue_slice(queue: &WorkQueue, slice: &ApiExportEndpointSlice, because: &str) {
    let key = to_cluster_aware_key(&slice.logical_cluster(), slice.name());
    debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiExportEndpointSlice{because}");
    queue.add(key);
}

fn enqueue_slices_for_export(
    queue: &WorkQueue,
    slices: &ClusterStore<ApiExportEndpointSlice>,
    export: &ApiExport,
) {
    let mut keys = BTreeSet::new();
    let path = path_annotation_from(export.metadata());
    if !path.is_empty() {
        match slices.index_keys(
            indexers::ENDPOINT_SLICES_BY_API_EXPORT,
            path.join(export.name()).as_str(),
        ) {
            Ok(path_keys) => keys.extend(path_keys),
            Err(err) => {
                warn!(error = %err, "failed to look up endpoint slices by export path");
                return;
            }
        }
    }
    match slices.index_keys(
        indexers::ENDPOINT_SLICES_BY_API_EXPORT,
        export.logical_cluster().path().join(export.name()).as_str(),
    ) {
        Ok(cluster_keys) => keys.extend(cluster_keys),
        Err(err) => {
            warn!(error = %err, "failed to look up endpoint slices by export cluster");
            return;
        }
    }

    for key in keys {
        debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiExportEndpointSlice because of ApiExport");
        queue.add(key);
    }
}
