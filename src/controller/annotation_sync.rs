//! Extra-annotation propagation from exports to bindings
//!
//! Annotations under [`ANNOTATION_EXTRA_KEY_PREFIX`] on an export are
//! mirrored onto every binding that references it: added and changed keys
//! are copied, keys absent on the export are removed. Propagation is one-way
//! only; nothing flows from bindings back to exports, and annotations
//! outside the prefix are never touched.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::api::binding::ApiBinding;
use crate::api::export::ApiExport;
use crate::api::ANNOTATION_EXTRA_KEY_PREFIX;
use crate::cache::{split_cluster_aware_key, to_cluster_aware_key, ClusterStore, Event, StoreObject};
use crate::clients::Patcher;
use crate::cluster::path_annotation_from;
use crate::error::Result;
use crate::indexers;
use crate::queue::WorkQueue;

pub const CONTROLLER_NAME: &str = "apimesh-extra-annotation-sync";

pub struct AnnotationSyncController {
    queue: Arc<WorkQueue>,

    exports: Arc<ClusterStore<ApiExport>>,
    bindings: Arc<ClusterStore<ApiBinding>>,

    binding_patcher: Arc<dyn Patcher>,
}

impl AnnotationSyncController {
    pub fn new(
        exports: Arc<ClusterStore<ApiExport>>,
        bindings: Arc<ClusterStore<ApiBinding>>,
        binding_patcher: Arc<dyn Patcher>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(CONTROLLER_NAME);

        exports.add_indexer(
            indexers::BY_LOGICAL_CLUSTER_PATH_AND_NAME,
            Box::new(indexers::index_by_logical_cluster_path_and_name),
        );
        bindings.add_indexer(
            indexers::APIBINDINGS_BY_API_EXPORT,
            Box::new(indexers::index_binding_by_api_export),
        );

        {
            let queue = Arc::clone(&queue);
            bindings.add_event_handler(Box::new(move |event: &Event<ApiBinding>| {
                if matches!(event, Event::Deleted { .. }) {
                    return;
                }
                enqueue_binding(&queue, event.object(), "");
            }));
        }
        {
            let queue = Arc::clone(&queue);
            let bindings = Arc::clone(&bindings);
            exports.add_event_handler(Box::new(move |event: &Event<ApiExport>| {
                if matches!(event, Event::Deleted { .. }) {
                    return;
                }
                enqueue_bindings_for_export(&queue, &bindings, event.object());
            }));
        }

        Arc::new(AnnotationSyncController {
            queue,
            exports,
            bindings,
            binding_patcher,
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

        let binding = match self.bindings.get(&cluster, &name) {
            Ok(binding) => binding,
            // Deleted before we got to it.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let Some(export_ref) = binding.spec.reference.export.clone() else {
            return Ok(());
        };
        let path = if export_ref.path.is_empty() {
            cluster.path()
        } else {
            export_ref.path.clone()
        };
        let export = match super::export_by_path_and_name(&self.exports, &path, &export_ref.name) {
            Ok(export) => export,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        let Some(patch) = sync_extra_annotation_patch(
            &export.metadata.annotations,
            &binding.metadata.annotations,
        ) else {
            return Ok(());
        };

        debug!(binding = %key, %patch, "patching binding extra annotations");
        self.binding_patcher.patch(&cluster, &name, patch).await
    }
}

/// Computes the merge patch that makes the binding's prefix annotations equal
/// to the export's. `None` when they already agree. Removed keys patch to
/// `null`; annotations outside the prefix never appear in the patch.
pub fn sync_extra_annotation_patch(
    export_annotations: &Option<BTreeMap<String, String>>,
    binding_annotations: &Option<BTreeMap<String, String>>,
) -> Option<Value> {
    let empty = BTreeMap::new();
    let source = export_annotations.as_ref().unwrap_or(&empty);
    let target = binding_annotations.as_ref().unwrap_or(&empty);

    let mut annotations_to_patch = serde_json::Map::new();
    for (key, value) in source {
        if !key.starts_with(ANNOTATION_EXTRA_KEY_PREFIX) {
            continue;
        }
        if target.get(key) != Some(value) {
            annotations_to_patch.insert(key.clone(), Value::String(value.clone()));
        }
    }
    for key in target.keys() {
        if !key.starts_with(ANNOTATION_EXTRA_KEY_PREFIX) {
            continue;
        }
        if !source.contains_key(key) {
            annotations_to_patch.insert(key.clone(), Value::Null);
        }
    }

    if annotations_to_patch.is_empty() {
        return None;
    }
    Some(json!({ "metadata": { "annotations": annotations_to_patch } }))
}

fn enqueue_binding(queue: &WorkQueue, binding: &ApiBinding, because: &str) {
    let key = to_cluster_aware_key(&binding.logical_cluster(), binding.name());
    debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiBinding{because}");
    queue.add(key);
}

fn enqueue_bindings_for_export(
    queue: &WorkQueue,
    bindings: &ClusterStore<ApiBinding>,
    export: &ApiExport,
) {
    let mut keys = std::collections::BTreeSet::new();
    let path = path_annotation_from(export.metadata());
    if !path.is_empty() {
        match bindings.index_keys(
            indexers::APIBINDINGS_BY_API_EXPORT,
            path.join(export.name()).as_str(),
        ) {
            Ok(path_keys) => keys.extend(path_keys),
            Err(err) => {
                warn!(error = %err, "failed to look up bindings by export path");
                return;
            }
        }
    }
    match bindings.index_keys(
        indexers::APIBINDINGS_BY_API_EXPORT,
        export.logical_cluster().path().join(export.name()).as_str(),
    ) {
        Ok(cluster_keys) => keys.extend(cluster_keys),
        Err(err) => {
            warn!(error = %err, "failed to look up bindings by export cluster");
            return;
        }
    }

    for key in keys {
        debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiBinding because of ApiExport");
        queue.add(key);
    }
}
