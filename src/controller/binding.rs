//! ApiBinding controller
//!
//! Creates and maintains the bound resource definitions backing every
//! binding, and keeps binding status converged with the referenced export.
//! Watches bindings directly, and maps export, schema, and bound-definition
//! changes back to the bindings they affect.

use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::api::binding::ApiBinding;
use crate::api::export::ApiExport;
use crate::api::schema::ApiResourceSchema;
use crate::api::{ANNOTATION_SCHEMA_CLUSTER, ANNOTATION_SCHEMA_NAME};
use crate::cache::{split_cluster_aware_key, to_cluster_aware_key, ClusterStore, Event, StoreObject};
use crate::clients::{CrdCreator, Patcher};
use crate::cluster::{logical_cluster_from, path_annotation_from, LogicalClusterName};
use crate::error::Result;
use crate::indexers;
use crate::queue::WorkQueue;

use super::committer::{self, Resource};

pub const CONTROLLER_NAME: &str = "apimesh-apibinding";

/// The logical cluster shared by all bound resource definitions.
pub const SYSTEM_BOUND_CRDS_CLUSTER: &str = "system:bound-crds";

pub struct ApiBindingController {
    pub(super) queue: Arc<WorkQueue>,

    pub(super) bindings: Arc<ClusterStore<ApiBinding>>,
    pub(super) exports: Arc<ClusterStore<ApiExport>>,
    pub(super) global_exports: Arc<ClusterStore<ApiExport>>,
    pub(super) schemas: Arc<ClusterStore<ApiResourceSchema>>,
    pub(super) global_schemas: Arc<ClusterStore<ApiResourceSchema>>,
    pub(super) crds: Arc<ClusterStore<CustomResourceDefinition>>,

    pub(super) crd_creator: Arc<dyn CrdCreator>,
    pub(super) binding_patcher: Arc<dyn Patcher>,

    pub(super) deleted_crd_tracker: Arc<LockedStringSet>,
}

impl ApiBindingController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bindings: Arc<ClusterStore<ApiBinding>>,
        exports: Arc<ClusterStore<ApiExport>>,
        global_exports: Arc<ClusterStore<ApiExport>>,
        schemas: Arc<ClusterStore<ApiResourceSchema>>,
        global_schemas: Arc<ClusterStore<ApiResourceSchema>>,
        crds: Arc<ClusterStore<CustomResourceDefinition>>,
        crd_creator: Arc<dyn CrdCreator>,
        binding_patcher: Arc<dyn Patcher>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(CONTROLLER_NAME);
        let deleted_crd_tracker = Arc::new(LockedStringSet::default());

        bindings.add_indexer(
            indexers::APIBINDINGS_BY_API_EXPORT,
            Box::new(indexers::index_binding_by_api_export),
        );
        for store in [&exports, &global_exports] {
            store.add_indexer(
                indexers::BY_LOGICAL_CLUSTER_PATH_AND_NAME,
                Box::new(indexers::index_by_logical_cluster_path_and_name),
            );
            store.add_indexer(
                indexers::API_EXPORTS_BY_API_RESOURCE_SCHEMA,
                Box::new(indexers::index_export_by_api_resource_schema),
            );
        }

        // Handlers close over the queue and the stores they need, never over
        // the controller itself.
        {
            let queue = Arc::clone(&queue);
            bindings.add_event_handler(Box::new(move |event: &Event<ApiBinding>| {
                enqueue_binding(&queue, event.object(), "");
            }));
        }
        for store in [&exports, &global_exports] {
            let queue = Arc::clone(&queue);
            let bindings = Arc::clone(&bindings);
            store.add_event_handler(Box::new(move |event: &Event<ApiExport>| {
                enqueue_bindings_for_export(
                    &queue,
                    &bindings,
                    event.object(),
                    " because of ApiExport",
                );
            }));
        }
        for store in [&schemas, &global_schemas] {
            let queue = Arc::clone(&queue);
            let bindings = Arc::clone(&bindings);
            let exports = Arc::clone(&exports);
            let global_exports = Arc::clone(&global_exports);
            store.add_event_handler(Box::new(move |event: &Event<ApiResourceSchema>| {
                enqueue_bindings_for_schema(
                    &queue,
                    &bindings,
                    &exports,
                    &global_exports,
                    event.object(),
                    " because of ApiResourceSchema",
                );
            }));
        }
        {
            let queue = Arc::clone(&queue);
            let bindings = Arc::clone(&bindings);
            let exports = Arc::clone(&exports);
            let global_exports = Arc::clone(&global_exports);
            let schemas = Arc::clone(&schemas);
            let global_schemas = Arc::clone(&global_schemas);
            let tracker = Arc::clone(&deleted_crd_tracker);
            crds.add_event_handler(Box::new(move |event: &Event<CustomResourceDefinition>| {
                let crd = event.object();
                if logical_cluster_from(crd.metadata()).as_str() != SYSTEM_BOUND_CRDS_CLUSTER {
                    return;
                }
                if let Event::Deleted { obj, .. } = event {
                    // Remember the deletion so a stale cache read cannot talk
                    // us out of recreating the definition.
                    tracker.add(obj.name());
                }
                enqueue_bindings_for_crd(
                    &queue,
                    &bindings,
                    &exports,
                    &global_exports,
                    &schemas,
                    &global_schemas,
                    crd,
                );
            }));
        }

        Arc::new(ApiBindingController {
            queue,
            bindings,
            exports,
            global_exports,
            schemas,
            global_schemas,
            crds,
            crd_creator,
            binding_patcher,
            deleted_crd_tracker,
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
            Ok(Ok(true)) => self.queue.add(key),
            Ok(Ok(false)) => self.queue.forget(key),
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

    /// Reconciles one binding and commits whatever changed. The returned flag
    /// asks for an immediate, non-penalized requeue.
    #[instrument(name = "reconcile", skip(self), fields(controller = CONTROLLER_NAME))]
    async fn process(&self, key: &str) -> Result<bool> {
        let (cluster, name) = match split_cluster_aware_key(key) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "dropping malformed key");
                return Ok(false);
            }
        };

        let binding = match self.bindings.get(&cluster, &name) {
            Ok(binding) => binding,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };

        let old = binding.as_ref();
        let mut updated = old.clone();

        let (requeue, result) = self.reconcile(&mut updated).await;

        let commit_result = committer::commit(
            self.binding_patcher.as_ref(),
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
            (Ok(()), Ok(())) => Ok(requeue),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Err(err), Err(commit_err)) => {
                error!(error = %commit_err, "failed to commit reconcile result");
                Err(err)
            }
        }
    }
}

fn enqueue_binding(queue: &WorkQueue, binding: &ApiBinding, because: &str) {
    let key = to_cluster_aware_key(&binding.logical_cluster(), binding.name());
    debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiBinding{because}");
    queue.add(key);
}

/// Enqueues every binding referencing `export`, looked up under both the
/// export's public path and its home cluster path.
fn enqueue_bindings_for_export(
    queue: &WorkQueue,
    bindings: &ClusterStore<ApiBinding>,
    export: &ApiExport,
    because: &str,
) {
    let mut keys = BTreeSet::new();
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
        debug!(controller = CONTROLLER_NAME, key = %key, "queueing ApiBinding{because}");
        queue.add(key);
    }
}

/// Maps a schema to the exports referencing it (local index first, global as
/// fallback), then on to their bindings.
fn enqueue_bindings_for_schema(
    queue: &WorkQueue,
    bindings: &ClusterStore<ApiBinding>,
    exports: &ClusterStore<ApiExport>,
    global_exports: &ClusterStore<ApiExport>,
    schema: &ApiResourceSchema,
    because: &str,
) {
    let schema_key = to_cluster_aware_key(&schema.logical_cluster(), schema.name());
    let mut referencing = match exports.by_index(
        indexers::API_EXPORTS_BY_API_RESOURCE_SCHEMA,
        &schema_key,
    ) {
        Ok(found) => found,
        Err(err) => {
            warn!(error = %err, "failed to look up exports by schema");
            return;
        }
    };
    if referencing.is_empty() {
        referencing = match global_exports.by_index(
            indexers::API_EXPORTS_BY_API_RESOURCE_SCHEMA,
            &schema_key,
        ) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "failed to look up global exports by schema");
                return;
            }
        };
    }

    for export in referencing {
        enqueue_bindings_for_export(queue, bindings, &export, because);
    }
}

/// Maps a bound resource definition back to its schema via annotations, then
/// on to the bindings consuming it.
fn enqueue_bindings_for_crd(
    queue: &WorkQueue,
    bindings: &ClusterStore<ApiBinding>,
    exports: &ClusterStore<ApiExport>,
    global_exports: &ClusterStore<ApiExport>,
    schemas: &ClusterStore<ApiResourceSchema>,
    global_schemas: &ClusterStore<ApiResourceSchema>,
    crd: &CustomResourceDefinition,
) {
    let annotations = crd.metadata.annotations.clone().unwrap_or_default();
    let (Some(schema_cluster), Some(schema_name)) = (
        annotations.get(ANNOTATION_SCHEMA_CLUSTER),
        annotations.get(ANNOTATION_SCHEMA_NAME),
    ) else {
        debug!(
            controller = CONTROLLER_NAME,
            crd = crd.name(),
            "skipping resource definition without schema annotations"
        );
        return;
    };

    let cluster = LogicalClusterName::new(schema_cluster.clone());
    let schema = match schemas.get(&cluster, schema_name) {
        Ok(schema) => schema,
        Err(err) if err.is_not_found() => match global_schemas.get(&cluster, schema_name) {
            Ok(schema) => schema,
            Err(err) => {
                warn!(error = %err, "failed to resolve schema for resource definition");
                return;
            }
        },
        Err(err) => {
            warn!(error = %err, "failed to resolve schema for resource definition");
            return;
        }
    };

    enqueue_bindings_for_schema(
        queue,
        bindings,
        exports,
        global_exports,
        &schema,
        " because of bound resource definition",
    );
}

/// A mutex-guarded string set. Scoped to one controller instance.
#[derive(Default)]
pub(crate) struct LockedStringSet(Mutex<HashSet<String>>);

impl LockedStringSet {
    pub(crate) fn add(&self, value: &str) {
        self.0.lock().insert(value.to_string());
    }

    pub(crate) fn remove(&self, value: &str) {
        self.0.lock().remove(value);
    }

    pub(crate) fn has(&self, value: &str) -> bool {
        self.0.lock().contains(value)
    }
}
