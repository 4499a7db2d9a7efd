//! Shared index names and index functions
//!
//! Index keys are strings; callers compose them with the same helpers the
//! index functions use so lookups and postings always agree.

use crate::api::binding::ApiBinding;
use crate::api::endpoint_slice::ApiExportEndpointSlice;
use crate::api::export::ApiExport;
use crate::cache::{to_cluster_aware_key, StoreObject};
use crate::cluster::path_annotation_from;

/// Bindings indexed by the `path:name` of the export they reference.
pub const APIBINDINGS_BY_API_EXPORT: &str = "apiBindingsByApiExport";

/// Exports indexed by the `{cluster}|{name}` key of every schema they
/// reference.
pub const API_EXPORTS_BY_API_RESOURCE_SCHEMA: &str = "apiExportsByApiResourceSchema";

/// Any object indexed by `path:name`, for its home cluster path and, when
/// set, its public path annotation.
pub const BY_LOGICAL_CLUSTER_PATH_AND_NAME: &str = "byLogicalClusterPathAndName";

/// Endpoint slices indexed by the `path:name` of the export they reference.
pub const ENDPOINT_SLICES_BY_API_EXPORT: &str = "endpointSlicesByApiExport";

pub fn index_binding_by_api_export(binding: &ApiBinding) -> Vec<String> {
    let Some(export_ref) = &binding.spec.reference.export else {
        return Vec::new();
    };
    let path = if export_ref.path.is_empty() {
        binding.logical_cluster().path()
    } else {
        export_ref.path.clone()
    };
    vec![path.join(&export_ref.name).to_string()]
}

pub fn index_export_by_api_resource_schema(export: &ApiExport) -> Vec<String> {
    let cluster = export.logical_cluster();
    export
        .spec
        .latest_resource_schemas
        .iter()
        .map(|schema_name| to_cluster_aware_key(&cluster, schema_name))
        .collect()
}

pub fn index_by_logical_cluster_path_and_name<T: StoreObject>(obj: &T) -> Vec<String> {
    let mut keys = vec![obj.logical_cluster().path().join(obj.name()).to_string()];
    let path = path_annotation_from(obj.metadata());
    if !path.is_empty() {
        keys.push(path.join(obj.name()).to_string());
    }
    keys
}

pub fn index_endpoint_slice_by_api_export(slice: &ApiExportEndpointSlice) -> Vec<String> {
    let export_ref = &slice.spec.api_export;
    let path = if export_ref.path.is_empty() {
        slice.logical_cluster().path()
    } else {
        export_ref.path.clone()
    };
    vec![path.join(&export_ref.name).to_string()]
}
