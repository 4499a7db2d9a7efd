//! ApiExportEndpointSlice: where an export can be reached

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::StoreObject;

use super::binding::ExportBindingReference;
use super::Condition;

/// Surfaces the per-shard virtual workspace URLs at which a referenced
/// export is served. The status URL list is sorted and duplicate-free.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportEndpointSlice {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApiExportEndpointSliceSpec,
    #[serde(default)]
    pub status: ApiExportEndpointSliceStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportEndpointSliceSpec {
    pub api_export: ExportBindingReference,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportEndpointSliceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_export_endpoints: Vec<ApiExportEndpoint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportEndpoint {
    pub url: String,
}

impl StoreObject for ApiExportEndpointSlice {
    const KIND: &'static str = "ApiExportEndpointSlice";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
