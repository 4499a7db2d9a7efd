//! ApiExport: the publisher-side declaration of an API surface

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::StoreObject;

use super::Condition;

/// Publishes a named bundle of resource schemas for other logical clusters to
/// bind. Schema references are resolved by name within the export's home
/// cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiExport {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApiExportSpec,
    #[serde(default)]
    pub status: ApiExportStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportSpec {
    /// Names of the latest ApiResourceSchema for every resource this export
    /// serves, in the publisher's preferred order.
    #[serde(default)]
    pub latest_resource_schemas: Vec<String>,

    /// Access the publisher requests to categories of consumer-side objects.
    /// Each claim must be explicitly accepted in the binding spec before it
    /// takes effect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_claims: Vec<PermissionClaim>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportStatus {
    /// Opaque fingerprint of the export's identity. Changes when the export
    /// is deleted and re-created under the same name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A claim on a `(group, resource)` pair, optionally pinned to the identity
/// of the export that serves the resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionClaim {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,
}

impl ApiExport {
    /// The export's identity hash, empty when none has been assigned yet.
    pub fn identity_hash(&self) -> &str {
        self.status.identity_hash.as_deref().unwrap_or_default()
    }
}

impl StoreObject for ApiExport {
    const KIND: &'static str = "ApiExport";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
