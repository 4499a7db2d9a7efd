//! ApiBinding: a consumer's request to import an export

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::StoreObject;
use crate::cluster::LogicalClusterPath;

use super::export::PermissionClaim;
use super::Condition;

/// Binds an export published elsewhere into the binding's own logical
/// cluster, making the export's resources served locally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBinding {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApiBindingSpec,
    #[serde(default)]
    pub status: ApiBindingStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiBindingSpec {
    #[serde(default)]
    pub reference: BindingReference,

    /// The consumer's answer to each permission claim the export makes.
    /// Claims not accepted here are never applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_claims: Vec<AcceptablePermissionClaim>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportBindingReference>,
}

/// Reference to an export by workspace path and name. An empty path means
/// the referencing object's own cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportBindingReference {
    #[serde(default, skip_serializing_if = "LogicalClusterPath::is_empty")]
    pub path: LogicalClusterPath,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptablePermissionClaim {
    #[serde(flatten)]
    pub claim: PermissionClaim,
    pub state: PermissionClaimState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PermissionClaimState {
    Accepted,
    #[default]
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BindingPhase {
    #[default]
    #[serde(rename = "")]
    Pending,
    Binding,
    Bound,
}

impl fmt::Display for BindingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingPhase::Pending => f.write_str(""),
            BindingPhase::Binding => f.write_str("Binding"),
            BindingPhase::Bound => f.write_str("Bound"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiBindingStatus {
    #[serde(default)]
    pub phase: BindingPhase,

    /// The resources this binding has materialized, exactly one entry per
    /// established bound resource definition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bound_resources: Vec<BoundResource>,

    /// Claims from the export that the consumer accepted and that are in
    /// effect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_permission_claims: Vec<PermissionClaim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_api_export: Option<BoundApiExport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// The export a binding last resolved, with the identity it was bound under.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoundApiExport {
    #[serde(default, skip_serializing_if = "LogicalClusterPath::is_empty")]
    pub path: LogicalClusterPath,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoundResource {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    pub schema_name: String,
}

impl StoreObject for ApiBinding {
    const KIND: &'static str = "ApiBinding";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
