//! Shard: a backend instance serving a subset of logical clusters

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::StoreObject;

/// Externally managed; consumed read-only by the endpoint slice reconciler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ShardSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    /// Base URL of the shard's virtual workspace server. Empty while the
    /// shard has not published one; such shards serve no endpoints.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_workspace_url: String,
}

impl StoreObject for Shard {
    const KIND: &'static str = "Shard";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
