//! Write access to upstream storage
//!
//! The controllers never write through their caches; all mutations go
//! through these traits, implemented by the embedding process against its
//! storage layer. Calls are expected to carry their own deadlines and to
//! surface transient failures as [`Error::Storage`](crate::Error::Storage)
//! or [`Error::Conflict`](crate::Error::Conflict) so the work queue can
//! retry them.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::cluster::{LogicalClusterName, LogicalClusterPath};
use crate::error::Result;

/// Creates resource definitions. Create-if-absent only; this subsystem never
/// deletes a definition it materialized.
#[async_trait]
pub trait CrdCreator: Send + Sync {
    async fn create(
        &self,
        cluster: &LogicalClusterPath,
        crd: CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition>;
}

/// Merge-patch surface for one resource kind.
#[async_trait]
pub trait Patcher: Send + Sync {
    /// Applies a merge patch to the main resource (metadata and spec).
    async fn patch(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>;

    /// Applies a merge patch to the status subresource.
    async fn patch_status(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>;
}
