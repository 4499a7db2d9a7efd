//! API object model for the binding subsystem
//!
//! These types are the persisted surface the reconcilers operate on:
//! publishers declare [`export::ApiExport`]s referencing immutable
//! [`schema::ApiResourceSchema`]s, consumers import them with
//! [`binding::ApiBinding`]s, and [`endpoint_slice::ApiExportEndpointSlice`]s
//! surface the URLs where an export is served. Metadata follows Kubernetes
//! conventions (`ObjectMeta`, annotations, conditions).

pub mod binding;
pub mod endpoint_slice;
pub mod export;
pub mod schema;
pub mod shard;

mod condition;

pub use condition::Condition;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cache::StoreObject;

/// Annotation on a bound resource definition carrying the home cluster of the
/// schema it was created from.
pub const ANNOTATION_SCHEMA_CLUSTER: &str = "apis.apimesh.io/schema-cluster";

/// Annotation on a bound resource definition carrying the name of the schema
/// it was created from.
pub const ANNOTATION_SCHEMA_NAME: &str = "apis.apimesh.io/schema-name";

/// Prefix of annotations propagated one-way from an export to its bindings.
pub const ANNOTATION_EXTRA_KEY_PREFIX: &str = "extra.apis.apimesh.io/";

impl StoreObject for CustomResourceDefinition {
    const KIND: &'static str = "CustomResourceDefinition";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
