//! Logical cluster names and paths
//!
//! A logical cluster is an isolated tenant workspace identified by an opaque
//! name. A path is a `:`-joined chain of names and is how objects refer to
//! each other across the workspace hierarchy (`root:org:team`). Objects carry
//! their home cluster, and optionally their public path, in annotations on
//! their metadata.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the home logical cluster of an object.
pub const CLUSTER_ANNOTATION_KEY: &str = "apimesh.io/cluster";

/// Annotation carrying the public path of an object, when it has one.
pub const PATH_ANNOTATION_KEY: &str = "apimesh.io/path";

/// The opaque, case-sensitive name of a single logical cluster.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct LogicalClusterName(String);

impl LogicalClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        LogicalClusterName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The single-element path naming this cluster directly.
    pub fn path(&self) -> LogicalClusterPath {
        LogicalClusterPath(self.0.clone())
    }
}

impl fmt::Display for LogicalClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalClusterName {
    fn from(name: &str) -> Self {
        LogicalClusterName(name.to_string())
    }
}

/// A `:`-joined chain of logical cluster names.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct LogicalClusterPath(String);

impl LogicalClusterPath {
    pub fn new(path: impl Into<String>) -> Self {
        LogicalClusterPath(path.into())
    }

    pub fn empty() -> Self {
        LogicalClusterPath(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends `name` to the path, yielding `self:name`.
    pub fn join(&self, name: &str) -> LogicalClusterPath {
        if self.is_empty() {
            LogicalClusterPath(name.to_string())
        } else {
            LogicalClusterPath(format!("{}:{}", self.0, name))
        }
    }
}

impl fmt::Display for LogicalClusterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalClusterPath {
    fn from(path: &str) -> Self {
        LogicalClusterPath(path.to_string())
    }
}

/// Reads the home cluster of an object from its metadata annotation.
///
/// Returns an empty name when the annotation is absent; persisted objects
/// always carry it.
pub fn logical_cluster_from(meta: &ObjectMeta) -> LogicalClusterName {
    let name = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(CLUSTER_ANNOTATION_KEY))
        .cloned()
        .unwrap_or_default();
    LogicalClusterName(name)
}

/// Reads the public path annotation of an object, empty when unset.
pub fn path_annotation_from(meta: &ObjectMeta) -> LogicalClusterPath {
    let path = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(PATH_ANNOTATION_KEY))
        .cloned()
        .unwrap_or_default();
    LogicalClusterPath(path)
}
