//! ApiResourceSchema: an immutable, content-addressed resource definition
//!
//! A schema's name embeds a hash of its content (`rev-9f2c1d.widgets.example.io`),
//! so two schemas with the same name are guaranteed identical. Schemas are
//! never mutated in place; publishers create a new one and repoint their
//! export at it.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceSubresources, CustomResourceValidation,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::StoreObject;
use crate::cluster::{LogicalClusterName, CLUSTER_ANNOTATION_KEY};
use crate::error::{Error, Result};

use super::{ANNOTATION_SCHEMA_CLUSTER, ANNOTATION_SCHEMA_NAME};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSchema {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApiResourceSchemaSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSchemaSpec {
    pub group: String,
    pub names: ResourceNames,
    #[serde(default)]
    pub scope: ResourceScope,
    pub versions: Vec<ApiResourceVersion>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNames {
    pub plural: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub singular: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub list_kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ResourceScope {
    Cluster,
    #[default]
    Namespaced,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceVersion {
    pub name: String,
    #[serde(default)]
    pub served: bool,
    #[serde(default)]
    pub storage: bool,

    /// OpenAPI v3 structural schema, kept raw until served.
    #[serde(default)]
    pub schema: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub subresources: Option<CustomResourceSubresources>,
}

impl ApiResourceSchema {
    /// Renders this schema as a resource definition named `crd_name`, homed in
    /// `target_cluster`, annotated with the schema's coordinates so the
    /// definition can always be traced back to its source.
    ///
    /// Validation schemas and subresources are carried over verbatim.
    pub fn to_custom_resource_definition(
        &self,
        crd_name: &str,
        target_cluster: &LogicalClusterName,
    ) -> Result<CustomResourceDefinition> {
        let mut versions = Vec::with_capacity(self.spec.versions.len());
        for version in &self.spec.versions {
            let open_api_v3_schema = if version.schema.is_null() {
                None
            } else {
                Some(
                    serde_json::from_value(version.schema.clone()).map_err(|err| {
                        Error::SchemaTranslation(format!(
                            "version {} of schema {}: {err}",
                            version.name,
                            self.metadata.name.as_deref().unwrap_or_default(),
                        ))
                    })?,
                )
            };
            versions.push(CustomResourceDefinitionVersion {
                name: version.name.clone(),
                served: version.served,
                storage: version.storage,
                schema: Some(CustomResourceValidation { open_api_v3_schema }),
                subresources: version.subresources.clone(),
                ..Default::default()
            });
        }

        let schema_cluster = crate::cluster::logical_cluster_from(&self.metadata);
        let annotations = std::collections::BTreeMap::from([
            (
                CLUSTER_ANNOTATION_KEY.to_string(),
                target_cluster.to_string(),
            ),
            (
                ANNOTATION_SCHEMA_CLUSTER.to_string(),
                schema_cluster.to_string(),
            ),
            (
                ANNOTATION_SCHEMA_NAME.to_string(),
                self.metadata.name.clone().unwrap_or_default(),
            ),
        ]);

        Ok(CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(crd_name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: self.spec.group.clone(),
                names: CustomResourceDefinitionNames {
                    plural: self.spec.names.plural.clone(),
                    singular: non_empty(&self.spec.names.singular),
                    kind: self.spec.names.kind.clone(),
                    list_kind: non_empty(&self.spec.names.list_kind),
                    short_names: if self.spec.names.short_names.is_empty() {
                        None
                    } else {
                        Some(self.spec.names.short_names.clone())
                    },
                    ..Default::default()
                },
                scope: match self.spec.scope {
                    ResourceScope::Cluster => "Cluster".to_string(),
                    ResourceScope::Namespaced => "Namespaced".to_string(),
                },
                versions,
                ..Default::default()
            },
            status: None,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl StoreObject for ApiResourceSchema {
    const KIND: &'static str = "ApiResourceSchema";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
