//! The per-binding reconcile state machine
//!
//! One pass resolves the referenced export, checks identity and permission
//! claims, detects naming conflicts with sibling bindings, materializes the
//! export's schemas as bound resource definitions, and rebuilds the
//! binding's status from what is actually established.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use sha2::{Digest, Sha224};
use tracing::{debug, error, info};

use crate::api::binding::{
    ApiBinding, BindingPhase, BoundApiExport, BoundResource, PermissionClaimState,
};
use crate::api::export::ApiExport;
use crate::api::schema::ApiResourceSchema;
use crate::api::{ANNOTATION_SCHEMA_CLUSTER, ANNOTATION_SCHEMA_NAME};
use crate::cache::StoreObject;
use crate::cluster::{LogicalClusterName, LogicalClusterPath};
use crate::error::Result;

use super::binding::{ApiBindingController, SYSTEM_BOUND_CRDS_CLUSTER};
use super::conditions::{
    mark_false, mark_true, API_EXPORT_VALID, BINDING_UP_TO_DATE, PERMISSION_CLAIMS_VALID,
    REASON_API_EXPORT_NOT_FOUND, REASON_CLAIM_NOT_ACCEPTED, REASON_INTERNAL_ERROR,
    REASON_NAMING_CONFLICT, REASON_UNKNOWN_CLAIM, REASON_WAITING_FOR_ESTABLISHED,
};

impl ApiBindingController {
    pub(super) fn get_api_export(
        &self,
        path: &LogicalClusterPath,
        name: &str,
    ) -> Result<Arc<ApiExport>> {
        super::resolve_api_export(&self.exports, &self.global_exports, path, name)
    }

    pub(super) fn get_api_resource_schema(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
    ) -> Result<Arc<ApiResourceSchema>> {
        match self.schemas.get(cluster, name) {
            Err(err) if err.is_not_found() => self.global_schemas.get(cluster, name),
            other => other,
        }
    }

    fn list_api_bindings(&self, cluster: &LogicalClusterName) -> Vec<Arc<ApiBinding>> {
        self.bindings.list_cluster(cluster)
    }

    pub(super) async fn reconcile(&self, binding: &mut ApiBinding) -> (bool, Result<()>) {
        let cluster = binding.logical_cluster();

        if binding.status.phase == BindingPhase::Pending {
            binding.status.phase = BindingPhase::Binding;
        }

        // Resolve the referenced export.
        let Some(export_ref) = binding.spec.reference.export.clone() else {
            mark_false(
                &mut binding.status.conditions,
                API_EXPORT_VALID,
                REASON_API_EXPORT_NOT_FOUND,
                "spec.reference.export is not set",
            );
            binding.status.bound_resources.clear();
            return (false, Ok(()));
        };
        let path = if export_ref.path.is_empty() {
            cluster.path()
        } else {
            export_ref.path.clone()
        };
        let export = match self.get_api_export(&path, &export_ref.name) {
            Ok(export) => export,
            Err(err) if err.is_not_found() => {
                // The export is gone; report it but leave already-materialized
                // definitions alone. Cleanup is an administrative step.
                mark_false(
                    &mut binding.status.conditions,
                    API_EXPORT_VALID,
                    REASON_API_EXPORT_NOT_FOUND,
                    &format!("APIExport {} not found", path.join(&export_ref.name)),
                );
                binding.status.bound_resources.clear();
                return (false, Ok(()));
            }
            Err(err) => return (false, Err(err)),
        };
        mark_true(&mut binding.status.conditions, API_EXPORT_VALID);

        // Fetch every schema the export references before touching status, so
        // a partially visible export never partially rebinds.
        let mut schemas = Vec::with_capacity(export.spec.latest_resource_schemas.len());
        for schema_name in &export.spec.latest_resource_schemas {
            match self.get_api_resource_schema(&export.logical_cluster(), schema_name) {
                Ok(schema) => schemas.push(schema),
                Err(err) if err.is_not_found() => {
                    mark_false(
                        &mut binding.status.conditions,
                        API_EXPORT_VALID,
                        REASON_INTERNAL_ERROR,
                        &format!(
                            "APIResourceSchema {schema_name} referenced by APIExport {} not found",
                            path.join(&export_ref.name),
                        ),
                    );
                    return (false, Ok(()));
                }
                Err(err) => return (false, Err(err)),
            }
        }

        // Identity check: a re-created export under the same name must not be
        // silently treated as the one we bound.
        let identity = export.identity_hash().to_string();
        if binding.status.phase == BindingPhase::Bound {
            let previous_identity = binding
                .status
                .bound_api_export
                .as_ref()
                .and_then(|bound| bound.identity_hash.as_deref())
                .unwrap_or_default();
            if previous_identity != identity {
                info!(
                    binding = binding.name(),
                    "export identity changed, rebinding"
                );
                binding.status.phase = BindingPhase::Binding;
                let still_referenced: HashSet<&str> =
                    schemas.iter().map(|schema| schema.name()).collect();
                binding
                    .status
                    .bound_resources
                    .retain(|bound| still_referenced.contains(bound.schema_name.as_str()));
            }
        }

        self.reconcile_permission_claims(binding, &export);

        // Naming conflicts: a (group, resource) pair can only be served once
        // per consumer cluster. The older binding keeps it.
        let siblings = self.list_api_bindings(&cluster);
        let mut conflicts = Vec::new();
        let mut conflicted_schemas: HashSet<String> = HashSet::new();
        for schema in &schemas {
            let group = &schema.spec.group;
            let resource = &schema.spec.names.plural;
            for sibling in &siblings {
                if sibling.name() == binding.name() {
                    continue;
                }
                let overlapping = sibling
                    .status
                    .bound_resources
                    .iter()
                    .any(|bound| bound.group == *group && bound.resource == *resource);
                if overlapping && !created_before(binding, sibling) {
                    conflicts.push(format!(
                        "{resource}.{group} is already bound by APIBinding {}",
                        sibling.name(),
                    ));
                    conflicted_schemas.insert(schema.name().to_string());
                }
            }
        }

        // Materialize one bound resource definition per remaining schema.
        let system_cluster = LogicalClusterName::new(SYSTEM_BOUND_CRDS_CLUSTER);
        let mut requeue = false;
        let mut bound_resources = Vec::new();
        let mut waiting = Vec::new();
        for schema in &schemas {
            if conflicted_schemas.contains(schema.name()) {
                continue;
            }
            let crd_name = bound_crd_name(
                &schema.logical_cluster(),
                schema.name(),
                &schema.spec.names.plural,
                &schema.spec.group,
            );

            let existing = match self.crds.get(&system_cluster, &crd_name) {
                Ok(crd) => {
                    let (ann_cluster, ann_name) = schema_annotations(&crd);
                    if ann_cluster != schema.logical_cluster().as_str()
                        || ann_name != schema.name()
                    {
                        // The name is a pure function of the schema
                        // coordinates, so this cannot happen without a bug or
                        // a hash collision. Do not retry.
                        error!(
                            crd = %crd_name,
                            schema = schema.name(),
                            "bound resource definition exists with conflicting schema annotations"
                        );
                        mark_false(
                            &mut binding.status.conditions,
                            BINDING_UP_TO_DATE,
                            REASON_INTERNAL_ERROR,
                            &format!(
                                "bound resource definition {crd_name} exists but belongs to a different schema",
                            ),
                        );
                        return (false, Ok(()));
                    }
                    Some(crd)
                }
                Err(err) if err.is_not_found() => None,
                Err(err) => return (requeue, Err(err)),
            };

            // A tracked deletion overrides whatever a stale cache still shows.
            let stale_delete = self.deleted_crd_tracker.has(&crd_name);
            if let Some(crd) = existing.filter(|_| !stale_delete) {
                if is_crd_established(&crd) {
                    bound_resources.push(BoundResource {
                        group: schema.spec.group.clone(),
                        resource: schema.spec.names.plural.clone(),
                        schema_name: schema.name().to_string(),
                    });
                } else {
                    waiting.push(crd_name);
                }
                continue;
            }

            let crd = match schema.to_custom_resource_definition(&crd_name, &system_cluster) {
                Ok(crd) => crd,
                Err(err) => {
                    error!(schema = schema.name(), error = %err, "schema cannot be served");
                    mark_false(
                        &mut binding.status.conditions,
                        BINDING_UP_TO_DATE,
                        REASON_INTERNAL_ERROR,
                        &err.to_string(),
                    );
                    return (false, Ok(()));
                }
            };
            match self.crd_creator.create(&system_cluster.path(), crd).await {
                Ok(_) => {
                    debug!(crd = %crd_name, "created bound resource definition");
                    self.deleted_crd_tracker.remove(&crd_name);
                }
                Err(err) if err.is_already_exists() => {
                    // Another binding won the create; pick the definition up
                    // on the requeue.
                    self.deleted_crd_tracker.remove(&crd_name);
                }
                Err(err) => return (requeue, Err(err)),
            }
            waiting.push(crd_name);
            requeue = true;
        }

        if !conflicts.is_empty() {
            mark_false(
                &mut binding.status.conditions,
                BINDING_UP_TO_DATE,
                REASON_NAMING_CONFLICT,
                &conflicts.join("; "),
            );
        } else if !waiting.is_empty() {
            mark_false(
                &mut binding.status.conditions,
                BINDING_UP_TO_DATE,
                REASON_WAITING_FOR_ESTABLISHED,
                &format!("waiting for {} to be established", waiting.join(", ")),
            );
        } else {
            mark_true(&mut binding.status.conditions, BINDING_UP_TO_DATE);
        }

        bound_resources.sort();
        binding.status.bound_resources = bound_resources;
        binding.status.bound_api_export = Some(BoundApiExport {
            path: path.clone(),
            name: export_ref.name.clone(),
            identity_hash: if identity.is_empty() {
                None
            } else {
                Some(identity)
            },
        });
        binding.status.phase = if conflicts.is_empty()
            && waiting.is_empty()
            && binding.status.bound_resources.len() == schemas.len()
        {
            BindingPhase::Bound
        } else {
            BindingPhase::Binding
        };

        (requeue, Ok(()))
    }

    /// Every claim the export makes must be answered in the binding spec.
    /// Unanswered or rejected claims are reported but never block binding of
    /// resources the claim does not cover.
    fn reconcile_permission_claims(&self, binding: &mut ApiBinding, export: &ApiExport) {
        let mut unknown = Vec::new();
        let mut rejected = Vec::new();
        let mut applied = Vec::new();

        for claim in &export.spec.permission_claims {
            let acceptance = binding
                .spec
                .permission_claims
                .iter()
                .find(|acceptable| acceptable.claim == *claim);
            match acceptance {
                None => unknown.push(format!("{}.{}", claim.resource, claim.group)),
                Some(acceptable) if acceptable.state != PermissionClaimState::Accepted => {
                    rejected.push(format!("{}.{}", claim.resource, claim.group));
                }
                Some(_) => applied.push(claim.clone()),
            }
        }

        binding.status.applied_permission_claims = applied;
        if !unknown.is_empty() {
            mark_false(
                &mut binding.status.conditions,
                PERMISSION_CLAIMS_VALID,
                REASON_UNKNOWN_CLAIM,
                &format!("claims not acknowledged in spec: {}", unknown.join(", ")),
            );
        } else if !rejected.is_empty() {
            mark_false(
                &mut binding.status.conditions,
                PERMISSION_CLAIMS_VALID,
                REASON_CLAIM_NOT_ACCEPTED,
                &format!("claims not accepted: {}", rejected.join(", ")),
            );
        } else {
            mark_true(&mut binding.status.conditions, PERMISSION_CLAIMS_VALID);
        }
    }
}

/// Whether `a` wins a resource claim against `b`: earlier creation wins, ties
/// go to the lexicographically smaller name.
fn created_before(a: &ApiBinding, b: &ApiBinding) -> bool {
    let a_time = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let b_time = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
    match (a_time, b_time) {
        (Some(a_time), Some(b_time)) if a_time != b_time => a_time < b_time,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        _ => a.name() < b.name(),
    }
}

fn schema_annotations(crd: &CustomResourceDefinition) -> (String, String) {
    let annotations = crd.metadata.annotations.clone().unwrap_or_default();
    (
        annotations
            .get(ANNOTATION_SCHEMA_CLUSTER)
            .cloned()
            .unwrap_or_default(),
        annotations
            .get(ANNOTATION_SCHEMA_NAME)
            .cloned()
            .unwrap_or_default(),
    )
}

pub(crate) fn is_crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Established" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// The deterministic name of the bound resource definition for a schema:
/// `base36(sha224(cluster + ":" + name))[..8].{plural}.{group}`.
///
/// Renaming would orphan every definition created under the old scheme, so
/// this function must never change.
pub fn bound_crd_name(
    schema_cluster: &LogicalClusterName,
    schema_name: &str,
    plural: &str,
    group: &str,
) -> String {
    let digest = Sha224::digest(format!("{schema_cluster}:{schema_name}").as_bytes());
    let hash = base36_encode(&digest);
    format!("{}.{plural}.{group}", &hash[..8])
}

/// Big-endian bytes rendered as a lowercase base36 integer.
fn base36_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut digits: Vec<u8> = Vec::new();
    let mut remaining: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if remaining.is_empty() {
        return "0".to_string();
    }
    while !remaining.is_empty() {
        let mut quotient: Vec<u8> = Vec::with_capacity(remaining.len());
        let mut carry: u32 = 0;
        for &byte in &remaining {
            let acc = carry * 256 + byte as u32;
            let q = (acc / 36) as u8;
            carry = acc % 36;
            if !quotient.is_empty() || q != 0 {
                quotient.push(q);
            }
        }
        digits.push(ALPHABET[carry as usize]);
        remaining = quotient;
    }
    digits.iter().rev().map(|&digit| digit as char).collect()
}
