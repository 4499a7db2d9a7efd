//! Tests for the binding reconciler
//!
//! These drive the state machine directly against in-memory caches and a
//! fake definition creator, covering bind/unbind flows, conflict handling,
//! identity changes, permission claims, and the stale-cache recreate path.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use serde_json::json;

use crate::api::binding::{
    AcceptablePermissionClaim, ApiBinding, ApiBindingSpec, BindingPhase, BindingReference,
    ExportBindingReference, PermissionClaimState,
};
use crate::api::export::{ApiExport, ApiExportSpec, ApiExportStatus, PermissionClaim};
use crate::api::schema::{
    ApiResourceSchema, ApiResourceSchemaSpec, ApiResourceVersion, ResourceNames, ResourceScope,
};
use crate::api::{ANNOTATION_SCHEMA_CLUSTER, ANNOTATION_SCHEMA_NAME};
use crate::cache::ClusterStore;
use crate::clients::{CrdCreator, Patcher};
use crate::cluster::{LogicalClusterName, LogicalClusterPath, CLUSTER_ANNOTATION_KEY};
use crate::error::{Error, Result};

use super::binding::{ApiBindingController, SYSTEM_BOUND_CRDS_CLUSTER};
use super::bound_crd_name;
use super::conditions::{
    find_condition, is_condition_true, API_EXPORT_VALID, BINDING_UP_TO_DATE,
    PERMISSION_CLAIMS_VALID, REASON_API_EXPORT_NOT_FOUND, REASON_CLAIM_NOT_ACCEPTED,
    REASON_INTERNAL_ERROR, REASON_NAMING_CONFLICT, REASON_UNKNOWN_CLAIM,
    REASON_WAITING_FOR_ESTABLISHED,
};

struct NullPatcher;

#[async_trait]
impl Patcher for NullPatcher {
    async fn patch(
        &self,
        _cluster: &LogicalClusterName,
        _name: &str,
        _patch: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn patch_status(
        &self,
        _cluster: &LogicalClusterName,
        _name: &str,
        _patch: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Creates definitions into the cache, with a separate view of what exists
/// server-side so cache staleness can be simulated.
struct FakeCrdCreator {
    crds: Arc<ClusterStore<CustomResourceDefinition>>,
    server: Mutex<HashSet<String>>,
    establish: bool,
    create_calls: AtomicUsize,
}

#[async_trait]
impl CrdCreator for FakeCrdCreator {
    async fn create(
        &self,
        _cluster: &LogicalClusterPath,
        mut crd: CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition> {
        let name = crd.metadata.name.clone().unwrap_or_default();
        {
            let mut server = self.server.lock();
            if server.contains(&name) {
                return Err(Error::already_exists("CustomResourceDefinition", name));
            }
            server.insert(name);
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.establish {
            establish(&mut crd);
        }
        self.crds.apply(crd.clone());
        Ok(crd)
    }
}

fn establish(crd: &mut CustomResourceDefinition) {
    crd.status = Some(CustomResourceDefinitionStatus {
        conditions: Some(vec![CustomResourceDefinitionCondition {
            type_: "Established".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

struct Harness {
    controller: Arc<ApiBindingController>,
    bindings: Arc<ClusterStore<ApiBinding>>,
    exports: Arc<ClusterStore<ApiExport>>,
    global_exports: Arc<ClusterStore<ApiExport>>,
    schemas: Arc<ClusterStore<ApiResourceSchema>>,
    crds: Arc<ClusterStore<CustomResourceDefinition>>,
    creator: Arc<FakeCrdCreator>,
}

impl Harness {
    fn new(establish: bool) -> Self {
        let bindings = ClusterStore::new();
        let exports = ClusterStore::new();
        let global_exports = ClusterStore::new();
        let schemas = ClusterStore::new();
        let global_schemas = ClusterStore::new();
        let crds = ClusterStore::new();
        let creator = Arc::new(FakeCrdCreator {
            crds: Arc::clone(&crds),
            server: Mutex::new(HashSet::new()),
            establish,
            create_calls: AtomicUsize::new(0),
        });
        let controller = ApiBindingController::new(
            Arc::clone(&bindings),
            Arc::clone(&exports),
            Arc::clone(&global_exports),
            Arc::clone(&schemas),
            Arc::clone(&global_schemas),
            Arc::clone(&crds),
            Arc::clone(&creator) as Arc<dyn CrdCreator>,
            Arc::new(NullPatcher),
        );
        Harness {
            controller,
            bindings,
            exports,
            global_exports,
            schemas,
            crds,
            creator,
        }
    }

    fn establish_crd(&self, name: &str) {
        let crd = self
            .crds
            .get(&SYSTEM_BOUND_CRDS_CLUSTER.into(), name)
            .expect("definition exists");
        let mut crd = crd.as_ref().clone();
        establish(&mut crd);
        self.crds.apply(crd);
    }
}

fn meta(cluster: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        annotations: Some(BTreeMap::from([(
            CLUSTER_ANNOTATION_KEY.to_string(),
            cluster.to_string(),
        )])),
        ..Default::default()
    }
}

fn meta_at(cluster: &str, name: &str, created: i64) -> ObjectMeta {
    ObjectMeta {
        creation_timestamp: Some(Time(
            chrono::DateTime::from_timestamp(created, 0).expect("valid timestamp"),
        )),
        ..meta(cluster, name)
    }
}

fn widgets_schema(cluster: &str, name: &str) -> ApiResourceSchema {
    ApiResourceSchema {
        metadata: meta(cluster, name),
        spec: ApiResourceSchemaSpec {
            group: "example.io".to_string(),
            names: ResourceNames {
                plural: "widgets".to_string(),
                singular: "widget".to_string(),
                kind: "Widget".to_string(),
                list_kind: "WidgetList".to_string(),
                short_names: vec![],
            },
            scope: ResourceScope::Namespaced,
            versions: vec![ApiResourceVersion {
                name: "v1".to_string(),
                served: true,
                storage: true,
                schema: json!({"type": "object"}),
                subresources: None,
            }],
        },
    }
}

fn export(cluster: &str, name: &str, schemas: &[&str], identity: Option<&str>) -> ApiExport {
    ApiExport {
        metadata: meta(cluster, name),
        spec: ApiExportSpec {
            latest_resource_schemas: schemas.iter().map(|s| s.to_string()).collect(),
            permission_claims: vec![],
        },
        status: ApiExportStatus {
            identity_hash: identity.map(String::from),
            conditions: vec![],
        },
    }
}

fn binding(cluster: &str, name: &str, export_path: &str, export_name: &str) -> ApiBinding {
    ApiBinding {
        metadata: meta_at(cluster, name, 1000),
        spec: ApiBindingSpec {
            reference: BindingReference {
                export: Some(ExportBindingReference {
                    path: export_path.into(),
                    name: export_name.to_string(),
                }),
            },
            permission_claims: vec![],
        },
        ..Default::default()
    }
}

const SCHEMA_NAME: &str = "rev-1.widgets.example.io";

fn widgets_crd_name() -> String {
    bound_crd_name(&"root:a".into(), SCHEMA_NAME, "widgets", "example.io")
}

#[tokio::test]
async fn test_happy_bind() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports
        .apply(export("root:a", "e", &[SCHEMA_NAME], Some("i1")));

    let mut b = binding("root:b", "b1", "root:a", "e");

    // First pass creates the definition and asks to be requeued.
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(requeue);
    assert_eq!(b.status.phase, BindingPhase::Binding);
    let waiting = find_condition(&b.status.conditions, BINDING_UP_TO_DATE).unwrap();
    assert_eq!(waiting.reason, REASON_WAITING_FOR_ESTABLISHED);

    let crd = h
        .crds
        .get(&SYSTEM_BOUND_CRDS_CLUSTER.into(), &widgets_crd_name())
        .expect("definition created");
    let annotations = crd.metadata.annotations.clone().unwrap();
    assert_eq!(
        annotations.get(ANNOTATION_SCHEMA_CLUSTER).map(String::as_str),
        Some("root:a")
    );
    assert_eq!(
        annotations.get(ANNOTATION_SCHEMA_NAME).map(String::as_str),
        Some(SCHEMA_NAME)
    );

    // Second pass observes the established definition and binds.
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(!requeue);
    assert_eq!(b.status.phase, BindingPhase::Bound);
    assert!(is_condition_true(&b.status.conditions, API_EXPORT_VALID));
    assert!(is_condition_true(&b.status.conditions, BINDING_UP_TO_DATE));
    assert_eq!(b.status.bound_resources.len(), 1);
    assert_eq!(b.status.bound_resources[0].group, "example.io");
    assert_eq!(b.status.bound_resources[0].resource, "widgets");
    assert_eq!(b.status.bound_resources[0].schema_name, SCHEMA_NAME);
    let bound_export = b.status.bound_api_export.as_ref().unwrap();
    assert_eq!(bound_export.path.as_str(), "root:a");
    assert_eq!(bound_export.name, "e");
    assert_eq!(bound_export.identity_hash.as_deref(), Some("i1"));

    // Reconciling a converged binding changes nothing.
    let before = b.clone();
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(!requeue);
    assert_eq!(b, before);
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bind_waits_for_established() {
    let h = Harness::new(false);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(!requeue);
    assert_eq!(b.status.phase, BindingPhase::Binding);
    let condition = find_condition(&b.status.conditions, BINDING_UP_TO_DATE).unwrap();
    assert_eq!(condition.reason, REASON_WAITING_FOR_ESTABLISHED);
    assert!(b.status.bound_resources.is_empty());

    h.establish_crd(&widgets_crd_name());
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);
}

#[tokio::test]
async fn test_export_not_found() {
    let h = Harness::new(true);
    let mut b = binding("root:b", "b1", "root:a", "missing");
    b.status.bound_resources = vec![Default::default()];

    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(!requeue);
    let condition = find_condition(&b.status.conditions, API_EXPORT_VALID).unwrap();
    assert_eq!(condition.reason, REASON_API_EXPORT_NOT_FOUND);
    assert!(b.status.bound_resources.is_empty());
}

#[tokio::test]
async fn test_export_deleted_after_bound_keeps_definitions() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);

    h.exports.delete(&"root:a".into(), "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let condition = find_condition(&b.status.conditions, API_EXPORT_VALID).unwrap();
    assert_eq!(condition.reason, REASON_API_EXPORT_NOT_FOUND);
    assert!(b.status.bound_resources.is_empty());

    // The consumer's data stays served; removal is an administrative step.
    assert!(h
        .crds
        .get(&SYSTEM_BOUND_CRDS_CLUSTER.into(), &widgets_crd_name())
        .is_ok());
}

#[tokio::test]
async fn test_resolution_falls_back_to_global_cache() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.global_exports
        .apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);
}

#[tokio::test]
async fn test_naming_conflict_older_binding_wins() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.schemas.apply(widgets_schema("root:c", "rev-9.widgets.example.io"));
    h.exports.apply(export("root:a", "e1", &[SCHEMA_NAME], None));
    h.exports
        .apply(export("root:c", "e2", &["rev-9.widgets.example.io"], None));

    // b1 is older and already bound to widgets.example.io via e1.
    let mut b1 = binding("root:b", "b1", "root:a", "e1");
    b1.metadata = meta_at("root:b", "b1", 500);
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    assert_eq!(b1.status.phase, BindingPhase::Bound);
    h.bindings.apply(b1.clone());

    let mut b2 = binding("root:b", "b2", "root:c", "e2");
    b2.metadata = meta_at("root:b", "b2", 2000);
    h.bindings.apply(b2.clone());
    let calls_before = h.creator.create_calls.load(Ordering::SeqCst);
    let (requeue, result) = h.controller.reconcile(&mut b2).await;
    result.unwrap();
    assert!(!requeue);
    assert_eq!(b2.status.phase, BindingPhase::Binding);
    let condition = find_condition(&b2.status.conditions, BINDING_UP_TO_DATE).unwrap();
    assert_eq!(condition.reason, REASON_NAMING_CONFLICT);
    assert!(condition.message.contains("b1"));
    assert!(b2.status.bound_resources.is_empty());
    // The loser must not materialize the conflicting resource.
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), calls_before);

    // Deleting the winner unblocks the loser.
    h.bindings.delete(&"root:b".into(), "b1");
    let (_, result) = h.controller.reconcile(&mut b2).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b2).await;
    result.unwrap();
    assert_eq!(b2.status.phase, BindingPhase::Bound);
}

#[tokio::test]
async fn test_bindings_in_different_clusters_share_one_definition() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b1 = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    assert_eq!(b1.status.phase, BindingPhase::Bound);
    h.bindings.apply(b1);

    // A consumer in another cluster binds the same export: no conflict, no
    // second definition.
    let mut b2 = binding("root:c", "b2", "root:a", "e");
    h.bindings.apply(b2.clone());
    let (requeue, result) = h.controller.reconcile(&mut b2).await;
    result.unwrap();
    assert!(!requeue);
    assert_eq!(b2.status.phase, BindingPhase::Bound);
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_same_export_cannot_be_bound_twice_in_one_cluster() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b1 = binding("root:b", "b1", "root:a", "e");
    b1.metadata = meta_at("root:b", "b1", 500);
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b1).await;
    result.unwrap();
    assert_eq!(b1.status.phase, BindingPhase::Bound);
    h.bindings.apply(b1);

    let mut b2 = binding("root:b", "b2", "root:a", "e");
    b2.metadata = meta_at("root:b", "b2", 2000);
    let (_, result) = h.controller.reconcile(&mut b2).await;
    result.unwrap();
    assert_eq!(b2.status.phase, BindingPhase::Binding);
    let condition = find_condition(&b2.status.conditions, BINDING_UP_TO_DATE).unwrap();
    assert_eq!(condition.reason, REASON_NAMING_CONFLICT);
}

#[tokio::test]
async fn test_conflict_tie_break_prefers_earlier_creation() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e1", &[SCHEMA_NAME], None));

    // A younger sibling already claims the resource in status, but this
    // binding is older and keeps the claim.
    let mut younger = binding("root:b", "younger", "root:a", "e1");
    younger.metadata = meta_at("root:b", "younger", 2000);
    younger.status.bound_resources = vec![crate::api::binding::BoundResource {
        group: "example.io".to_string(),
        resource: "widgets".to_string(),
        schema_name: SCHEMA_NAME.to_string(),
    }];
    h.bindings.apply(younger);

    let mut older = binding("root:b", "older", "root:a", "e1");
    older.metadata = meta_at("root:b", "older", 500);
    let (_, result) = h.controller.reconcile(&mut older).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut older).await;
    result.unwrap();
    assert_eq!(older.status.phase, BindingPhase::Bound);
}

#[tokio::test]
async fn test_identity_change_demotes_and_rebinds() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports
        .apply(export("root:a", "e", &[SCHEMA_NAME], Some("i1")));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);

    // The export is re-created under the same name with a new identity and a
    // new schema revision.
    h.schemas.apply(widgets_schema("root:a", "rev-2.widgets.example.io"));
    h.exports
        .apply(export("root:a", "e", &["rev-2.widgets.example.io"], Some("i2")));

    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(requeue);
    assert_eq!(b.status.phase, BindingPhase::Binding);
    // Entries for schemas the new export no longer references are purged.
    assert!(b.status.bound_resources.is_empty());

    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);
    assert_eq!(
        b.status.bound_api_export.as_ref().unwrap().identity_hash.as_deref(),
        Some("i2")
    );
    assert_eq!(
        b.status.bound_resources[0].schema_name,
        "rev-2.widgets.example.io"
    );
}

#[tokio::test]
async fn test_permission_claims() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    let mut e = export("root:a", "e", &[SCHEMA_NAME], None);
    e.spec.permission_claims = vec![PermissionClaim {
        group: String::new(),
        resource: "configmaps".to_string(),
        identity_hash: None,
    }];
    h.exports.apply(e);

    // Claim not answered at all.
    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let condition = find_condition(&b.status.conditions, PERMISSION_CLAIMS_VALID).unwrap();
    assert_eq!(condition.reason, REASON_UNKNOWN_CLAIM);
    assert!(b.status.applied_permission_claims.is_empty());

    // Claim answered but rejected.
    b.spec.permission_claims = vec![AcceptablePermissionClaim {
        claim: PermissionClaim {
            group: String::new(),
            resource: "configmaps".to_string(),
            identity_hash: None,
        },
        state: PermissionClaimState::Rejected,
    }];
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let condition = find_condition(&b.status.conditions, PERMISSION_CLAIMS_VALID).unwrap();
    assert_eq!(condition.reason, REASON_CLAIM_NOT_ACCEPTED);

    // Claims never block binding itself.
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);

    // Accepted claims are applied.
    b.spec.permission_claims[0].state = PermissionClaimState::Accepted;
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(is_condition_true(
        &b.status.conditions,
        PERMISSION_CLAIMS_VALID
    ));
    assert_eq!(b.status.applied_permission_claims.len(), 1);
    assert_eq!(b.status.applied_permission_claims[0].resource, "configmaps");
}

#[tokio::test]
async fn test_stale_cache_delete_is_recreated() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), 1);

    // The definition is deleted server-side, but the cache still shows it.
    // The tracked deletion must force a recreate anyway.
    h.creator.server.lock().remove(&widgets_crd_name());
    h.controller.deleted_crd_tracker.add(&widgets_crd_name());

    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(requeue);
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), 2);
    assert!(!h.controller.deleted_crd_tracker.has(&widgets_crd_name()));

    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);
}

#[tokio::test]
async fn test_cache_observed_delete_is_recreated() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));
    h.bindings.apply(binding("root:b", "b1", "root:a", "e"));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert_eq!(b.status.phase, BindingPhase::Bound);

    // Cache and server agree the definition is gone; the delete handler
    // records the name so the next pass recreates it.
    h.creator.server.lock().remove(&widgets_crd_name());
    h.crds
        .delete(&SYSTEM_BOUND_CRDS_CLUSTER.into(), &widgets_crd_name());
    assert!(h.controller.deleted_crd_tracker.has(&widgets_crd_name()));

    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(requeue);
    assert!(h
        .crds
        .get(&SYSTEM_BOUND_CRDS_CLUSTER.into(), &widgets_crd_name())
        .is_ok());
    assert_eq!(h.creator.create_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_annotation_mismatch_is_fatal() {
    let h = Harness::new(true);
    h.schemas.apply(widgets_schema("root:a", SCHEMA_NAME));
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    // A definition already exists under the deterministic name but claims to
    // come from a different schema.
    let mut crd = widgets_schema("root:a", SCHEMA_NAME)
        .to_custom_resource_definition(&widgets_crd_name(), &SYSTEM_BOUND_CRDS_CLUSTER.into())
        .unwrap();
    crd.metadata
        .annotations
        .as_mut()
        .unwrap()
        .insert(ANNOTATION_SCHEMA_NAME.to_string(), "other-schema".to_string());
    h.crds.apply(crd);

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    // Fatal for this binding, but not an error to retry.
    result.unwrap();
    assert!(!requeue);
    let condition = find_condition(&b.status.conditions, BINDING_UP_TO_DATE).unwrap();
    assert_eq!(condition.reason, REASON_INTERNAL_ERROR);
}

#[tokio::test]
async fn test_missing_schema_marks_export_invalid() {
    let h = Harness::new(true);
    h.exports.apply(export("root:a", "e", &[SCHEMA_NAME], None));

    let mut b = binding("root:b", "b1", "root:a", "e");
    let (requeue, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    assert!(!requeue);
    let condition = find_condition(&b.status.conditions, API_EXPORT_VALID).unwrap();
    assert_eq!(condition.reason, REASON_INTERNAL_ERROR);
}

#[tokio::test]
async fn test_missing_reference_reports_not_found() {
    let h = Harness::new(true);
    let mut b = binding("root:b", "b1", "root:a", "e");
    b.spec.reference = BindingReference::default();

    let (_, result) = h.controller.reconcile(&mut b).await;
    result.unwrap();
    let condition = find_condition(&b.status.conditions, API_EXPORT_VALID).unwrap();
    assert_eq!(condition.reason, REASON_API_EXPORT_NOT_FOUND);
}
