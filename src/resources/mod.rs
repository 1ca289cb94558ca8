//! Resource Reconcilers
//!
//! One module per family of objects the operator owns. Every reconciler
//! builds the desired objects for the current custom resource and hands them
//! to [`apply`], which creates, merges or leaves them alone.
//!
//! Reconcilers run in a fixed order within a pass:
//! daemon sets, service accounts, cluster roles, cluster role bindings,
//! roles, role bindings, CSI driver, security context constraints and
//! monitoring. The storage pool fleet runs after them, once the CSI daemon
//! pods it follows exist.

pub mod apply;
pub mod csi_driver;
pub mod daemonset;
pub mod monitoring;
pub mod rbac;
pub mod scc;
pub mod service_account;
pub mod storage_pool;

use crate::config::OperatorConfig;
use crate::crd::HostPathProvisioner;
use crate::domain::{EventSinkRef, ObjectKey, OperatorEvent, ResourceKind};
use crate::error::{Error, Result};
use crate::store::Store;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::sync::Arc;

pub use apply::{apply, apply_with, remove, ApplyOutcome};

// =============================================================================
// Fixed object names
// =============================================================================

/// Legacy DaemonSet, ClusterRole, ClusterRoleBinding and SCC
pub const PROVISIONER_NAME: &str = "hostpath-provisioner";
/// CSI DaemonSet and SCC
pub const CSI_PROVISIONER_NAME: &str = "hostpath-provisioner-csi";
/// Service account of the legacy provisioner
pub const ADMIN_SERVICE_ACCOUNT: &str = "hostpath-provisioner-admin";
/// Service account, roles and bindings of the CSI driver
pub const ADMIN_CSI_SERVICE_ACCOUNT: &str = "hostpath-provisioner-admin-csi";
/// Service account of the operator's own health check, never cleaned up
pub const HEALTH_CHECK_NAME: &str = "hostpath-provisioner-health-check";
/// Name the CSI driver registers with the kubelet
pub const DRIVER_NAME: &str = "kubevirt.io.hostpath-provisioner";

// =============================================================================
// Event reasons
// =============================================================================

pub const CREATE_RESOURCE_SUCCESS: &str = "CreateResourceSuccess";
pub const CREATE_RESOURCE_FAILED: &str = "CreateResourceFailed";
pub const UPDATE_RESOURCE_SUCCESS: &str = "UpdateResourceSuccess";
pub const UPDATE_RESOURCE_FAILED: &str = "UpdateResourceFailed";

// =============================================================================
// Resource Context
// =============================================================================

/// Everything a reconciler needs during one pass
#[derive(Clone)]
pub struct ResourceContext {
    pub store: Store,
    pub config: Arc<OperatorConfig>,
    pub events: EventSinkRef,
    /// Install namespace of namespaced objects
    pub namespace: String,
    /// The custom resource being reconciled
    pub cr: HostPathProvisioner,
}

impl ResourceContext {
    pub fn new(
        store: Store,
        config: Arc<OperatorConfig>,
        events: EventSinkRef,
        namespace: impl Into<String>,
        cr: HostPathProvisioner,
    ) -> Self {
        Self {
            store,
            config,
            events,
            namespace: namespace.into(),
            cr,
        }
    }

    /// Controller reference pointing at the custom resource
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        self.cr.controller_owner_ref(&()).ok_or_else(|| {
            Error::Internal(format!("{} has no uid, cannot own objects", self.cr.name_any()))
        })
    }

    /// Reference events are attached to
    pub fn object_reference(&self) -> ObjectReference {
        self.cr.object_ref(&())
    }

    pub async fn publish(&self, event: OperatorEvent) {
        self.events.publish(&self.object_reference(), event).await;
    }

    /// Key of a namespaced object in the install namespace
    pub fn namespaced_key(&self, name: &str) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, name)
    }

    /// Key of `name` for kind `kind`, namespaced when the kind is
    pub fn key_for(&self, kind: ResourceKind, name: &str) -> ObjectKey {
        if kind.namespaced() {
            self.namespaced_key(name)
        } else {
            ObjectKey::cluster(name)
        }
    }

    /// Version the workloads are being deployed at
    pub fn target_version(&self) -> String {
        self.cr
            .status
            .as_ref()
            .map(|s| s.target_version.clone())
            .unwrap_or_default()
    }
}

/// Whether an object is owned by a HostPathProvisioner named `cr_name`
pub fn is_owned_by(meta: &ObjectMeta, cr_name: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.kind == "HostPathProvisioner" && r.name == cr_name)
}

/// Whether the controller owner reference of `meta` points at `uid`
pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Metadata for a desired object
pub(crate) fn object_meta(
    name: &str,
    namespace: Option<&str>,
    labels: std::collections::BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by reconciler tests

    use super::*;
    use crate::controlplane::events::MemoryEventSink;
    use crate::crd::{HostPathProvisionerSpec, HostPathProvisionerStatus, PathConfig, StoragePool};
    use crate::store::MemoryObjectStore;

    pub const NAMESPACE: &str = "hpp";
    pub const CR_NAME: &str = "hostpath-provisioner";

    pub struct Fixture {
        pub memory: Arc<MemoryObjectStore>,
        pub events: Arc<MemoryEventSink>,
        pub ctx: ResourceContext,
    }

    pub fn legacy_spec() -> HostPathProvisionerSpec {
        HostPathProvisionerSpec {
            path_config: Some(PathConfig {
                path: "/var/hpvolumes".into(),
                use_naming_prefix: false,
            }),
            ..Default::default()
        }
    }

    pub fn pool_spec() -> HostPathProvisionerSpec {
        HostPathProvisionerSpec {
            storage_pools: vec![StoragePool {
                name: "local".into(),
                path: "/var/hpvolumes".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Store, event sink and context for a CR stored with a uid
    pub async fn fixture(spec: HostPathProvisionerSpec) -> Fixture {
        let memory = Arc::new(MemoryObjectStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let store = Store::new(memory.clone());

        let mut cr = HostPathProvisioner::new(CR_NAME, spec);
        cr.status = Some(HostPathProvisionerStatus {
            target_version: "1.0.0".into(),
            ..Default::default()
        });
        let cr = store.create(&cr).await.unwrap();

        let ctx = ResourceContext::new(
            store,
            Arc::new(OperatorConfig::default()),
            events.clone(),
            NAMESPACE,
            cr,
        );
        Fixture {
            memory,
            events,
            ctx,
        }
    }
}
