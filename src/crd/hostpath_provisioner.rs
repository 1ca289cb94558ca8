//! HostPathProvisioner CRD
//!
//! Cluster-scoped singleton describing how the hostpath provisioner is
//! deployed: either a single legacy path on every node, or a list of storage
//! pools backed by per-node claims.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Toleration,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer that holds the CR until cluster-scoped objects are removed
pub const FINALIZER: &str = "finalizer.delete.hostpath-provisioner";

/// Feature gate that adds the CSI snapshotter sidecar and its RBAC
pub const SNAPSHOTTING_FEATURE_GATE: &str = "Snapshotting";

/// Pool name reported for legacy path configurations
pub const LEGACY_POOL_NAME: &str = "legacy";

// =============================================================================
// HostPathProvisioner CRD
// =============================================================================

/// HostPathProvisioner is the desired configuration of the provisioner
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hostpathprovisioner.kubevirt.io",
    version = "v1beta1",
    kind = "HostPathProvisioner",
    plural = "hostpathprovisioners",
    shortname = "hpp",
    status = "HostPathProvisionerStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Observed", "type": "string", "jsonPath": ".status.observedVersion"}"#,
    printcolumn = r#"{"name": "Target", "type": "string", "jsonPath": ".status.targetVersion"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostPathProvisionerSpec {
    /// Pull policy of every managed container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Deprecated single path configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_config: Option<PathConfig>,

    /// Storage pools served by the CSI driver
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_pools: Vec<StoragePool>,

    /// Placement of the provisioner daemon pods
    #[serde(default)]
    pub workload: NodePlacement,

    /// Enabled feature gates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,

    /// Do not register the CSI driver object
    #[serde(default)]
    pub disable_csi: bool,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Legacy host path shared by all volumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathConfig {
    /// Path on the host where volumes are created
    #[serde(default)]
    pub path: String,

    /// Prefix volume directories with the claim namespace and name
    #[serde(default)]
    pub use_naming_prefix: bool,
}

/// A named unit of per-node storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    /// Pool name, unique within the CR
    #[serde(default)]
    pub name: String,

    /// Host path the pool is mounted at
    #[serde(default)]
    pub path: String,

    /// Claim created on every node and mounted at `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_template: Option<PersistentVolumeClaimSpec>,

    /// Claim bound to a named storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<SourceStorageClass>,
}

/// Claim template bound to a named storage class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStorageClass {
    /// Storage class of the per-node claims
    pub name: String,

    /// Access modes, size and volume mode of the claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_template: Option<PersistentVolumeClaimSpec>,
}

/// Scheduling constraints of the provisioner pods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the HostPathProvisioner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostPathProvisionerStatus {
    /// Available, Progressing and Degraded conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Version of the running operator
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_version: String,

    /// Version being deployed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_version: String,

    /// Version fully rolled out
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_version: String,

    /// One entry per configured pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_pool_statuses: Vec<StoragePoolStatus>,
}

/// Condition types reported on the CR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Available => write!(f, "Available"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Status condition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last change of any field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Last change of `status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Storage pool lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StoragePoolPhase {
    #[default]
    Pending,
    Ready,
}

impl std::fmt::Display for StoragePoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoragePoolPhase::Pending => write!(f, "Pending"),
            StoragePoolPhase::Ready => write!(f, "Ready"),
        }
    }
}

/// Status of one storage pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePoolStatus {
    pub name: String,

    #[serde(default)]
    pub phase: StoragePoolPhase,

    /// Number of per-node Deployments of the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_ready: Option<i32>,

    /// Number of per-node Deployments with a ready pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ready: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claim_statuses: Vec<ClaimStatus>,
}

/// Status of one per-node claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    pub name: String,
    #[serde(default)]
    pub status: PersistentVolumeClaimStatus,
}

// =============================================================================
// Implementations
// =============================================================================

impl HostPathProvisioner {
    /// Legacy mode deploys the non CSI provisioner for a single path
    pub fn is_legacy(&self) -> bool {
        self.spec.path_config.is_some()
    }

    pub fn is_feature_gate_enabled(&self, gate: &str) -> bool {
        self.spec.feature_gates.iter().any(|g| g == gate)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Pull policy for managed containers
    pub fn pull_policy(&self) -> String {
        self.spec
            .image_pull_policy
            .clone()
            .unwrap_or_else(|| "IfNotPresent".to_string())
    }

    /// Status, or an empty one
    pub fn status_or_default(&self) -> HostPathProvisionerStatus {
        self.status.clone().unwrap_or_default()
    }
}

impl StoragePool {
    /// Claim spec used for the per-node claims, if the pool is templated
    pub fn claim_template(&self) -> Option<PersistentVolumeClaimSpec> {
        if let Some(template) = &self.pvc_template {
            return Some(template.clone());
        }
        self.storage_class.as_ref().map(|sc| {
            let mut template = sc.pvc_template.clone().unwrap_or_default();
            template.storage_class_name = Some(sc.name.clone());
            template
        })
    }

    pub fn is_templated(&self) -> bool {
        self.pvc_template.is_some() || self.storage_class.is_some()
    }

    /// True when the claims are raw block devices
    pub fn is_block(&self) -> bool {
        self.claim_template()
            .and_then(|t| t.volume_mode)
            .map_or(false, |mode| mode == "Block")
    }
}

impl HostPathProvisionerStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        let wanted = condition_type.to_string();
        self.conditions.iter().find(|c| c.r#type == wanted)
    }

    pub fn is_condition_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type)
            .map_or(false, |c| c.status == "True")
    }

    /// Upsert a condition by type.
    ///
    /// Timestamps only move when the condition actually changes, so a pass
    /// that changes nothing produces an identical status.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        let wanted = condition_type.to_string();
        let status = if status { "True" } else { "False" }.to_string();

        match self.conditions.iter_mut().find(|c| c.r#type == wanted) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = Some(now);
                    existing.last_heartbeat_time = Some(now);
                }
                if existing.reason.as_deref() != Some(reason)
                    || existing.message.as_deref() != Some(message)
                {
                    existing.reason = Some(reason.to_string());
                    existing.message = Some(message.to_string());
                    existing.last_heartbeat_time = Some(now);
                }
            }
            None => self.conditions.push(Condition {
                r#type: wanted,
                status,
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_heartbeat_time: Some(now),
                last_transition_time: Some(now),
            }),
        }
    }
}
