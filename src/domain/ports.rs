//! Domain Ports - boundaries between the reconciler and the cluster
//!
//! The reconciler never talks to the API server directly. It reads and writes
//! objects through [`ObjectStore`], reports progress through [`EventSink`] and
//! learns its namespace and version from injected providers. Adapters for a
//! real cluster live in `store::cluster` and `controlplane::runtime`; in-memory
//! adapters back the tests.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Resource Kinds
// =============================================================================

/// Every kind the operator reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    HostPathProvisioner,
    DaemonSet,
    Deployment,
    Pod,
    Node,
    Job,
    PersistentVolumeClaim,
    ServiceAccount,
    Service,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    CsiDriver,
    SecurityContextConstraints,
    PrometheusRule,
    ServiceMonitor,
}

impl ResourceKind {
    /// API group, empty for the core group
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::HostPathProvisioner => "hostpathprovisioner.kubevirt.io",
            ResourceKind::DaemonSet | ResourceKind::Deployment => "apps",
            ResourceKind::Job => "batch",
            ResourceKind::ClusterRole
            | ResourceKind::ClusterRoleBinding
            | ResourceKind::Role
            | ResourceKind::RoleBinding => "rbac.authorization.k8s.io",
            ResourceKind::CsiDriver => "storage.k8s.io",
            ResourceKind::SecurityContextConstraints => "security.openshift.io",
            ResourceKind::PrometheusRule | ResourceKind::ServiceMonitor => "monitoring.coreos.com",
            ResourceKind::Pod
            | ResourceKind::Node
            | ResourceKind::PersistentVolumeClaim
            | ResourceKind::ServiceAccount
            | ResourceKind::Service => "",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            ResourceKind::HostPathProvisioner => "v1beta1",
            _ => "v1",
        }
    }

    /// `group/version`, or just the version for the core group
    pub fn api_version(&self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{}/{}", group, self.version()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::HostPathProvisioner => "HostPathProvisioner",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Pod => "Pod",
            ResourceKind::Node => "Node",
            ResourceKind::Job => "Job",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Service => "Service",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::CsiDriver => "CSIDriver",
            ResourceKind::SecurityContextConstraints => "SecurityContextConstraints",
            ResourceKind::PrometheusRule => "PrometheusRule",
            ResourceKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    /// Lowercase plural used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::HostPathProvisioner => "hostpathprovisioners",
            ResourceKind::DaemonSet => "daemonsets",
            ResourceKind::Deployment => "deployments",
            ResourceKind::Pod => "pods",
            ResourceKind::Node => "nodes",
            ResourceKind::Job => "jobs",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::ServiceAccount => "serviceaccounts",
            ResourceKind::Service => "services",
            ResourceKind::ClusterRole => "clusterroles",
            ResourceKind::ClusterRoleBinding => "clusterrolebindings",
            ResourceKind::Role => "roles",
            ResourceKind::RoleBinding => "rolebindings",
            ResourceKind::CsiDriver => "csidrivers",
            ResourceKind::SecurityContextConstraints => "securitycontextconstraints",
            ResourceKind::PrometheusRule => "prometheusrules",
            ResourceKind::ServiceMonitor => "servicemonitors",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::HostPathProvisioner
                | ResourceKind::Node
                | ResourceKind::ClusterRole
                | ResourceKind::ClusterRoleBinding
                | ResourceKind::CsiDriver
                | ResourceKind::SecurityContextConstraints
        )
    }

    /// Kinds served by optional API groups, probed before use
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            ResourceKind::SecurityContextConstraints
                | ResourceKind::PrometheusRule
                | ResourceKind::ServiceMonitor
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

// =============================================================================
// Keys and Selectors
// =============================================================================

/// Namespace and name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Equality based list filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    /// Restrict to one namespace, `None` lists across namespaces
    pub namespace: Option<String>,
    /// Every label must match exactly
    pub labels: BTreeMap<String, String>,
    /// Stop after this many items
    pub limit: Option<u32>,
}

impl ListSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Label selector string understood by the API server
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Whether an object's labels satisfy the selector
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// Garbage collection policy for dependents of a deleted object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePropagation {
    #[default]
    Default,
    Background,
    Foreground,
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Untyped CRUD access to cluster objects.
///
/// Objects are full JSON documents including `apiVersion` and `kind`.
/// `get` returns `None` for a missing object. Listing a kind whose API group
/// is not served fails with [`crate::Error::CapabilityAbsent`]. Writes
/// against a stale `resourceVersion` fail with [`crate::Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Option<Value>>;

    async fn list(&self, kind: ResourceKind, selector: &ListSelector) -> Result<Vec<Value>>;

    async fn create(&self, kind: ResourceKind, obj: Value) -> Result<Value>;

    async fn update(&self, kind: ResourceKind, obj: Value) -> Result<Value>;

    /// Write only the status subresource
    async fn update_status(&self, kind: ResourceKind, obj: Value) -> Result<Value>;

    /// Returns `false` when the object did not exist
    async fn delete(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> Result<bool>;
}

// =============================================================================
// Event Sink Port
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// A Kubernetes event about the custom resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl OperatorEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Destination of events about the custom resource
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event regarding `regarding`. Failures are logged, not returned.
    async fn publish(&self, regarding: &ObjectReference, event: OperatorEvent);
}

// =============================================================================
// Providers
// =============================================================================

/// Supplies the namespace the operator installs into
pub trait NamespaceProvider: Send + Sync {
    fn namespace(&self) -> Result<String>;
}

/// Supplies the version the operator is deploying
pub trait VersionProvider: Send + Sync {
    fn version(&self) -> Result<String>;
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type EventSinkRef = Arc<dyn EventSink>;
pub type NamespaceProviderRef = Arc<dyn NamespaceProvider>;
pub type VersionProviderRef = Arc<dyn VersionProvider>;
