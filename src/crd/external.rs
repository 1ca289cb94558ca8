//! Third-party resource types
//!
//! OpenShift security context constraints and the Prometheus operator's rule
//! and monitor resources. Only the fields the operator writes are modelled;
//! their API groups may be absent from a cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// SecurityContextConstraints
// =============================================================================

/// OpenShift `security.openshift.io/v1` SecurityContextConstraints.
///
/// The kind has no spec, its settings live at the top level, so it is
/// described by hand rather than derived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConstraints {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub allow_privileged_container: bool,
    #[serde(default)]
    pub allow_host_dir_volume_plugin: bool,
    #[serde(default, rename = "allowHostIPC")]
    pub allow_host_ipc: bool,
    #[serde(default)]
    pub allow_host_network: bool,
    #[serde(default, rename = "allowHostPID")]
    pub allow_host_pid: bool,
    #[serde(default)]
    pub allow_host_ports: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default)]
    pub required_drop_capabilities: Vec<String>,
    #[serde(default)]
    pub run_as_user: StrategyOptions,
    #[serde(default, rename = "seLinuxContext")]
    pub se_linux_context: StrategyOptions,
    #[serde(default)]
    pub fs_group: StrategyOptions,
    #[serde(default)]
    pub supplemental_groups: StrategyOptions,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Strategy of one SCC setting, e.g. `RunAsAny`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptions {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

impl StrategyOptions {
    pub fn run_as_any() -> Self {
        Self {
            type_: Some("RunAsAny".to_string()),
        }
    }
}

impl k8s_openapi::Resource for SecurityContextConstraints {
    const API_VERSION: &'static str = "security.openshift.io/v1";
    const GROUP: &'static str = "security.openshift.io";
    const KIND: &'static str = "SecurityContextConstraints";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "securitycontextconstraints";
    type Scope = k8s_openapi::ClusterResourceScope;
}

impl k8s_openapi::Metadata for SecurityContextConstraints {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// =============================================================================
// PrometheusRule
// =============================================================================

/// Recording and alerting rules evaluated by Prometheus
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
pub struct PrometheusRuleSpec {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A recording rule sets `record`, an alerting rule sets `alert`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// ServiceMonitor
// =============================================================================

/// Tells Prometheus which services to scrape
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    plural = "servicemonitors",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default)]
    pub match_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_scc_resource_identity() {
        assert_eq!(
            SecurityContextConstraints::api_version(&()),
            "security.openshift.io/v1"
        );
        assert_eq!(
            SecurityContextConstraints::kind(&()),
            "SecurityContextConstraints"
        );
    }

    #[test]
    fn test_scc_serialization() {
        let scc = SecurityContextConstraints {
            allow_host_ipc: false,
            se_linux_context: StrategyOptions::run_as_any(),
            ..Default::default()
        };
        let value = serde_json::to_value(&scc).unwrap();
        assert_eq!(value["seLinuxContext"]["type"], "RunAsAny");
        assert_eq!(value["allowHostIPC"], false);
    }

    #[test]
    fn test_monitoring_kinds() {
        assert_eq!(PrometheusRule::api_version(&()), "monitoring.coreos.com/v1");
        assert_eq!(ServiceMonitor::plural(&()), "servicemonitors");
    }
}
