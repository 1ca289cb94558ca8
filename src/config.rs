//! Operator configuration
//!
//! Container images, install labels and monitoring settings are taken from the
//! operator's environment. Every value has a default so an unconfigured
//! operator still deploys a working provisioner.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

// =============================================================================
// Labels
// =============================================================================

/// Label selecting every pod of the provisioner
pub const K8S_APP_LABEL: &str = "k8s-app";
/// Value of [`K8S_APP_LABEL`] on provisioner objects
pub const K8S_APP_VALUE: &str = "hostpath-provisioner";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "hostpath-provisioner-operator";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const COMPONENT_VALUE: &str = "storage";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";

/// Label marking objects scraped by Prometheus
pub const PROMETHEUS_LABEL_KEY: &str = "prometheus.hostpathprovisioner.kubevirt.io";
pub const PROMETHEUS_LABEL_VALUE: &str = "true";

/// Label carrying the shortened storage pool name
pub const STORAGE_POOL_LABEL: &str = "kubevirt.io.hostpath-provisioner/storagePool";

// =============================================================================
// Environment
// =============================================================================

pub const OPERATOR_IMAGE_ENV: &str = "OPERATOR_IMAGE";
pub const PROVISIONER_IMAGE_ENV: &str = "PROVISIONER_IMAGE";
pub const CSI_PROVISIONER_IMAGE_ENV: &str = "CSI_PROVISIONER_IMAGE";
pub const NODE_DRIVER_REG_IMAGE_ENV: &str = "NODE_DRIVER_REG_IMAGE";
pub const LIVENESS_PROBE_IMAGE_ENV: &str = "LIVENESS_PROBE_IMAGE";
pub const CSI_SNAPSHOT_IMAGE_ENV: &str = "CSI_SNAPSHOT_IMAGE";
pub const EXTERNAL_PROVISIONER_IMAGE_ENV: &str = "CSI_SIG_STORAGE_PROVISIONER_IMAGE";
pub const VERBOSITY_ENV: &str = "VERBOSITY";
pub const PART_OF_ENV: &str = "INSTALLER_PART_OF_LABEL";
pub const VERSION_ENV: &str = "INSTALLER_VERSION_LABEL";
pub const MONITORING_NAMESPACE_ENV: &str = "MONITORING_NAMESPACE";
pub const RUNBOOK_URL_TEMPLATE_ENV: &str = "RUNBOOK_URL_TEMPLATE";

const DEFAULT_OPERATOR_IMAGE: &str = "quay.io/kubevirt/hostpath-provisioner-operator:latest";
const DEFAULT_PROVISIONER_IMAGE: &str = "quay.io/kubevirt/hostpath-provisioner:latest";
const DEFAULT_CSI_PROVISIONER_IMAGE: &str = "quay.io/kubevirt/hostpath-csi-driver:latest";
const DEFAULT_NODE_DRIVER_REG_IMAGE: &str =
    "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.9.0";
const DEFAULT_LIVENESS_PROBE_IMAGE: &str = "registry.k8s.io/sig-storage/livenessprobe:v2.11.0";
const DEFAULT_CSI_SNAPSHOT_IMAGE: &str = "registry.k8s.io/sig-storage/csi-snapshotter:v6.3.0";
const DEFAULT_EXTERNAL_PROVISIONER_IMAGE: &str =
    "registry.k8s.io/sig-storage/csi-provisioner:v3.6.0";
const DEFAULT_VERBOSITY: &str = "3";
const DEFAULT_MONITORING_NAMESPACE: &str = "monitoring";
const DEFAULT_RUNBOOK_URL_TEMPLATE: &str = "https://kubevirt.io/monitoring/runbooks/%s";

/// Container images used by the managed workloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    /// Operator image, also runs the storage pool mounter
    pub operator: String,
    /// Legacy (non CSI) provisioner
    pub provisioner: String,
    /// CSI driver
    pub csi_provisioner: String,
    pub node_driver_registrar: String,
    pub liveness_probe: String,
    pub csi_snapshotter: String,
    /// External provisioner sidecar
    pub external_provisioner: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            operator: DEFAULT_OPERATOR_IMAGE.to_string(),
            provisioner: DEFAULT_PROVISIONER_IMAGE.to_string(),
            csi_provisioner: DEFAULT_CSI_PROVISIONER_IMAGE.to_string(),
            node_driver_registrar: DEFAULT_NODE_DRIVER_REG_IMAGE.to_string(),
            liveness_probe: DEFAULT_LIVENESS_PROBE_IMAGE.to_string(),
            csi_snapshotter: DEFAULT_CSI_SNAPSHOT_IMAGE.to_string(),
            external_provisioner: DEFAULT_EXTERNAL_PROVISIONER_IMAGE.to_string(),
        }
    }
}

/// Environment driven operator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub images: Images,
    /// Log verbosity passed to the CSI sidecars
    pub verbosity: String,
    /// Value of `app.kubernetes.io/part-of`, omitted when empty
    pub part_of: String,
    /// Value of `app.kubernetes.io/version`, omitted when empty
    pub version_label: String,
    /// Namespace of the Prometheus service account granted scrape access
    pub monitoring_namespace: String,
    /// Runbook URL with a single `%s` for the alert name
    pub runbook_url_template: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            images: Images::default(),
            verbosity: DEFAULT_VERBOSITY.to_string(),
            part_of: String::new(),
            version_label: String::new(),
            monitoring_namespace: DEFAULT_MONITORING_NAMESPACE.to_string(),
            runbook_url_template: DEFAULT_RUNBOOK_URL_TEMPLATE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            images: Images {
                operator: get(OPERATOR_IMAGE_ENV, DEFAULT_OPERATOR_IMAGE),
                provisioner: get(PROVISIONER_IMAGE_ENV, DEFAULT_PROVISIONER_IMAGE),
                csi_provisioner: get(CSI_PROVISIONER_IMAGE_ENV, DEFAULT_CSI_PROVISIONER_IMAGE),
                node_driver_registrar: get(NODE_DRIVER_REG_IMAGE_ENV, DEFAULT_NODE_DRIVER_REG_IMAGE),
                liveness_probe: get(LIVENESS_PROBE_IMAGE_ENV, DEFAULT_LIVENESS_PROBE_IMAGE),
                csi_snapshotter: get(CSI_SNAPSHOT_IMAGE_ENV, DEFAULT_CSI_SNAPSHOT_IMAGE),
                external_provisioner: get(
                    EXTERNAL_PROVISIONER_IMAGE_ENV,
                    DEFAULT_EXTERNAL_PROVISIONER_IMAGE,
                ),
            },
            verbosity: get(VERBOSITY_ENV, DEFAULT_VERBOSITY),
            part_of: get(PART_OF_ENV, ""),
            version_label: get(VERSION_ENV, ""),
            monitoring_namespace: get(MONITORING_NAMESPACE_ENV, DEFAULT_MONITORING_NAMESPACE),
            runbook_url_template: get(RUNBOOK_URL_TEMPLATE_ENV, DEFAULT_RUNBOOK_URL_TEMPLATE),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the environment cannot express
    pub fn validate(&self) -> Result<()> {
        if self.runbook_url_template.matches("%s").count() != 1 {
            return Err(Error::Configuration(format!(
                "{} must contain exactly one %s, got {:?}",
                RUNBOOK_URL_TEMPLATE_ENV, self.runbook_url_template
            )));
        }
        Ok(())
    }

    /// Runbook URL of an alert
    pub fn runbook_url(&self, alert: &str) -> String {
        self.runbook_url_template.replacen("%s", alert, 1)
    }

    /// Labels carried by every object the operator creates
    pub fn recommended_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (K8S_APP_LABEL.to_string(), K8S_APP_VALUE.to_string()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        ]);
        if !self.part_of.is_empty() {
            labels.insert(PART_OF_LABEL.to_string(), self.part_of.clone());
        }
        if !self.version_label.is_empty() {
            labels.insert(VERSION_LABEL.to_string(), self.version_label.clone());
        }
        labels
    }

    /// Recommended labels plus the Prometheus scrape label
    pub fn prometheus_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.recommended_labels();
        labels.insert(
            PROMETHEUS_LABEL_KEY.to_string(),
            PROMETHEUS_LABEL_VALUE.to_string(),
        );
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.monitoring_namespace, "monitoring");

        let labels = config.recommended_labels();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[K8S_APP_LABEL], "hostpath-provisioner");
        assert!(!labels.contains_key(PART_OF_LABEL));
    }

    #[test]
    fn test_overrides() {
        let config = OperatorConfig::from_lookup(lookup(&[
            (OPERATOR_IMAGE_ENV, "registry/operator:v1"),
            (PART_OF_ENV, "kubevirt"),
            (VERSION_ENV, "1.0.0"),
            (VERBOSITY_ENV, "5"),
        ]))
        .unwrap();

        assert_eq!(config.images.operator, "registry/operator:v1");
        assert_eq!(config.verbosity, "5");
        let labels = config.recommended_labels();
        assert_eq!(labels[PART_OF_LABEL], "kubevirt");
        assert_eq!(labels[VERSION_LABEL], "1.0.0");
        assert_eq!(config.prometheus_labels()[PROMETHEUS_LABEL_KEY], "true");
    }

    #[test]
    fn test_runbook_template() {
        let config = OperatorConfig::default();
        assert_eq!(
            config.runbook_url("HPPOperatorDown"),
            "https://kubevirt.io/monitoring/runbooks/HPPOperatorDown"
        );

        let err = OperatorConfig::from_lookup(lookup(&[(
            RUNBOOK_URL_TEMPLATE_ENV,
            "https://example.com/%s/%s",
        )]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(OperatorConfig::from_lookup(lookup(&[(RUNBOOK_URL_TEMPLATE_ENV, "https://example.com")])).is_err());
    }
}
