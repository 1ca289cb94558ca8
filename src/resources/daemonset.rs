//! Provisioner DaemonSets
//!
//! The CSI driver DaemonSet runs on every selected node. In legacy mode the
//! old single-path provisioner DaemonSet runs next to it; outside legacy mode
//! that DaemonSet is removed.

use super::{
    apply, is_owned_by, object_meta, remove, ResourceContext, ADMIN_CSI_SERVICE_ACCOUNT,
    ADMIN_SERVICE_ACCOUNT, CSI_PROVISIONER_NAME, DRIVER_NAME, PROVISIONER_NAME,
};
use crate::config::{K8S_APP_LABEL, K8S_APP_VALUE, PART_OF_LABEL, VERSION_LABEL};
use crate::crd::{HostPathProvisioner, LEGACY_POOL_NAME, SNAPSHOTTING_FEATURE_GATE};
use crate::domain::ListSelector;
use crate::error::{Error, Result};
use crate::naming::pool_mount_name;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, HostPathVolumeSource,
    ObjectFieldSelector, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const CSI_SOCKET: &str = "/csi/csi.sock";
const NODE_DRIVER_REGISTRAR_NAME: &str = "node-driver-registrar";
/// Pod annotation naming the SCC the CSI pods must run under
pub const REQUIRED_SCC_ANNOTATION: &str = "openshift.io/required-scc";

/// Reconcile both DaemonSets, cleaning up leftovers of older naming first
pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    for name in duplicate_daemon_sets(ctx).await? {
        info!(%name, namespace = %ctx.namespace, "Deleting extra daemon set");
        remove::<DaemonSet>(ctx, &name).await?;
    }

    if ctx.cr.is_legacy() {
        apply_daemon_set(ctx, legacy_daemon_set(ctx)).await?;
    } else {
        remove::<DaemonSet>(ctx, PROVISIONER_NAME).await?;
    }
    apply_daemon_set(ctx, csi_daemon_set(ctx)).await
}

/// Names of the DaemonSets the readiness check looks at
pub fn managed_daemon_set_names(cr: &HostPathProvisioner) -> Vec<&'static str> {
    if cr.is_legacy() {
        vec![PROVISIONER_NAME, CSI_PROVISIONER_NAME]
    } else {
        vec![CSI_PROVISIONER_NAME]
    }
}

/// Apply with the selector guard.
///
/// A live DaemonSet whose selector differs from ours is deleted and the pass
/// fails, the next pass recreates it with the right selector.
async fn apply_daemon_set(ctx: &ResourceContext, desired: DaemonSet) -> Result<()> {
    let name = desired.name_any();
    let key = ctx.namespaced_key(&name);
    if let Some(current) = ctx.store.get::<DaemonSet>(&key).await? {
        let wanted = desired.spec.as_ref().map(|s| &s.selector.match_labels);
        let live = current.spec.as_ref().map(|s| &s.selector.match_labels);
        if wanted != live {
            warn!(%name, "DaemonSet selector changed, deleting it");
            remove::<DaemonSet>(ctx, &name).await?;
            return Err(Error::SelectorDrift {
                kind: "DaemonSet".to_string(),
                name,
            });
        }
    }
    apply(ctx, desired).await?;
    Ok(())
}

/// DaemonSets labelled for this provisioner and owned by the CR that do not
/// use one of the fixed names
async fn duplicate_daemon_sets(ctx: &ResourceContext) -> Result<BTreeSet<String>> {
    let cr_name = ctx.cr.name_any();
    let mut dups = BTreeSet::new();
    for app in [K8S_APP_VALUE, cr_name.as_str()] {
        let selector = ListSelector::in_namespace(&ctx.namespace).with_label(K8S_APP_LABEL, app);
        for ds in ctx.store.list::<DaemonSet>(&selector).await? {
            let name = ds.name_any();
            if name != PROVISIONER_NAME
                && name != CSI_PROVISIONER_NAME
                && is_owned_by(&ds.metadata, &cr_name)
            {
                dups.insert(name);
            }
        }
    }
    Ok(dups)
}

// =============================================================================
// Desired objects
// =============================================================================

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(K8S_APP_LABEL.to_string(), K8S_APP_VALUE.to_string())])
}

fn update_strategy() -> DaemonSetUpdateStrategy {
    DaemonSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDaemonSet {
            max_unavailable: Some(IntOrString::String("10%".to_string())),
            max_surge: Some(IntOrString::Int(0)),
        }),
    }
}

/// Legacy single-path provisioner
pub fn legacy_daemon_set(ctx: &ResourceContext) -> DaemonSet {
    let cr = &ctx.cr;
    let labels = ctx.config.recommended_labels();
    let (path, use_prefix) = cr
        .spec
        .path_config
        .as_ref()
        .map(|p| (p.path.clone(), p.use_naming_prefix))
        .unwrap_or_default();

    let container = Container {
        name: PROVISIONER_NAME.to_string(),
        image: Some(ctx.config.images.provisioner.clone()),
        image_pull_policy: Some(cr.pull_policy()),
        resources: Some(requests("10m", "150Mi")),
        env: Some(vec![
            value_env("USE_NAMING_PREFIX", &use_prefix.to_string()),
            field_env("NODE_NAME", "spec.nodeName"),
            value_env("PV_DIR", &path),
            field_env(
                "INSTALLER_PART_OF_LABEL",
                &format!("metadata.labels['{}']", PART_OF_LABEL),
            ),
            field_env(
                "INSTALLER_VERSION_LABEL",
                &format!("metadata.labels['{}']", VERSION_LABEL),
            ),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "pv-volume".to_string(),
            mount_path: path.clone(),
            ..Default::default()
        }]),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let pod = PodSpec {
        service_account_name: Some(ADMIN_SERVICE_ACCOUNT.to_string()),
        containers: vec![container],
        volumes: Some(vec![host_path_volume("pv-volume", &path, "DirectoryOrCreate")]),
        ..base_pod_spec(cr)
    };

    daemon_set(ctx, PROVISIONER_NAME, labels.clone(), labels, None, pod)
}

/// Mount information handed to the CSI driver in `PV_DIR`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StoragePoolInfo {
    name: String,
    path: String,
}

/// `(pool name, host path)` of every pool, the legacy path has no name
fn storage_pool_paths(cr: &HostPathProvisioner) -> Vec<(Option<String>, String)> {
    match &cr.spec.path_config {
        Some(path_config) => vec![(None, path_config.path.clone())],
        None => cr
            .spec
            .storage_pools
            .iter()
            .map(|p| (Some(p.name.clone()), p.path.clone()))
            .collect(),
    }
}

/// JSON list of pool names and their directories inside the driver container
fn data_dir_arg(cr: &HostPathProvisioner) -> String {
    let infos: Vec<StoragePoolInfo> = storage_pool_paths(cr)
        .into_iter()
        .map(|(name, _)| StoragePoolInfo {
            path: format!("{}/csi", pool_mount_name(name.as_deref())),
            name: name.unwrap_or_else(|| LEGACY_POOL_NAME.to_string()),
        })
        .collect();
    serde_json::to_string(&infos).unwrap_or_default()
}

/// CSI driver with its sidecars
pub fn csi_daemon_set(ctx: &ResourceContext) -> DaemonSet {
    let cr = &ctx.cr;
    let config = &ctx.config;
    let pull_policy = cr.pull_policy();
    let verbosity = format!("--v={}", config.verbosity);
    let labels = config.prometheus_labels();

    let pools = storage_pool_paths(cr);
    let pool_mounts: Vec<VolumeMount> = pools
        .iter()
        .map(|(name, _)| {
            let mount_name = pool_mount_name(name.as_deref());
            VolumeMount {
                mount_path: format!("/{}", mount_name),
                name: mount_name,
                mount_propagation: Some("HostToContainer".to_string()),
                ..Default::default()
            }
        })
        .collect();

    let driver = Container {
        name: PROVISIONER_NAME.to_string(),
        image: Some(config.images.csi_provisioner.clone()),
        image_pull_policy: Some(pull_policy.clone()),
        resources: Some(requests("10m", "150Mi")),
        env: Some(vec![
            value_env("CSI_ENDPOINT", &format!("unix://{}", CSI_SOCKET)),
            field_env("NODE_NAME", "spec.nodeName"),
            value_env("PV_DIR", &data_dir_arg(cr)),
            value_env("VERSION", &ctx.target_version()),
        ]),
        security_context: Some(privileged()),
        args: Some(vec![
            format!("--drivername={}", DRIVER_NAME),
            verbosity.clone(),
            "--endpoint=$(CSI_ENDPOINT)".to_string(),
            "--nodeid=$(NODE_NAME)".to_string(),
            "--version=$(VERSION)".to_string(),
            "--datadir=$(PV_DIR)".to_string(),
        ]),
        ports: Some(vec![
            ContainerPort {
                container_port: 9898,
                name: Some("healthz".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: 8080,
                name: Some("metrics".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(Probe {
            failure_threshold: Some(5),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(3),
            period_seconds: Some(2),
            success_threshold: Some(1),
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(9898),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(
            [
                vec![
                    VolumeMount {
                        name: "plugins-dir".to_string(),
                        mount_path: "/var/lib/kubelet/plugins".to_string(),
                        mount_propagation: Some("Bidirectional".to_string()),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "mountpoint-dir".to_string(),
                        mount_path: "/var/lib/kubelet/pods".to_string(),
                        mount_propagation: Some("Bidirectional".to_string()),
                        ..Default::default()
                    },
                    socket_dir_mount(),
                ],
                pool_mounts.clone(),
            ]
            .concat(),
        ),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let registrar = Container {
        name: NODE_DRIVER_REGISTRAR_NAME.to_string(),
        image: Some(config.images.node_driver_registrar.clone()),
        image_pull_policy: Some(pull_policy.clone()),
        resources: Some(requests("10m", "150Mi")),
        args: Some(vec![
            verbosity.clone(),
            format!("--csi-address={}", CSI_SOCKET),
            "--kubelet-registration-path=/var/lib/kubelet/plugins/csi-hostpath/csi.sock"
                .to_string(),
        ]),
        security_context: Some(privileged()),
        env: Some(vec![field_env("KUBE_NODE_NAME", "spec.nodeName")]),
        volume_mounts: Some(
            [
                vec![
                    socket_dir_mount(),
                    VolumeMount {
                        name: "registration-dir".to_string(),
                        mount_path: "/registration".to_string(),
                        ..Default::default()
                    },
                ],
                pool_mounts,
            ]
            .concat(),
        ),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let liveness = Container {
        name: "liveness-probe".to_string(),
        image: Some(config.images.liveness_probe.clone()),
        image_pull_policy: Some(pull_policy.clone()),
        resources: Some(requests("10m", "150Mi")),
        args: Some(vec![
            format!("--csi-address={}", CSI_SOCKET),
            "--health-port=9898".to_string(),
        ]),
        volume_mounts: Some(vec![socket_dir_mount()]),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let external_provisioner = Container {
        name: "csi-provisioner".to_string(),
        image: Some(config.images.external_provisioner.clone()),
        image_pull_policy: Some(pull_policy.clone()),
        resources: Some(requests("10m", "150Mi")),
        args: Some(vec![
            verbosity.clone(),
            format!("--csi-address={}", CSI_SOCKET),
            "--feature-gates=Topology=true".to_string(),
            "--enable-capacity=true".to_string(),
            "--capacity-for-immediate-binding=true".to_string(),
            "--extra-create-metadata=true".to_string(),
            "--immediate-topology=false".to_string(),
            "--strict-topology=true".to_string(),
            "--node-deployment=true".to_string(),
            "--default-fstype=xfs".to_string(),
        ]),
        env: Some(vec![
            field_env("NAMESPACE", "metadata.namespace"),
            field_env("POD_NAME", "metadata.name"),
            field_env("NODE_NAME", "spec.nodeName"),
        ]),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![socket_dir_mount()]),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let mut containers = vec![driver, registrar, liveness, external_provisioner];
    if cr.is_feature_gate_enabled(SNAPSHOTTING_FEATURE_GATE) {
        containers.push(Container {
            name: "csi-snapshotter".to_string(),
            image: Some(config.images.csi_snapshotter.clone()),
            image_pull_policy: Some(pull_policy),
            args: Some(vec![
                verbosity,
                format!("--csi-address={}", CSI_SOCKET),
                "--leader-election".to_string(),
            ]),
            security_context: Some(privileged()),
            volume_mounts: Some(vec![socket_dir_mount()]),
            ..Default::default()
        });
    }

    let mut volumes = vec![
        host_path_volume("socket-dir", "/var/lib/kubelet/plugins/csi-hostpath", "DirectoryOrCreate"),
        host_path_volume("mountpoint-dir", "/var/lib/kubelet/pods", "DirectoryOrCreate"),
        host_path_volume("registration-dir", "/var/lib/kubelet/plugins_registry", "Directory"),
        host_path_volume("plugins-dir", "/var/lib/kubelet/plugins", "Directory"),
    ];
    volumes.extend(pools.iter().map(|(name, path)| {
        host_path_volume(&pool_mount_name(name.as_deref()), path, "DirectoryOrCreate")
    }));

    let pod = PodSpec {
        service_account_name: Some(ADMIN_CSI_SERVICE_ACCOUNT.to_string()),
        containers,
        volumes: Some(volumes),
        ..base_pod_spec(cr)
    };
    let annotations = BTreeMap::from([(
        REQUIRED_SCC_ANNOTATION.to_string(),
        CSI_PROVISIONER_NAME.to_string(),
    )]);

    daemon_set(ctx, CSI_PROVISIONER_NAME, labels.clone(), labels, Some(annotations), pod)
}

fn daemon_set(
    ctx: &ResourceContext,
    name: &str,
    labels: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    pod_annotations: Option<BTreeMap<String, String>>,
    pod: PodSpec,
) -> DaemonSet {
    DaemonSet {
        metadata: object_meta(name, Some(&ctx.namespace), labels),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: pod_annotations,
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            update_strategy: Some(update_strategy()),
            revision_history_limit: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod settings shared by both DaemonSets, placement comes from the CR
fn base_pod_spec(cr: &HostPathProvisioner) -> PodSpec {
    PodSpec {
        restart_policy: Some("Always".to_string()),
        dns_policy: Some("ClusterFirst".to_string()),
        termination_grace_period_seconds: Some(30),
        security_context: Some(PodSecurityContext::default()),
        node_selector: cr.spec.workload.node_selector.clone(),
        tolerations: cr.spec.workload.tolerations.clone(),
        affinity: cr.spec.workload.affinity.clone(),
        ..Default::default()
    }
}

// =============================================================================
// Building blocks, shared with the storage pool workloads
// =============================================================================

pub(crate) fn requests(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])),
        ..Default::default()
    }
}

pub(crate) fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

fn socket_dir_mount() -> VolumeMount {
    VolumeMount {
        name: "socket-dir".to_string(),
        mount_path: "/csi".to_string(),
        ..Default::default()
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::*;
    use assert_matches::assert_matches;

    async fn get_ds(ctx: &ResourceContext, name: &str) -> Option<DaemonSet> {
        ctx.store.get(&ctx.namespaced_key(name)).await.unwrap()
    }

    fn container_names(ds: &DaemonSet) -> Vec<String> {
        ds.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_legacy_mode_runs_both() {
        let fx = fixture(legacy_spec()).await;
        reconcile(&fx.ctx).await.unwrap();

        let legacy = get_ds(&fx.ctx, PROVISIONER_NAME).await.unwrap();
        let pod = legacy.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some(ADMIN_SERVICE_ACCOUNT));
        let env = pod.containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "PV_DIR" && e.value.as_deref() == Some("/var/hpvolumes")));

        let csi = get_ds(&fx.ctx, CSI_PROVISIONER_NAME).await.unwrap();
        assert_eq!(
            container_names(&csi),
            vec![PROVISIONER_NAME, NODE_DRIVER_REGISTRAR_NAME, "liveness-probe", "csi-provisioner"]
        );
        assert_eq!(managed_daemon_set_names(&fx.ctx.cr).len(), 2);
    }

    #[tokio::test]
    async fn test_pool_mode_removes_legacy() {
        let fx = fixture(legacy_spec()).await;
        reconcile(&fx.ctx).await.unwrap();

        let mut ctx = fx.ctx.clone();
        ctx.cr.spec = pool_spec();
        reconcile(&ctx).await.unwrap();
        assert!(get_ds(&ctx, PROVISIONER_NAME).await.is_none());

        let csi = get_ds(&ctx, CSI_PROVISIONER_NAME).await.unwrap();
        let pod = csi.spec.unwrap().template.spec.unwrap();
        let volumes: Vec<_> = pod.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert!(volumes.contains(&"local-data-dir".to_string()));
        assert!(!volumes.contains(&"csi-data-dir".to_string()));
    }

    #[tokio::test]
    async fn test_csi_daemon_set_shape() {
        let fx = fixture(pool_spec()).await;
        let ds = csi_daemon_set(&fx.ctx);
        let meta = ds.metadata.clone();
        assert_eq!(meta.labels.unwrap()["prometheus.hostpathprovisioner.kubevirt.io"], "true");

        let template = ds.spec.unwrap().template;
        assert_eq!(
            template.metadata.unwrap().annotations.unwrap()[REQUIRED_SCC_ANNOTATION],
            CSI_PROVISIONER_NAME
        );
        let pod = template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some(ADMIN_CSI_SERVICE_ACCOUNT));
        let driver = &pod.containers[0];
        let pv_dir = driver
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "PV_DIR")
            .and_then(|e| e.value.clone())
            .unwrap();
        assert_eq!(pv_dir, r#"[{"name":"local","path":"local-data-dir/csi"}]"#);
        let version = driver
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "VERSION")
            .and_then(|e| e.value.clone());
        assert_eq!(version.as_deref(), Some("1.0.0"));
        assert!(driver
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == "/local-data-dir"));
    }

    #[tokio::test]
    async fn test_legacy_pool_info() {
        let fx = fixture(legacy_spec()).await;
        assert_eq!(
            data_dir_arg(&fx.ctx.cr),
            r#"[{"name":"legacy","path":"csi-data-dir/csi"}]"#
        );
    }

    #[tokio::test]
    async fn test_snapshotter_behind_gate() {
        let mut spec = pool_spec();
        spec.feature_gates = vec![SNAPSHOTTING_FEATURE_GATE.to_string()];
        let fx = fixture(spec).await;
        let names = container_names(&csi_daemon_set(&fx.ctx));
        assert_eq!(names.last().map(String::as_str), Some("csi-snapshotter"));
    }

    #[tokio::test]
    async fn test_selector_drift() {
        let fx = fixture(pool_spec()).await;
        reconcile(&fx.ctx).await.unwrap();

        let mut live = get_ds(&fx.ctx, CSI_PROVISIONER_NAME).await.unwrap();
        live.spec
            .as_mut()
            .unwrap()
            .selector
            .match_labels
            .as_mut()
            .unwrap()
            .insert("junk".into(), "x".into());
        fx.ctx.store.update(&live).await.unwrap();

        assert_matches!(reconcile(&fx.ctx).await, Err(Error::SelectorDrift { .. }));
        assert!(get_ds(&fx.ctx, CSI_PROVISIONER_NAME).await.is_none());

        reconcile(&fx.ctx).await.unwrap();
        assert!(get_ds(&fx.ctx, CSI_PROVISIONER_NAME).await.is_some());
    }

    #[tokio::test]
    async fn test_duplicates_removed() {
        let fx = fixture(pool_spec()).await;
        let mut dup = csi_daemon_set(&fx.ctx);
        dup.metadata.name = Some(format!("{}-old", CR_NAME));
        dup.metadata.owner_references = Some(vec![fx.ctx.owner_reference().unwrap()]);
        fx.ctx.store.create(&dup).await.unwrap();

        let mut foreign = csi_daemon_set(&fx.ctx);
        foreign.metadata.name = Some("someone-else".into());
        fx.ctx.store.create(&foreign).await.unwrap();

        reconcile(&fx.ctx).await.unwrap();
        assert!(get_ds(&fx.ctx, &format!("{}-old", CR_NAME)).await.is_none());
        assert!(get_ds(&fx.ctx, "someone-else").await.is_some());
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let fx = fixture(legacy_spec()).await;
        reconcile(&fx.ctx).await.unwrap();
        let writes = fx.memory.writes();
        reconcile(&fx.ctx).await.unwrap();
        assert_eq!(fx.memory.writes(), writes);
    }
}
