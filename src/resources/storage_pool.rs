//! Storage pool fleet
//!
//! A templated pool is backed by one claim per node, mounted onto the host by
//! a single replica "mounter" Deployment pinned to that node. The node set
//! follows the CSI driver: a node is a member while a live pod of the CSI
//! DaemonSet runs on it.
//!
//! Claims are created once and never updated. When a node leaves, its
//! Deployment is deleted and the claim is kept. If the node still exists an
//! unmount Job is scheduled on it.

use super::daemonset::{host_path_volume, privileged, requests};
use super::{
    apply, is_controlled_by, object_meta, remove, ResourceContext, ADMIN_CSI_SERVICE_ACCOUNT,
    CREATE_RESOURCE_FAILED, CREATE_RESOURCE_SUCCESS, CSI_PROVISIONER_NAME,
};
use crate::config::{
    K8S_APP_LABEL, K8S_APP_VALUE, MANAGED_BY_LABEL, MANAGED_BY_VALUE, STORAGE_POOL_LABEL,
};
use crate::crd::{ClaimStatus, StoragePool, StoragePoolPhase, StoragePoolStatus, LEGACY_POOL_NAME};
use crate::domain::{DeletePropagation, ListSelector, ObjectKey, OperatorEvent};
use crate::error::{Error, Result};
use crate::naming::{cleanup_job_name, pool_label_value, pool_resource_name, POOL_PREFIX};
use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, PodTemplateSpec,
    SecurityContext, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between checks while cleanup Jobs run
pub const CLEANUP_REQUEUE: Duration = Duration::from_secs(10);

const MOUNTER: &str = "/usr/bin/mounter";
const MOUNTER_CONTAINER: &str = "mounter";
const DATA_VOLUME: &str = "data";
const HOST_ROOT_VOLUME: &str = "host-root";
const HOST_ROOT_PATH: &str = "/host";
const FS_DATA_PATH: &str = "/source";
const BLOCK_DATA_PATH: &str = "/dev/data";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Progress of tearing the fleet down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Every unmount Job succeeded and has been removed
    Finished,
    /// Unmount Jobs are still running
    InProgress,
}

/// Converge the per-node claims and Deployments of every templated pool
pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    let nodes = member_nodes(ctx).await?;
    debug!(nodes = nodes.len(), "Reconciling storage pools");
    let mut current = current_deployments(ctx).await?;

    for pool in &ctx.cr.spec.storage_pools {
        let Some(template) = pool.claim_template() else {
            continue;
        };
        for node in &nodes {
            ensure_claim(ctx, pool, &template, node).await?;
            let deployment = pool_deployment(ctx, pool, node);
            if let Some(name) = &deployment.metadata.name {
                current.remove(name);
            }
            apply(ctx, deployment).await?;
        }
    }

    for (name, deployment) in current {
        info!(deployment = %name, "Deleting unused storage pool deployment");
        remove::<Deployment>(ctx, &name).await?;
        if let Some(pool) = pool_of(ctx, &deployment) {
            schedule_cleanup(ctx, pool, &deployment).await?;
        }
    }
    Ok(())
}

/// Unmount every pool from its nodes while the CR is deleted.
///
/// Deployments are replaced by cleanup Jobs. Once all Jobs succeeded they
/// are removed and [`Cleanup::Finished`] is returned.
pub async fn tear_down(ctx: &ResourceContext) -> Result<Cleanup> {
    for (name, deployment) in current_deployments(ctx).await? {
        if let Some(pool) = pool_of(ctx, &deployment) {
            schedule_cleanup(ctx, pool, &deployment).await?;
        }
        remove::<Deployment>(ctx, &name).await?;
    }

    let jobs = cleanup_jobs(ctx).await?;
    let pending = jobs
        .iter()
        .filter(|job| job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) == 0)
        .count();
    if pending > 0 {
        info!(pending, "Waiting for storage pool cleanup jobs");
        return Ok(Cleanup::InProgress);
    }

    for job in jobs {
        let name = job.metadata.name.unwrap_or_default();
        debug!(job = %name, "Deleting cleanup job");
        ctx.store
            .delete_with::<Job>(&ctx.namespaced_key(&name), DeletePropagation::Background)
            .await?;
    }
    Ok(Cleanup::Finished)
}

/// Fresh status entries for every pool, sorted by name.
///
/// Fails while any claim of a templated pool is not yet bound.
pub async fn pool_statuses(ctx: &ResourceContext) -> Result<Vec<StoragePoolStatus>> {
    if ctx.cr.is_legacy() {
        return Ok(vec![StoragePoolStatus {
            name: LEGACY_POOL_NAME.to_string(),
            phase: StoragePoolPhase::Ready,
            ..Default::default()
        }]);
    }

    let mut statuses = Vec::with_capacity(ctx.cr.spec.storage_pools.len());
    for pool in &ctx.cr.spec.storage_pools {
        if !pool.is_templated() {
            statuses.push(StoragePoolStatus {
                name: pool.name.clone(),
                phase: StoragePoolPhase::Ready,
                ..Default::default()
            });
            continue;
        }

        let selector = ListSelector::in_namespace(&ctx.namespace)
            .with_label(K8S_APP_LABEL, K8S_APP_VALUE)
            .with_label(STORAGE_POOL_LABEL, pool_label_value(&pool.name));
        let deployments: Vec<Deployment> = ctx
            .store
            .list::<Deployment>(&selector)
            .await?
            .into_iter()
            .filter(|d| controlled_by_cr(ctx, &d.metadata))
            .collect();
        let desired = deployments.len() as i32;
        let ready = deployments
            .iter()
            .filter(|d| d.status.as_ref().and_then(|s| s.ready_replicas) == Some(1))
            .count() as i32;

        let mut claim_statuses = Vec::new();
        for claim in ctx.store.list::<PersistentVolumeClaim>(&selector).await? {
            let name = claim.metadata.name.unwrap_or_default();
            let status = claim.status.unwrap_or_default();
            let phase = status.phase.clone().unwrap_or_else(|| "Pending".to_string());
            if phase != "Bound" {
                return Err(Error::ClaimNotBound { name, phase });
            }
            claim_statuses.push(ClaimStatus { name, status });
        }

        debug!(pool = %pool.name, desired, ready, "Storage pool deployments");
        statuses.push(StoragePoolStatus {
            name: pool.name.clone(),
            phase: if ready < desired {
                StoragePoolPhase::Pending
            } else {
                StoragePoolPhase::Ready
            },
            desired_ready: Some(desired),
            current_ready: Some(ready),
            claim_statuses,
        });
    }
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(statuses)
}

// =============================================================================
// Membership
// =============================================================================

/// Nodes running a live pod of the CSI DaemonSet
async fn member_nodes(ctx: &ResourceContext) -> Result<BTreeSet<String>> {
    let Some(ds) = ctx
        .store
        .get::<DaemonSet>(&ctx.namespaced_key(CSI_PROVISIONER_NAME))
        .await?
    else {
        return Ok(BTreeSet::new());
    };
    let Some(uid) = ds.metadata.uid.as_deref() else {
        return Ok(BTreeSet::new());
    };

    let pods: Vec<Pod> = ctx
        .store
        .list(&ListSelector::in_namespace(&ctx.namespace).with_label(K8S_APP_LABEL, K8S_APP_VALUE))
        .await?;
    Ok(pods
        .into_iter()
        .filter(|pod| is_controlled_by(&pod.metadata, uid))
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter_map(|pod| pod.spec.and_then(|s| s.node_name))
        .filter(|node| !node.is_empty())
        .collect())
}

fn controlled_by_cr(ctx: &ResourceContext, meta: &ObjectMeta) -> bool {
    ctx.cr
        .metadata
        .uid
        .as_deref()
        .map_or(false, |uid| is_controlled_by(meta, uid))
}

/// Pool Deployments owned by the CR, by name
async fn current_deployments(ctx: &ResourceContext) -> Result<BTreeMap<String, Deployment>> {
    let selector =
        ListSelector::in_namespace(&ctx.namespace).with_label(K8S_APP_LABEL, K8S_APP_VALUE);
    Ok(ctx
        .store
        .list::<Deployment>(&selector)
        .await?
        .into_iter()
        .filter(|d| controlled_by_cr(ctx, &d.metadata))
        .filter_map(|d| d.metadata.name.clone().map(|name| (name, d)))
        .collect())
}

/// Configured pool a Deployment belongs to, from its pool label
fn pool_of<'a>(ctx: &'a ResourceContext, deployment: &Deployment) -> Option<&'a StoragePool> {
    let label = deployment.metadata.labels.as_ref()?.get(STORAGE_POOL_LABEL)?;
    ctx.cr
        .spec
        .storage_pools
        .iter()
        .find(|pool| &pool_label_value(&pool.name) == label)
}

/// Node a pool Deployment is pinned to
fn deployment_node(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms
        .first()?
        .match_expressions
        .as_ref()?
        .first()?
        .values
        .as_ref()?
        .first()
        .map(String::as_str)
}

// =============================================================================
// Claims and Deployments
// =============================================================================

fn pool_labels(ctx: &ResourceContext, pool: &StoragePool) -> BTreeMap<String, String> {
    let mut labels = ctx.config.recommended_labels();
    labels.insert(STORAGE_POOL_LABEL.to_string(), pool_label_value(&pool.name));
    labels
}

/// Create the claim of `pool` on `node` unless it already exists
async fn ensure_claim(
    ctx: &ResourceContext,
    pool: &StoragePool,
    template: &PersistentVolumeClaimSpec,
    node: &str,
) -> Result<()> {
    let name = pool_resource_name(&pool.name, node);
    if ctx
        .store
        .get::<PersistentVolumeClaim>(&ctx.namespaced_key(&name))
        .await?
        .is_some()
    {
        return Ok(());
    }

    info!(pool = %pool.name, %node, claim = %name, "Creating storage pool claim");
    let claim = PersistentVolumeClaim {
        metadata: object_meta(&name, Some(&ctx.namespace), pool_labels(ctx, pool)),
        spec: Some(template.clone()),
        ..Default::default()
    };
    match ctx.store.create(&claim).await {
        Ok(_) => {
            ctx.publish(OperatorEvent::normal(
                CREATE_RESOURCE_SUCCESS,
                format!("Successfully created resource PersistentVolumeClaim {}", name),
            ))
            .await;
            Ok(())
        }
        Err(e) => {
            ctx.publish(OperatorEvent::warning(
                CREATE_RESOURCE_FAILED,
                format!("Failed to create resource {}, {}", name, e),
            ))
            .await;
            Err(e)
        }
    }
}

fn node_affinity(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount_path(pool: &StoragePool) -> String {
    format!("{}/csi", pool.path.trim_end_matches('/'))
}

/// Privileged mounter container with the host root mounted
fn mounter(ctx: &ResourceContext, command: Vec<String>) -> Container {
    Container {
        name: MOUNTER_CONTAINER.to_string(),
        image: Some(ctx.config.images.operator.clone()),
        image_pull_policy: Some(ctx.cr.pull_policy()),
        command: Some(command),
        security_context: Some(privileged()),
        resources: Some(requests("10m", "100Mi")),
        volume_mounts: Some(vec![VolumeMount {
            name: HOST_ROOT_VOLUME.to_string(),
            mount_path: HOST_ROOT_PATH.to_string(),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        }]),
        termination_message_policy: Some("File".to_string()),
        termination_message_path: Some("/dev/termination-log".to_string()),
        ..Default::default()
    }
}

/// Pod spec shared by the mounter Deployment and the cleanup Job
fn node_pod_spec(node: &str, restart_policy: &str, container: Container) -> PodSpec {
    PodSpec {
        service_account_name: Some(ADMIN_CSI_SERVICE_ACCOUNT.to_string()),
        restart_policy: Some(restart_policy.to_string()),
        scheduler_name: Some("default-scheduler".to_string()),
        termination_grace_period_seconds: Some(30),
        dns_policy: Some("ClusterFirst".to_string()),
        security_context: Some(PodSecurityContext::default()),
        affinity: Some(node_affinity(node)),
        containers: vec![container],
        volumes: Some(vec![host_path_volume(HOST_ROOT_VOLUME, "/", "Directory")]),
        ..Default::default()
    }
}

/// Deployment mounting the claim of `pool` on `node` into the host
pub fn pool_deployment(ctx: &ResourceContext, pool: &StoragePool, node: &str) -> Deployment {
    let name = pool_resource_name(&pool.name, node);
    let pool_value = pool_label_value(&pool.name);
    let mut labels = pool_labels(ctx, pool);
    labels.insert(POOL_PREFIX.to_string(), pool_value.clone());

    let data_path = if pool.is_block() {
        BLOCK_DATA_PATH
    } else {
        FS_DATA_PATH
    };
    let mount = mount_path(pool);
    let mut container = mounter(
        ctx,
        [
            MOUNTER,
            "--storagePoolPath",
            data_path,
            "--mountPath",
            mount.as_str(),
            "--hostPath",
            HOST_ROOT_PATH,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    );
    container.security_context = Some(SecurityContext {
        run_as_user: Some(0),
        ..privileged()
    });
    if pool.is_block() {
        container.volume_devices = Some(vec![VolumeDevice {
            name: DATA_VOLUME.to_string(),
            device_path: BLOCK_DATA_PATH.to_string(),
        }]);
    } else if let Some(mounts) = container.volume_mounts.as_mut() {
        mounts.push(VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: FS_DATA_PATH.to_string(),
            ..Default::default()
        });
    }

    let mut pod = node_pod_spec(node, "Always", container);
    pod.volumes.get_or_insert_with(Vec::new).insert(
        0,
        Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: name.clone(),
                read_only: None,
            }),
            ..Default::default()
        },
    );

    Deployment {
        metadata: object_meta(&name, Some(&ctx.namespace), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(POOL_PREFIX.to_string(), pool_value.clone())])),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    max_surge: Some(IntOrString::Int(2)),
                }),
            }),
            progress_deadline_seconds: Some(600),
            revision_history_limit: Some(10),
            template: PodTemplateSpec {
                metadata: Some(object_meta(&pool_value, Some(&ctx.namespace), labels)),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Cleanup Jobs
// =============================================================================

/// Job unmounting `pool` from `node`
pub fn cleanup_job(ctx: &ResourceContext, pool: &StoragePool, node: &str) -> Job {
    let labels = ctx.config.recommended_labels();
    let mount = mount_path(pool);
    let container = mounter(
        ctx,
        [
            MOUNTER,
            "--mountPath",
            mount.as_str(),
            "--hostPath",
            HOST_ROOT_PATH,
            "--unmount",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    );
    Job {
        metadata: object_meta(
            &cleanup_job_name(&pool.name, node),
            Some(&ctx.namespace),
            labels.clone(),
        ),
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(node_pod_spec(node, "OnFailure", container)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Start unmounting the pool of `deployment` if its node still exists
async fn schedule_cleanup(
    ctx: &ResourceContext,
    pool: &StoragePool,
    deployment: &Deployment,
) -> Result<()> {
    let Some(node) = deployment_node(deployment) else {
        warn!(deployment = ?deployment.metadata.name, "Pool deployment is not pinned to a node");
        return Ok(());
    };
    if ctx.store.get::<Node>(&ObjectKey::cluster(node)).await?.is_none() {
        debug!(%node, "Node is gone, nothing to unmount");
        return Ok(());
    }

    let job = cleanup_job(ctx, pool, node);
    info!(pool = %pool.name, %node, job = ?job.metadata.name, "Creating cleanup job");
    match ctx.store.create(&job).await {
        Ok(_) | Err(Error::ResourceExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn cleanup_jobs(ctx: &ResourceContext) -> Result<Vec<Job>> {
    let selector =
        ListSelector::in_namespace(&ctx.namespace).with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    ctx.store.list(&selector).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OperatorConfig, PART_OF_LABEL};
    use crate::crd::{HostPathProvisionerSpec, SourceStorageClass};
    use crate::domain::ResourceKind;
    use crate::resources::daemonset::csi_daemon_set;
    use crate::resources::testing::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::VolumeResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use serde_json::json;
    use std::sync::Arc;

    fn templated_spec(volume_mode: Option<&str>) -> HostPathProvisionerSpec {
        let mut spec = pool_spec();
        spec.storage_pools[0].pvc_template = Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            volume_mode: volume_mode.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".into(), Quantity("5Gi".into()))])),
                ..Default::default()
            }),
            ..Default::default()
        });
        spec
    }

    /// Create the CSI DaemonSet and one of its pods on each node
    async fn run_csi_pods(fx: &Fixture, nodes: &[String]) {
        apply(&fx.ctx, csi_daemon_set(&fx.ctx)).await.unwrap();
        let ds: DaemonSet = fx
            .ctx
            .store
            .get(&fx.ctx.namespaced_key(CSI_PROVISIONER_NAME))
            .await
            .unwrap()
            .unwrap();
        let uid = ds.metadata.uid.unwrap();
        for node in nodes {
            fx.memory.seed(
                ResourceKind::Pod,
                json!({
                    "metadata": {
                        "name": format!("{}-{}", CSI_PROVISIONER_NAME, node),
                        "namespace": NAMESPACE,
                        "labels": {K8S_APP_LABEL: K8S_APP_VALUE},
                        "ownerReferences": [{
                            "apiVersion": "apps/v1",
                            "kind": "DaemonSet",
                            "name": CSI_PROVISIONER_NAME,
                            "uid": uid,
                            "controller": true
                        }]
                    },
                    "spec": {"nodeName": node, "containers": []}
                }),
            );
        }
    }

    fn node_names(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        range.map(|i| format!("node{}", i)).collect()
    }

    async fn bind_claims(fx: &Fixture) {
        let claims: Vec<PersistentVolumeClaim> = fx
            .ctx
            .store
            .list(&ListSelector::in_namespace(NAMESPACE))
            .await
            .unwrap();
        for claim in claims {
            let key = fx.ctx.namespaced_key(claim.metadata.name.as_deref().unwrap());
            fx.memory
                .set_status(ResourceKind::PersistentVolumeClaim, &key, json!({"phase": "Bound"}));
        }
    }

    #[tokio::test]
    async fn test_claim_and_deployment_per_node() {
        let fx = fixture(templated_spec(None)).await;
        run_csi_pods(&fx, &node_names(1..=6)).await;
        reconcile(&fx.ctx).await.unwrap();

        assert_eq!(fx.memory.count(ResourceKind::Deployment), 6);
        assert_eq!(fx.memory.count(ResourceKind::PersistentVolumeClaim), 6);

        let name = pool_resource_name("local", "node3");
        let claim: PersistentVolumeClaim =
            fx.ctx.store.get(&fx.ctx.namespaced_key(&name)).await.unwrap().unwrap();
        assert_eq!(
            claim.metadata.labels.unwrap()[STORAGE_POOL_LABEL],
            pool_label_value("local")
        );
        assert!(claim.metadata.owner_references.is_none());

        let deployment: Deployment =
            fx.ctx.store.get(&fx.ctx.namespaced_key(&name)).await.unwrap().unwrap();
        assert_eq!(deployment_node(&deployment), Some("node3"));
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let command = pod.containers[0].command.clone().unwrap();
        assert_eq!(
            command,
            vec![
                "/usr/bin/mounter",
                "--storagePoolPath",
                "/source",
                "--mountPath",
                "/var/hpvolumes/csi",
                "--hostPath",
                "/host"
            ]
        );
        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            name
        );

        // Pending claims fail the status until bound
        assert_matches!(
            pool_statuses(&fx.ctx).await,
            Err(Error::ClaimNotBound { .. })
        );
        bind_claims(&fx).await;
        let statuses = pool_statuses(&fx.ctx).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].desired_ready, Some(6));
        assert_eq!(statuses[0].current_ready, Some(0));
        assert_eq!(statuses[0].phase, StoragePoolPhase::Pending);
        assert_eq!(statuses[0].claim_statuses.len(), 6);
    }

    #[tokio::test]
    async fn test_storage_class_pool() {
        let mut spec = pool_spec();
        spec.storage_pools[0].storage_class = Some(SourceStorageClass {
            name: "local-block".into(),
            pvc_template: Some(PersistentVolumeClaimSpec {
                volume_mode: Some("Block".into()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".into(), Quantity("1Gi".into()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        });
        let fx = fixture(spec).await;
        run_csi_pods(&fx, &node_names(1..=2)).await;
        reconcile(&fx.ctx).await.unwrap();

        let name = pool_resource_name("local", "node1");
        let claim: PersistentVolumeClaim =
            fx.ctx.store.get(&fx.ctx.namespaced_key(&name)).await.unwrap().unwrap();
        let claim_spec = claim.spec.unwrap();
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("local-block"));
        assert_eq!(claim_spec.volume_mode.as_deref(), Some("Block"));

        let deployment: Deployment =
            fx.ctx.store.get(&fx.ctx.namespaced_key(&name)).await.unwrap().unwrap();
        let container = deployment.spec.unwrap().template.spec.unwrap().containers[0].clone();
        assert_eq!(container.volume_devices.unwrap()[0].device_path, BLOCK_DATA_PATH);

        bind_claims(&fx).await;
        let statuses = pool_statuses(&fx.ctx).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "local");
        assert_eq!(statuses[0].desired_ready, Some(2));
        assert_eq!(statuses[0].claim_statuses.len(), 2);
    }

    #[tokio::test]
    async fn test_pool_ready_once_deployments_ready() {
        let fx = fixture(templated_spec(None)).await;
        run_csi_pods(&fx, &node_names(1..=2)).await;
        reconcile(&fx.ctx).await.unwrap();
        bind_claims(&fx).await;
        for node in node_names(1..=2) {
            let key = fx.ctx.namespaced_key(&pool_resource_name("local", &node));
            fx.memory
                .set_status(ResourceKind::Deployment, &key, json!({"readyReplicas": 1}));
        }

        let statuses = pool_statuses(&fx.ctx).await.unwrap();
        assert_eq!(statuses[0].current_ready, Some(2));
        assert_eq!(statuses[0].phase, StoragePoolPhase::Ready);
    }

    #[tokio::test]
    async fn test_scale_down_keeps_claims() {
        let fx = fixture(templated_spec(None)).await;
        let nodes = node_names(1..=10);
        run_csi_pods(&fx, &nodes).await;
        reconcile(&fx.ctx).await.unwrap();
        assert_eq!(fx.memory.count(ResourceKind::Deployment), 10);

        for node in &nodes[2..8] {
            let key = fx.ctx.namespaced_key(&format!("{}-{}", CSI_PROVISIONER_NAME, node));
            fx.ctx.store.delete::<Pod>(&key).await.unwrap();
        }
        reconcile(&fx.ctx).await.unwrap();

        assert_eq!(fx.memory.count(ResourceKind::Deployment), 4);
        assert_eq!(fx.memory.count(ResourceKind::PersistentVolumeClaim), 10);
        // The removed nodes have no Node objects, nothing to unmount
        assert_eq!(fx.memory.count(ResourceKind::Job), 0);
    }

    #[tokio::test]
    async fn test_scale_down_unmounts_existing_node() {
        let fx = fixture(templated_spec(None)).await;
        run_csi_pods(&fx, &node_names(1..=2)).await;
        fx.memory
            .seed(ResourceKind::Node, json!({"metadata": {"name": "node2"}}));
        reconcile(&fx.ctx).await.unwrap();

        let key = fx.ctx.namespaced_key(&format!("{}-node2", CSI_PROVISIONER_NAME));
        fx.ctx.store.delete::<Pod>(&key).await.unwrap();
        reconcile(&fx.ctx).await.unwrap();
        reconcile(&fx.ctx).await.unwrap();

        let jobs: Vec<Job> = cleanup_jobs(&fx.ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].metadata.name.as_deref(),
            Some(cleanup_job_name("local", "node2").as_str())
        );
    }

    #[tokio::test]
    async fn test_block_mode_uses_device() {
        let fx = fixture(templated_spec(Some("Block"))).await;
        let pool = &fx.ctx.cr.spec.storage_pools[0];
        let deployment = pool_deployment(&fx.ctx, pool, "node1");
        let container = deployment.spec.unwrap().template.spec.unwrap().containers[0].clone();

        let devices = container.volume_devices.unwrap();
        assert_eq!(devices[0].device_path, "/dev/data");
        assert_eq!(container.volume_mounts.unwrap().len(), 1);
        assert_eq!(container.command.unwrap()[2], "/dev/data");
        assert_eq!(container.security_context.unwrap().run_as_user, Some(0));
    }

    #[tokio::test]
    async fn test_tear_down_waits_for_cleanup() {
        let mut fx = fixture(templated_spec(None)).await;
        fx.ctx.config = Arc::new(OperatorConfig {
            part_of: "kubevirt".into(),
            ..Default::default()
        });
        run_csi_pods(&fx, &node_names(1..=1)).await;
        fx.memory
            .seed(ResourceKind::Node, json!({"metadata": {"name": "node1"}}));
        reconcile(&fx.ctx).await.unwrap();

        assert_eq!(tear_down(&fx.ctx).await.unwrap(), Cleanup::InProgress);
        assert_eq!(fx.memory.count(ResourceKind::Deployment), 0);
        let jobs = cleanup_jobs(&fx.ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job_name = cleanup_job_name("local", "node1");
        assert_eq!(jobs[0].metadata.name.as_deref(), Some(job_name.as_str()));
        assert_eq!(jobs[0].metadata.labels.as_ref().unwrap()[PART_OF_LABEL], "kubevirt");
        let command = jobs[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        assert_eq!(command.last().map(String::as_str), Some("--unmount"));

        // Still running
        assert_eq!(tear_down(&fx.ctx).await.unwrap(), Cleanup::InProgress);

        fx.memory.set_status(
            ResourceKind::Job,
            &fx.ctx.namespaced_key(&job_name),
            json!({"succeeded": 1}),
        );
        assert_eq!(tear_down(&fx.ctx).await.unwrap(), Cleanup::Finished);
        assert_eq!(fx.memory.count(ResourceKind::Job), 0);
        let delete = fx
            .memory
            .deletes()
            .into_iter()
            .find(|d| d.kind == ResourceKind::Job)
            .unwrap();
        assert_eq!(delete.propagation, DeletePropagation::Background);
    }

    #[tokio::test]
    async fn test_statuses_per_mode() {
        let fx = fixture(legacy_spec()).await;
        let statuses = pool_statuses(&fx.ctx).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, LEGACY_POOL_NAME);

        let fx = fixture(pool_spec()).await;
        let statuses = pool_statuses(&fx.ctx).await.unwrap();
        assert_eq!(statuses[0].name, "local");
        assert_eq!(statuses[0].phase, StoragePoolPhase::Ready);
        assert_eq!(statuses[0].desired_ready, None);
    }

    #[tokio::test]
    async fn test_no_daemon_set_no_nodes() {
        let fx = fixture(templated_spec(None)).await;
        reconcile(&fx.ctx).await.unwrap();
        assert_eq!(fx.memory.count(ResourceKind::Deployment), 0);
    }
}
