//! Reconcile pass
//!
//! One pass takes the HostPathProvisioner from whatever state it is in one
//! step closer to the desired deployment:
//!
//! 1. Fetch the CR, refuse to act on more than one instance
//! 2. Tear down and release the finalizer when the CR is being deleted
//! 3. Resolve the install namespace
//! 4. Record the target version and mark deploying or upgrading
//! 5. Run every resource reconciler, then the storage pool fleet
//! 6. Derive health and degradation from the provisioner daemons
//!
//! The status is written at most once per pass, and only when it changed.
//! Events announce the difference between the stored and the final state.
//! Any reconciler error ends the pass as FailedHealing.

use super::metrics::Metrics;
use super::status::{
    can_upgrade, check_degraded, is_deploying, is_healthy, is_upgrading, mark_deploying,
    mark_failed, mark_failed_healing, mark_healthy, mark_upgrading, settle, state, Readiness,
    DEPLOYING, DEPLOY_STARTED, DEPLOY_STARTED_MESSAGE, HEALTHY_MESSAGE, HEALTHY_REASON,
    PROVISIONER_HEALTHY, PROVISIONER_HEALTHY_MESSAGE, RECONCILE_FAILED, UPGRADE_STARTED,
    UPGRADING, WATCH_NAMESPACE,
};
use crate::config::OperatorConfig;
use crate::crd::{HostPathProvisioner, HostPathProvisionerStatus, FINALIZER};
use crate::domain::{
    EventSinkRef, ListSelector, NamespaceProviderRef, ObjectKey, OperatorEvent,
    VersionProviderRef,
};
use crate::error::{Error, Result};
use crate::resources::{
    csi_driver, daemonset, monitoring, rbac, scc, service_account, storage_pool, ResourceContext,
};
use crate::store::Store;
use k8s_openapi::api::apps::v1::DaemonSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// What the controller should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next change
    Done,
    /// Run again after the delay
    RequeueAfter(Duration),
}

/// Drives reconcile passes of the HostPathProvisioner
pub struct Reconciler {
    store: Store,
    config: Arc<OperatorConfig>,
    events: EventSinkRef,
    namespace: NamespaceProviderRef,
    version: VersionProviderRef,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(
        store: Store,
        config: Arc<OperatorConfig>,
        events: EventSinkRef,
        namespace: NamespaceProviderRef,
        version: VersionProviderRef,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            config,
            events,
            namespace,
            version,
            metrics,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one pass for the CR named `name`
    pub async fn reconcile(&self, name: &str) -> Result<Outcome> {
        let started = Instant::now();
        let result = self
            .reconcile_pass(name)
            .instrument(info_span!("reconcile", hpp = %name))
            .await;
        self.metrics.observe_pass(started.elapsed(), result.is_err());
        result
    }

    async fn reconcile_pass(&self, name: &str) -> Result<Outcome> {
        debug!("Reconciling HostPathProvisioner");
        let Some(mut cr) = self
            .store
            .get::<HostPathProvisioner>(&ObjectKey::cluster(name))
            .await?
        else {
            debug!("HostPathProvisioner not found, nothing to do");
            return Ok(Outcome::Done);
        };

        let count = self
            .store
            .list::<HostPathProvisioner>(&ListSelector::all())
            .await?
            .len();
        if count > 1 {
            return Err(Error::MultipleInstances { count });
        }

        if cr.is_being_deleted() {
            return self.finalize(cr).await;
        }

        let namespace = match self.namespace.namespace() {
            Ok(namespace) => namespace,
            Err(e) => return Err(self.fail_namespace(cr, e).await),
        };

        if !cr.has_finalizer() {
            info!("Adding finalizer");
            cr.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
            cr = self.store.update(&cr).await?;
        }

        let original = cr.status_or_default();
        let mut status = original.clone();
        let version = self.version.version()?;
        status.operator_version = version.clone();
        status.target_version = version.clone();
        let upgrade = can_upgrade(&status.observed_version, &version)?;

        let deploying = is_deploying(&status);
        if deploying {
            mark_deploying(&mut status, DEPLOY_STARTED, DEPLOY_STARTED_MESSAGE);
        }
        let upgrade_message = format!("Started upgrade to version {}", version);
        let upgrading = upgrade && is_upgrading(&status);
        if upgrading {
            mark_upgrading(&mut status, UPGRADE_STARTED, &upgrade_message);
        }

        cr.status = Some(status.clone());
        let ctx = self.context(cr, namespace);
        let result = converge(&ctx, &mut status).await;
        match &result {
            Ok(readiness) => {
                if readiness.available {
                    mark_healthy(&mut status, HEALTHY_REASON, HEALTHY_MESSAGE);
                }
                let degraded = check_degraded(&mut status, *readiness);
                debug!(degraded, "Degraded check");
                if !degraded && status.observed_version != version {
                    info!(%version, "Workloads rolled out");
                    status.observed_version = version.clone();
                }
            }
            Err(e) => {
                warn!(error = %e, "Reconcile failed");
                let message = format!("Unable to successfully reconcile: {}", e);
                mark_failed_healing(&mut status, RECONCILE_FAILED, &message);
                ctx.publish(OperatorEvent::warning(RECONCILE_FAILED, message))
                    .await;
            }
        }
        settle(&mut status, &original);

        // Announce only what changed between the stored and the final state
        let (before, after) = (state(&original), state(&status));
        if before != after {
            if deploying && before != DEPLOYING {
                info!("{}", DEPLOY_STARTED_MESSAGE);
                ctx.publish(OperatorEvent::normal(DEPLOY_STARTED, DEPLOY_STARTED_MESSAGE))
                    .await;
            }
            if upgrading && before != UPGRADING {
                info!("{}", upgrade_message);
                ctx.publish(OperatorEvent::warning(UPGRADE_STARTED, upgrade_message))
                    .await;
            }
        }
        if is_healthy(&status) && !is_healthy(&original) {
            ctx.publish(OperatorEvent::normal(
                PROVISIONER_HEALTHY,
                PROVISIONER_HEALTHY_MESSAGE,
            ))
            .await;
        }

        self.metrics.set_ready(is_healthy(&status));
        if status != original {
            let mut cr = ctx.cr;
            cr.status = Some(status);
            self.store.update_status(&cr).await?;
        }
        result.map(|_| Outcome::Done)
    }

    fn context(&self, cr: HostPathProvisioner, namespace: String) -> ResourceContext {
        ResourceContext::new(
            self.store.clone(),
            self.config.clone(),
            self.events.clone(),
            namespace,
            cr,
        )
    }

    /// Mark the CR failed because the namespace is unknown
    async fn fail_namespace(&self, mut cr: HostPathProvisioner, error: Error) -> Error {
        let message = error.to_string();
        warn!(error = %message, "Unable to determine namespace");
        let mut status = cr.status_or_default();
        mark_failed(&mut status, WATCH_NAMESPACE, &message);
        cr.status = Some(status);
        let ctx = self.context(cr, String::new());
        ctx.publish(OperatorEvent::warning(WATCH_NAMESPACE, message))
            .await;
        if let Err(e) = self.store.update_status(&ctx.cr).await {
            warn!(error = %e, "Unable to update CR to failed state");
        }
        error
    }

    /// Remove what garbage collection cannot, then release the CR
    ///
    /// Pool cleanup needs the install namespace. Without it the cluster
    /// scoped objects are still removed, so the CR can go away.
    async fn finalize(&self, cr: HostPathProvisioner) -> Result<Outcome> {
        if !cr.has_finalizer() {
            return Ok(Outcome::Done);
        }
        let ctx = match self.namespace.namespace() {
            Ok(namespace) => {
                let ctx = self.context(cr, namespace);
                if storage_pool::tear_down(&ctx).await? == storage_pool::Cleanup::InProgress {
                    return Ok(Outcome::RequeueAfter(storage_pool::CLEANUP_REQUEUE));
                }
                ctx
            }
            Err(e) => {
                warn!(error = %e, "Unable to determine namespace, skipping storage pool cleanup");
                self.context(cr, String::new())
            }
        };
        info!("Deleting cluster scoped resources");
        scc::remove_all(&ctx).await?;
        csi_driver::remove_driver(&ctx).await?;
        rbac::remove_cluster_scoped(&ctx).await?;

        let mut cr = ctx.cr;
        if let Some(finalizers) = cr.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER);
        }
        self.store.update(&cr).await?;
        info!("Finalizer removed");
        Ok(Outcome::Done)
    }
}

/// Run every reconciler in order, then report daemon readiness
async fn converge(
    ctx: &ResourceContext,
    status: &mut HostPathProvisionerStatus,
) -> Result<Readiness> {
    daemonset::reconcile(ctx).await?;
    service_account::reconcile(ctx).await?;
    rbac::reconcile_cluster_roles(ctx).await?;
    rbac::reconcile_cluster_role_bindings(ctx).await?;
    rbac::reconcile_roles(ctx).await?;
    rbac::reconcile_role_bindings(ctx).await?;
    csi_driver::reconcile(ctx).await?;
    scc::reconcile(ctx).await?;
    monitoring::reconcile(ctx).await?;
    storage_pool::reconcile(ctx).await?;
    status.storage_pool_statuses = storage_pool::pool_statuses(ctx).await?;

    let mut daemon_sets = Vec::new();
    for name in daemonset::managed_daemon_set_names(&ctx.cr) {
        daemon_sets.push(ctx.store.get::<DaemonSet>(&ctx.namespaced_key(name)).await?);
    }
    Ok(Readiness::of(&daemon_sets))
}
