//! Controller wiring
//!
//! Runs [`Reconciler`] under `kube::runtime::Controller`. Owned namespaced
//! objects map back to their controller through owner references. Claims,
//! cleanup jobs, CSI pods and the cluster scoped objects carry no owner
//! reference and trigger a pass of every known HostPathProvisioner instead.
//! CSIDrivers and SecurityContextConstraints are only watched when the
//! cluster serves them at startup.

use super::reconciler::{Outcome, Reconciler};
use crate::config::{K8S_APP_LABEL, K8S_APP_VALUE, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{HostPathProvisioner, SecurityContextConstraints};
use crate::error::{Error, ErrorAction, Result};
use backoff::ExponentialBackoff;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store as ReflectorStore};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay of errors that ask for backoff
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Give up waiting for the CRD after this long
const CRD_WAIT: Duration = Duration::from_secs(120);

/// Run the controller until a termination signal arrives
pub async fn run(client: Client, reconciler: Arc<Reconciler>, namespace: &str) {
    let provisioners: Api<HostPathProvisioner> = Api::all(client.clone());
    let controller = Controller::new(provisioners, watcher::Config::default());
    let known = controller.store();

    let owned = watcher::Config::default();
    let managed = watcher::Config::default()
        .labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE));
    let csi_pods =
        watcher::Config::default().labels(&format!("{}={}", K8S_APP_LABEL, K8S_APP_VALUE));

    info!(%namespace, "Starting HostPathProvisioner controller");
    let controller = controller
        .watches(
            Api::<DaemonSet>::namespaced(client.clone(), namespace),
            owned.clone(),
            controlling_provisioner,
        )
        .watches(
            Api::<ServiceAccount>::namespaced(client.clone(), namespace),
            owned.clone(),
            controlling_provisioner,
        )
        .watches(
            Api::<Role>::namespaced(client.clone(), namespace),
            owned.clone(),
            controlling_provisioner,
        )
        .watches(
            Api::<RoleBinding>::namespaced(client.clone(), namespace),
            owned.clone(),
            controlling_provisioner,
        )
        .watches(
            Api::<Deployment>::namespaced(client.clone(), namespace),
            owned.clone(),
            controlling_provisioner,
        )
        .watches(
            Api::<Service>::namespaced(client.clone(), namespace),
            owned,
            controlling_provisioner,
        )
        .watches(
            Api::<PersistentVolumeClaim>::namespaced(client.clone(), namespace),
            managed.clone(),
            every_provisioner(known.clone()),
        )
        .watches(
            Api::<Job>::namespaced(client.clone(), namespace),
            managed.clone(),
            every_provisioner(known.clone()),
        )
        .watches(
            Api::<Pod>::namespaced(client.clone(), namespace),
            csi_pods,
            every_provisioner(known.clone()),
        )
        .watches(
            Api::<ClusterRole>::all(client.clone()),
            managed.clone(),
            every_provisioner(known.clone()),
        )
        .watches(
            Api::<ClusterRoleBinding>::all(client.clone()),
            managed.clone(),
            every_provisioner(known.clone()),
        );

    let drivers = Api::<CSIDriver>::all(client.clone());
    let controller = if is_served(&drivers).await {
        controller.watches(drivers, managed.clone(), every_provisioner(known.clone()))
    } else {
        info!("CSIDriver not served, not watching");
        controller
    };
    let constraints = Api::<SecurityContextConstraints>::all(client);
    let controller = if is_served(&constraints).await {
        controller.watches(constraints, managed, every_provisioner(known))
    } else {
        info!("SecurityContextConstraints not served, not watching");
        controller
    };

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        })
        .await;
    info!("Controller stopped");
}

async fn reconcile(cr: Arc<HostPathProvisioner>, ctx: Arc<Reconciler>) -> Result<Action> {
    let outcome = ctx.reconcile(&cr.name_any()).await?;
    Ok(action_for_outcome(outcome))
}

fn error_policy(cr: Arc<HostPathProvisioner>, error: &Error, _ctx: Arc<Reconciler>) -> Action {
    error!(name = %cr.name_any(), error = %error, "Reconcile error");
    action_for_error(error)
}

fn action_for_outcome(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Done => Action::await_change(),
        Outcome::RequeueAfter(delay) => Action::requeue(delay),
    }
}

fn action_for_error(error: &Error) -> Action {
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(ERROR_REQUEUE),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// The HostPathProvisioner controlling `obj`, if any
fn controlling_provisioner<K: Resource>(obj: K) -> Option<ObjectRef<HostPathProvisioner>> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == HostPathProvisioner::kind(&()))
        .map(|r| ObjectRef::new(&r.name))
}

/// Map any change to a pass of every cached HostPathProvisioner
fn every_provisioner<K>(
    known: ReflectorStore<HostPathProvisioner>,
) -> impl Fn(K) -> Vec<ObjectRef<HostPathProvisioner>> + Send + Sync + 'static {
    move |_| known.state().iter().map(|cr| ObjectRef::from_obj(&**cr)).collect()
}

/// Whether the API of `K` is served, checked with a single item list
async fn is_served<K>(api: &Api<K>) -> bool
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => true,
        Err(kube::Error::Api(e)) if e.code == 404 => false,
        Err(e) => {
            warn!(error = %e, "Unable to list, watching anyway");
            true
        }
    }
}

/// Wait until the HostPathProvisioner API is served
pub async fn wait_for_crd(client: Client) -> Result<()> {
    let api: Api<HostPathProvisioner> = Api::all(client);
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(CRD_WAIT),
        ..Default::default()
    };
    backoff::future::retry(policy, || async {
        api.list(&ListParams::default().limit(1))
            .await
            .map(|_| ())
            .map_err(|e| {
                info!(error = %e, "HostPathProvisioner API not served yet");
                backoff::Error::transient(e)
            })
    })
    .await?;
    info!("HostPathProvisioner API is served");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    #[test]
    fn test_error_actions() {
        assert_eq!(
            action_for_error(&Error::Conflict {
                kind: "DaemonSet".into(),
                name: "x".into()
            }),
            Action::requeue(ERROR_REQUEUE)
        );
        assert_eq!(
            action_for_error(&Error::MultipleInstances { count: 2 }),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            action_for_error(&Error::Configuration("bad".into())),
            Action::await_change()
        );
    }

    #[test]
    fn test_outcome_actions() {
        assert_eq!(action_for_outcome(Outcome::Done), Action::await_change());
        assert_eq!(
            action_for_outcome(Outcome::RequeueAfter(Duration::from_secs(10))),
            Action::requeue(Duration::from_secs(10))
        );
    }

    fn owned_by(kind: &str, controller: Option<bool>) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some("hostpath-provisioner-csi".into()),
                namespace: Some("hpp".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "hostpathprovisioner.kubevirt.io/v1beta1".into(),
                    kind: kind.into(),
                    name: "hostpath-provisioner".into(),
                    uid: "uid-1".into(),
                    controller,
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_controlling_provisioner_is_cluster_scoped() {
        let found = controlling_provisioner(owned_by("HostPathProvisioner", Some(true))).unwrap();
        assert_eq!(found.name, "hostpath-provisioner");
        assert_eq!(found.namespace, None);

        assert!(controlling_provisioner(owned_by("HostPathProvisioner", None)).is_none());
        assert!(controlling_provisioner(owned_by("Deployment", Some(true))).is_none());
        assert!(controlling_provisioner(DaemonSet::default()).is_none());
    }

    #[test]
    fn test_cluster_scoped_changes_trigger_every_provisioner() {
        use crate::crd::HostPathProvisionerSpec;
        use kube::runtime::reflector::store::Writer;

        let mut writer = Writer::<HostPathProvisioner>::default();
        writer.apply_watcher_event(&watcher::Event::Applied(HostPathProvisioner::new(
            "hostpath-provisioner",
            HostPathProvisionerSpec::default(),
        )));
        let mapper = every_provisioner(writer.as_reader());

        let refs = mapper(ClusterRole::default());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "hostpath-provisioner");
        assert_eq!(refs[0].namespace, None);
    }
}
