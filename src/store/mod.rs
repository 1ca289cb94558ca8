//! Object Store Adapter
//!
//! [`Store`] is the typed face of the [`ObjectStore`] port. Reconcilers work
//! with `k8s-openapi` and CRD types; the store converts them to and from the
//! JSON documents the port moves, stamping `apiVersion` and `kind` on the way
//! out.
//!
//! Two adapters implement the port:
//! - [`cluster::KubeObjectStore`]: the API server, through a `kube::Client`
//! - [`memory::MemoryObjectStore`]: an in-process store for tests

pub mod cluster;
pub mod memory;

use crate::domain::{DeletePropagation, ListSelector, ObjectKey, ObjectStoreRef, ResourceKind};
use crate::error::{Error, Result};
use crate::merge::to_document;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub use cluster::KubeObjectStore;
pub use memory::MemoryObjectStore;

/// A resource type the operator can read and write through the store
pub trait Managed:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registry entry of this type
    const KIND: ResourceKind;
}

macro_rules! managed {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Managed for $ty {
            const KIND: ResourceKind = ResourceKind::$kind;
        })*
    };
}

managed! {
    crate::crd::HostPathProvisioner => HostPathProvisioner,
    k8s_openapi::api::apps::v1::DaemonSet => DaemonSet,
    k8s_openapi::api::apps::v1::Deployment => Deployment,
    k8s_openapi::api::core::v1::Pod => Pod,
    k8s_openapi::api::core::v1::Node => Node,
    k8s_openapi::api::batch::v1::Job => Job,
    k8s_openapi::api::core::v1::PersistentVolumeClaim => PersistentVolumeClaim,
    k8s_openapi::api::core::v1::ServiceAccount => ServiceAccount,
    k8s_openapi::api::core::v1::Service => Service,
    k8s_openapi::api::rbac::v1::ClusterRole => ClusterRole,
    k8s_openapi::api::rbac::v1::ClusterRoleBinding => ClusterRoleBinding,
    k8s_openapi::api::rbac::v1::Role => Role,
    k8s_openapi::api::rbac::v1::RoleBinding => RoleBinding,
    k8s_openapi::api::storage::v1::CSIDriver => CsiDriver,
    crate::crd::SecurityContextConstraints => SecurityContextConstraints,
    crate::crd::PrometheusRule => PrometheusRule,
    crate::crd::ServiceMonitor => ServiceMonitor,
}

/// Key of an object from its metadata
pub fn key_of<K: Managed>(obj: &K) -> ObjectKey {
    ObjectKey {
        namespace: if K::KIND.namespaced() {
            obj.meta().namespace.clone()
        } else {
            None
        },
        name: obj.meta().name.clone().unwrap_or_default(),
    }
}

/// Typed access to an [`ObjectStore`](crate::domain::ObjectStore)
#[derive(Clone)]
pub struct Store {
    inner: ObjectStoreRef,
}

impl Store {
    pub fn new(inner: ObjectStoreRef) -> Self {
        Self { inner }
    }

    pub async fn get<K: Managed>(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.inner
            .get(K::KIND, key)
            .await?
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .transpose()
    }

    pub async fn list<K: Managed>(&self, selector: &ListSelector) -> Result<Vec<K>> {
        self.inner
            .list(K::KIND, selector)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .collect()
    }

    pub async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        let created = self.inner.create(K::KIND, to_document(obj)?).await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn update<K: Managed>(&self, obj: &K) -> Result<K> {
        let updated = self.inner.update(K::KIND, to_document(obj)?).await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn update_status<K: Managed>(&self, obj: &K) -> Result<K> {
        let updated = self.inner.update_status(K::KIND, to_document(obj)?).await?;
        Ok(serde_json::from_value(updated)?)
    }

    /// Delete with default propagation, `false` if it was already gone
    pub async fn delete<K: Managed>(&self, key: &ObjectKey) -> Result<bool> {
        self.inner
            .delete(K::KIND, key, DeletePropagation::Default)
            .await
    }

    pub async fn delete_with<K: Managed>(
        &self,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> Result<bool> {
        self.inner.delete(K::KIND, key, propagation).await
    }

    /// Whether the API group serving `K` is installed.
    ///
    /// Re-evaluated on every call so a group installed after the operator
    /// started is picked up on the next pass.
    pub async fn is_served<K: Managed>(&self) -> Result<bool> {
        match self
            .inner
            .list(K::KIND, &ListSelector::all().with_limit(1))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_capability_absent() => {
                debug!(kind = %K::KIND, "API group not served");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceAccount;
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = Store::new(Arc::new(MemoryObjectStore::new()));
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some("hostpath-provisioner-admin".into()),
                namespace: Some("hpp".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = store.create(&sa).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let key = key_of(&sa);
        let fetched: ServiceAccount = store.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        assert!(store.delete::<ServiceAccount>(&key).await.unwrap());
        assert!(!store.delete::<ServiceAccount>(&key).await.unwrap());
        assert!(store.get::<ServiceAccount>(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capability_probe() {
        let memory = Arc::new(MemoryObjectStore::new());
        let store = Store::new(memory.clone());
        assert!(store.is_served::<crate::crd::PrometheusRule>().await.unwrap());

        memory.remove_api(ResourceKind::PrometheusRule);
        assert!(!store.is_served::<crate::crd::PrometheusRule>().await.unwrap());
    }
}
