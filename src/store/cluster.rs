//! API server backed object store
//!
//! Every kind is accessed as a `DynamicObject` through an `ApiResource` built
//! from the [`ResourceKind`] registry, so optional groups such as
//! `security.openshift.io` need no generated client code.

use crate::domain::{DeletePropagation, ListSelector, ObjectKey, ObjectStore, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy,
};
use kube::Client;
use serde_json::Value;
use tracing::{debug, trace};

/// Message of a 404 for an API group or resource the server does not serve
const NO_MATCH_MESSAGE: &str = "the server could not find the requested resource";

/// [`ObjectStore`] talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_resource(kind: ResourceKind) -> ApiResource {
        ApiResource {
            group: kind.group().to_string(),
            version: kind.version().to_string(),
            api_version: kind.api_version(),
            kind: kind.kind().to_string(),
            plural: kind.plural().to_string(),
        }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = Self::api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn api_for(&self, kind: ResourceKind, obj: &DynamicObject) -> Api<DynamicObject> {
        self.api(kind, obj.metadata.namespace.as_deref())
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Option<Value>> {
        trace!(%kind, %key, "get");
        let api = self.api(kind, key.namespace.as_deref());
        match api.get(&key.name).await {
            Ok(obj) => Ok(Some(serde_json::to_value(obj)?)),
            Err(e) if is_no_match(&e) => Err(capability_absent(kind)),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, kind: ResourceKind, selector: &ListSelector) -> Result<Vec<Value>> {
        trace!(%kind, ?selector, "list");
        let api = self.api(kind, selector.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(labels) = selector.label_selector() {
            params = params.labels(&labels);
        }
        if let Some(limit) = selector.limit {
            params = params.limit(limit);
        }
        match api.list(&params).await {
            Ok(list) => list
                .items
                .into_iter()
                .map(|obj| serde_json::to_value(obj).map_err(Error::from))
                .collect(),
            Err(e) if is_status(&e, 404) => Err(capability_absent(kind)),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, kind: ResourceKind, obj: Value) -> Result<Value> {
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        debug!(%kind, %name, "create");
        match self
            .api_for(kind, &obj)
            .create(&PostParams::default(), &obj)
            .await
        {
            Ok(created) => Ok(serde_json::to_value(created)?),
            Err(e) => Err(write_error(kind, &name, e)),
        }
    }

    async fn update(&self, kind: ResourceKind, obj: Value) -> Result<Value> {
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        debug!(%kind, %name, "update");
        match self
            .api_for(kind, &obj)
            .replace(&name, &PostParams::default(), &obj)
            .await
        {
            Ok(updated) => Ok(serde_json::to_value(updated)?),
            Err(e) => Err(write_error(kind, &name, e)),
        }
    }

    async fn update_status(&self, kind: ResourceKind, obj: Value) -> Result<Value> {
        let body = serde_json::to_vec(&obj)?;
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        debug!(%kind, %name, "update status");
        match self
            .api_for(kind, &obj)
            .replace_status(&name, &PostParams::default(), body)
            .await
        {
            Ok(updated) => Ok(serde_json::to_value(updated)?),
            Err(e) => Err(write_error(kind, &name, e)),
        }
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> Result<bool> {
        debug!(%kind, %key, ?propagation, "delete");
        let params = DeleteParams {
            propagation_policy: match propagation {
                DeletePropagation::Default => None,
                DeletePropagation::Background => Some(PropagationPolicy::Background),
                DeletePropagation::Foreground => Some(PropagationPolicy::Foreground),
            },
            ..Default::default()
        };
        match self
            .api(kind, key.namespace.as_deref())
            .delete(&key.name, &params)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_no_match(&e) => Err(capability_absent(kind)),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

fn is_no_match(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404 && resp.message == NO_MATCH_MESSAGE)
}

fn capability_absent(kind: ResourceKind) -> Error {
    Error::CapabilityAbsent {
        kind: kind.to_string(),
    }
}

/// Map write failures onto the store's error vocabulary
fn write_error(kind: ResourceKind, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ if is_no_match(&err) => capability_absent(kind),
        _ => Error::Kube(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_api_resource_from_kind() {
        let resource = KubeObjectStore::api_resource(ResourceKind::SecurityContextConstraints);
        assert_eq!(resource.group, "security.openshift.io");
        assert_eq!(resource.api_version, "security.openshift.io/v1");
        assert_eq!(resource.plural, "securitycontextconstraints");

        let resource = KubeObjectStore::api_resource(ResourceKind::Pod);
        assert_eq!(resource.group, "");
        assert_eq!(resource.api_version, "v1");
    }

    #[test]
    fn test_write_error_mapping() {
        assert_matches!(
            write_error(
                ResourceKind::Job,
                "cleanup",
                api_error(409, "AlreadyExists", "jobs.batch \"cleanup\" already exists")
            ),
            Error::ResourceExists { .. }
        );
        assert_matches!(
            write_error(
                ResourceKind::DaemonSet,
                "hpp",
                api_error(409, "Conflict", "the object has been modified")
            ),
            Error::Conflict { .. }
        );
        assert_matches!(
            write_error(
                ResourceKind::PrometheusRule,
                "rules",
                api_error(404, "NotFound", NO_MATCH_MESSAGE)
            ),
            Error::CapabilityAbsent { .. }
        );
        assert_matches!(
            write_error(ResourceKind::Pod, "p", api_error(500, "InternalError", "boom")),
            Error::Kube(_)
        );
    }

    #[test]
    fn test_not_found_is_not_no_match() {
        let missing = api_error(404, "NotFound", "pods \"p\" not found");
        assert!(is_status(&missing, 404));
        assert!(!is_no_match(&missing));
    }
}
