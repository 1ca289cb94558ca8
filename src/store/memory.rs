//! In-Memory Object Store
//!
//! A DashMap backed [`ObjectStore`] with just enough API server behaviour for
//! reconcile tests: uids and resource versions, optimistic concurrency,
//! finalizer-aware deletion, status subresource separation, optional API
//! groups that can be switched off, and injected write failures.

use crate::domain::{DeletePropagation, ListSelector, ObjectKey, ObjectStore, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

type StoreKey = (ResourceKind, ObjectKey);

/// A recorded delete call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub propagation: DeletePropagation,
}

/// In-memory [`ObjectStore`]
pub struct MemoryObjectStore {
    objects: DashMap<StoreKey, Value>,
    /// API groups that are not served
    missing: DashSet<ResourceKind>,
    /// Next write of a kind fails with the stored message
    failures: DashMap<ResourceKind, String>,
    deletes: Mutex<Vec<DeleteRecord>>,
    /// Successful mutating calls
    writes: AtomicU64,
    resource_version: AtomicU64,
    uid: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            missing: DashSet::new(),
            failures: DashMap::new(),
            deletes: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
            resource_version: AtomicU64::new(0),
            uid: AtomicU64::new(0),
        }
    }

    /// Stop serving the API group of `kind`
    pub fn remove_api(&self, kind: ResourceKind) {
        self.missing.insert(kind);
    }

    /// Make the next write of `kind` fail
    pub fn fail_next_write(&self, kind: ResourceKind, message: impl Into<String>) {
        self.failures.insert(kind, message.into());
    }

    /// Number of successful create, update and delete calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Delete calls seen so far
    pub fn deletes(&self) -> Vec<DeleteRecord> {
        self.deletes.lock().clone()
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.objects.iter().filter(|e| e.key().0 == kind).count()
    }

    /// Insert or replace an object as-is, bypassing every check.
    ///
    /// Used to seed fixtures and to simulate other controllers.
    pub fn seed(&self, kind: ResourceKind, mut obj: Value) {
        let key = object_key(kind, &obj);
        let rv = self.next_resource_version();
        let meta = metadata_mut(&mut obj);
        if !meta.contains_key("uid") {
            meta.insert("uid".into(), Value::String(self.next_uid()));
        }
        meta.insert("resourceVersion".into(), Value::String(rv));
        stamp_type(kind, &mut obj);
        self.objects.insert((kind, key), obj);
    }

    /// Replace the status of a stored object, as a kubelet or controller would
    pub fn set_status(&self, kind: ResourceKind, key: &ObjectKey, status: Value) -> bool {
        let rv = self.next_resource_version();
        match self.objects.get_mut(&(kind, key.clone())) {
            Some(mut obj) => {
                obj["status"] = status;
                metadata_mut(&mut obj).insert("resourceVersion".into(), Value::String(rv));
                true
            }
            None => false,
        }
    }

    fn check_served(&self, kind: ResourceKind) -> Result<()> {
        if self.missing.contains(&kind) {
            return Err(Error::CapabilityAbsent {
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    fn check_write(&self, kind: ResourceKind) -> Result<()> {
        self.check_served(kind)?;
        if let Some((_, message)) = self.failures.remove(&kind) {
            return Err(Error::Internal(message));
        }
        Ok(())
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn next_uid(&self) -> String {
        format!("uid-{}", self.uid.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Replace the stored object, checking the incoming resource version
    fn replace(&self, kind: ResourceKind, mut obj: Value, status_only: bool) -> Result<Value> {
        self.check_write(kind)?;
        let key = object_key(kind, &obj);
        let mut entry = self
            .objects
            .get_mut(&(kind, key.clone()))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: kind.to_string(),
                name: key.to_string(),
            })?;

        let stored_rv = resource_version(&entry);
        if let Some(incoming) = resource_version(&obj) {
            if Some(incoming) != stored_rv {
                return Err(Error::Conflict {
                    kind: kind.to_string(),
                    name: key.to_string(),
                });
            }
        }

        let mut next = if status_only {
            let mut next = entry.clone();
            match obj.get("status") {
                Some(status) => next["status"] = status.clone(),
                None => {
                    if let Some(map) = next.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            next
        } else {
            // Status and server-owned metadata are kept from the stored object
            let stored_meta = metadata(&entry).clone();
            let meta = metadata_mut(&mut obj);
            for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
                match stored_meta.get(field) {
                    Some(v) => meta.insert(field.into(), v.clone()),
                    None => meta.remove(field),
                };
            }
            match entry.get("status") {
                Some(status) => obj["status"] = status.clone(),
                None => {
                    if let Some(map) = obj.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            obj
        };

        metadata_mut(&mut next).insert(
            "resourceVersion".into(),
            Value::String(self.next_resource_version()),
        );
        stamp_type(kind, &mut next);
        self.writes.fetch_add(1, Ordering::Relaxed);

        // An object marked for deletion goes away once its finalizers are cleared
        let terminating = metadata(&next).contains_key("deletionTimestamp");
        if terminating && finalizers(&next).is_empty() {
            drop(entry);
            self.objects.remove(&(kind, key));
            return Ok(next);
        }

        *entry = next.clone();
        Ok(next)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Option<Value>> {
        self.check_served(kind)?;
        Ok(self.objects.get(&(kind, key.clone())).map(|r| r.value().clone()))
    }

    async fn list(&self, kind: ResourceKind, selector: &ListSelector) -> Result<Vec<Value>> {
        self.check_served(kind)?;
        let mut matched: Vec<(ObjectKey, Value)> = self
            .objects
            .iter()
            .filter(|r| r.key().0 == kind)
            .filter(|r| {
                selector.namespace.is_none() || r.key().1.namespace == selector.namespace
            })
            .filter(|r| selector.matches(labels(r.value()).as_ref()))
            .map(|r| (r.key().1.clone(), r.value().clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));

        let limit = selector.limit.map_or(usize::MAX, |l| l as usize);
        Ok(matched.into_iter().take(limit).map(|(_, v)| v).collect())
    }

    async fn create(&self, kind: ResourceKind, mut obj: Value) -> Result<Value> {
        self.check_write(kind)?;
        let key = object_key(kind, &obj);
        if self.objects.contains_key(&(kind, key.clone())) {
            return Err(Error::ResourceExists {
                kind: kind.to_string(),
                name: key.to_string(),
            });
        }

        let uid = self.next_uid();
        let rv = self.next_resource_version();
        let meta = metadata_mut(&mut obj);
        meta.insert("uid".into(), Value::String(uid));
        meta.insert("resourceVersion".into(), Value::String(rv));
        meta.insert(
            "creationTimestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        stamp_type(kind, &mut obj);

        self.objects.insert((kind, key), obj.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(obj)
    }

    async fn update(&self, kind: ResourceKind, obj: Value) -> Result<Value> {
        self.replace(kind, obj, false)
    }

    async fn update_status(&self, kind: ResourceKind, obj: Value) -> Result<Value> {
        self.replace(kind, obj, true)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> Result<bool> {
        self.check_write(kind)?;
        let store_key = (kind, key.clone());
        let has_finalizers = match self.objects.get(&store_key) {
            Some(obj) => !finalizers(&obj).is_empty(),
            None => return Ok(false),
        };

        self.deletes.lock().push(DeleteRecord {
            kind,
            key: key.clone(),
            propagation,
        });
        self.writes.fetch_add(1, Ordering::Relaxed);

        if has_finalizers {
            let rv = self.next_resource_version();
            if let Some(mut obj) = self.objects.get_mut(&store_key) {
                let meta = metadata_mut(&mut obj);
                if !meta.contains_key("deletionTimestamp") {
                    meta.insert(
                        "deletionTimestamp".into(),
                        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                    );
                    meta.insert("resourceVersion".into(), Value::String(rv));
                }
            }
        } else {
            self.objects.remove(&store_key);
        }
        Ok(true)
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

fn object_key(kind: ResourceKind, obj: &Value) -> ObjectKey {
    let meta = obj.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let namespace = if kind.namespaced() {
        meta.and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };
    ObjectKey { namespace, name }
}

fn metadata(obj: &Value) -> &Map<String, Value> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    obj.get("metadata")
        .and_then(Value::as_object)
        .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
}

fn metadata_mut(obj: &mut Value) -> &mut Map<String, Value> {
    if !obj.is_object() {
        *obj = Value::Object(Map::new());
    }
    let map = match obj {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    };
    let meta = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    match meta {
        Value::Object(meta) => meta,
        _ => unreachable!("replaced with an object above"),
    }
}

fn resource_version(obj: &Value) -> Option<String> {
    metadata(obj)
        .get("resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn finalizers(obj: &Value) -> Vec<String> {
    metadata(obj)
        .get("finalizers")
        .and_then(Value::as_array)
        .map(|f| {
            f.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn labels(obj: &Value) -> Option<BTreeMap<String, String>> {
    metadata(obj).get("labels").and_then(Value::as_object).map(|l| {
        l.iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect()
    })
}

fn stamp_type(kind: ResourceKind, obj: &mut Value) {
    if let Value::Object(map) = obj {
        map.insert("apiVersion".into(), Value::String(kind.api_version()));
        map.insert("kind".into(), Value::String(kind.kind().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sa(name: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": "hpp", "labels": {"k8s-app": "hostpath-provisioner"}}
        })
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let store = MemoryObjectStore::new();
        let created = store.create(ResourceKind::ServiceAccount, sa("a")).await.unwrap();
        assert_eq!(created["kind"], "ServiceAccount");
        assert_eq!(created["metadata"]["uid"], "uid-1");
        assert_eq!(store.writes(), 1);

        assert_matches!(
            store.create(ResourceKind::ServiceAccount, sa("a")).await,
            Err(Error::ResourceExists { .. })
        );

        let key = ObjectKey::namespaced("hpp", "a");
        let fetched = store.get(ResourceKind::ServiceAccount, &key).await.unwrap();
        assert_eq!(fetched, Some(created));
        assert!(store
            .get(ResourceKind::ServiceAccount, &ObjectKey::namespaced("other", "a"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = MemoryObjectStore::new();
        store.create(ResourceKind::ServiceAccount, sa("b")).await.unwrap();
        store.create(ResourceKind::ServiceAccount, sa("a")).await.unwrap();
        store
            .create(
                ResourceKind::ServiceAccount,
                json!({"metadata": {"name": "c", "namespace": "hpp"}}),
            )
            .await
            .unwrap();

        let selector = ListSelector::in_namespace("hpp").with_label("k8s-app", "hostpath-provisioner");
        let listed = store.list(ResourceKind::ServiceAccount, &selector).await.unwrap();
        let names: Vec<_> = listed.iter().map(|o| o["metadata"]["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b")]);

        let limited = store
            .list(ResourceKind::ServiceAccount, &ListSelector::all().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_on_stale_version() {
        let store = MemoryObjectStore::new();
        let created = store.create(ResourceKind::ServiceAccount, sa("a")).await.unwrap();

        let mut first = created.clone();
        first["metadata"]["labels"]["x"] = json!("1");
        store.update(ResourceKind::ServiceAccount, first).await.unwrap();

        let mut stale = created;
        stale["metadata"]["labels"]["x"] = json!("2");
        assert_matches!(
            store.update(ResourceKind::ServiceAccount, stale).await,
            Err(Error::Conflict { .. })
        );
    }

    #[tokio::test]
    async fn test_status_is_a_subresource() {
        let store = MemoryObjectStore::new();
        let mut obj = sa("a");
        obj["status"] = json!({"phase": "Pending"});
        let created = store.create(ResourceKind::PersistentVolumeClaim, obj).await.unwrap();

        let mut update = created.clone();
        update["status"] = json!({"phase": "Bound"});
        let updated = store.update(ResourceKind::PersistentVolumeClaim, update.clone()).await.unwrap();
        assert_eq!(updated["status"]["phase"], "Pending");

        update["metadata"]["resourceVersion"] = updated["metadata"]["resourceVersion"].clone();
        let updated = store.update_status(ResourceKind::PersistentVolumeClaim, update).await.unwrap();
        assert_eq!(updated["status"]["phase"], "Bound");
    }

    #[tokio::test]
    async fn test_finalizers_delay_deletion() {
        let store = MemoryObjectStore::new();
        let mut obj = json!({"metadata": {"name": "hpp", "finalizers": ["f"]}});
        obj = store.create(ResourceKind::HostPathProvisioner, obj).await.unwrap();
        let key = ObjectKey::cluster("hpp");

        assert!(store
            .delete(ResourceKind::HostPathProvisioner, &key, DeletePropagation::Default)
            .await
            .unwrap());
        let terminating = store.get(ResourceKind::HostPathProvisioner, &key).await.unwrap().unwrap();
        assert!(terminating["metadata"]["deletionTimestamp"].is_string());

        let mut cleared = terminating;
        cleared["metadata"]["finalizers"] = json!([]);
        store.update(ResourceKind::HostPathProvisioner, cleared).await.unwrap();
        assert!(store.get(ResourceKind::HostPathProvisioner, &key).await.unwrap().is_none());
        assert!(obj["metadata"]["uid"].is_string());
    }

    #[tokio::test]
    async fn test_missing_api_and_failures() {
        let store = MemoryObjectStore::new();
        store.remove_api(ResourceKind::SecurityContextConstraints);
        assert_matches!(
            store.list(ResourceKind::SecurityContextConstraints, &ListSelector::all()).await,
            Err(Error::CapabilityAbsent { .. })
        );

        store.fail_next_write(ResourceKind::ServiceAccount, "boom");
        assert_matches!(
            store.create(ResourceKind::ServiceAccount, sa("a")).await,
            Err(Error::Internal(msg)) if msg == "boom"
        );
        assert!(store.create(ResourceKind::ServiceAccount, sa("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_records_propagation() {
        let store = MemoryObjectStore::new();
        store.create(ResourceKind::Job, sa("cleanup")).await.unwrap();
        let key = ObjectKey::namespaced("hpp", "cleanup");
        assert!(store
            .delete(ResourceKind::Job, &key, DeletePropagation::Background)
            .await
            .unwrap());
        assert!(!store
            .delete(ResourceKind::Job, &key, DeletePropagation::Background)
            .await
            .unwrap());
        assert_eq!(
            store.deletes(),
            vec![DeleteRecord {
                kind: ResourceKind::Job,
                key,
                propagation: DeletePropagation::Background
            }]
        );
    }
}
