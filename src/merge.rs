//! Three-way JSON merge
//!
//! Managed objects are updated with a three-way merge between the last
//! configuration the operator applied, the configuration it wants now, and
//! the live object. Fields the operator declares converge to the desired
//! value, declared fields that were dropped are removed, and everything the
//! operator never declared (defaults filled in by the API server, labels
//! added by users) is left alone.
//!
//! The patch semantics follow JSON merge patch (RFC 7386): objects merge key
//! by key, `null` deletes, arrays are replaced wholesale.

use crate::error::{Error, Result};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Annotation holding the JSON of the last desired object written
pub const LAST_APPLIED_ANNOTATION: &str =
    "hostpathprovisioner.kubevirt.io/lastAppliedConfiguration";

// =============================================================================
// Pure merge
// =============================================================================

/// Merge `modified` into `current` using `original` as the common ancestor.
///
/// Returns the merged document. Fails when the patch would change
/// `apiVersion`, `kind` or `metadata.name`.
pub fn three_way_merge(original: &Value, modified: &Value, current: &Value) -> Result<Value> {
    let patch = three_way_patch(original, modified, current)?;
    let mut merged = current.clone();
    json_patch::merge(&mut merged, &patch);
    Ok(merged)
}

/// Compute the merge patch that moves `current` to the three-way result
pub fn three_way_patch(original: &Value, modified: &Value, current: &Value) -> Result<Value> {
    // Deletions are what the operator stopped declaring since the last apply
    let mut deletions = create_merge_patch(original, modified);
    retain_nulls(&mut deletions);

    // Additions and changes are computed against the live object
    let mut additions = create_merge_patch(current, modified);
    remove_nulls(&mut additions);
    prune_defaulted_arrays(&mut additions, original, current);

    let mut patch = deletions;
    merge_patches(&mut patch, additions);

    check_preconditions(&patch)?;
    Ok(patch)
}

/// RFC 7386 diff: the merge patch that turns `from` into `to`
pub fn create_merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for key in from.keys() {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, to_value) in to {
                match from.get(key) {
                    None => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value @ Value::Object(_)) if to_value.is_object() => {
                        let nested = create_merge_patch(from_value, to_value);
                        if nested.as_object().map_or(true, |m| !m.is_empty()) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    Some(_) => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

fn retain_nulls(patch: &mut Value) {
    if let Value::Object(map) = patch {
        map.retain(|_, v| match v {
            Value::Null => true,
            Value::Object(_) => {
                retain_nulls(v);
                v.as_object().map_or(false, |m| !m.is_empty())
            }
            _ => false,
        });
    }
}

fn remove_nulls(patch: &mut Value) {
    if let Value::Object(map) = patch {
        map.retain(|_, v| {
            if v.is_null() {
                return false;
            }
            if let Value::Object(child) = v {
                // An explicitly empty object is a real value, keep it
                if child.is_empty() {
                    return true;
                }
                remove_nulls(v);
                return v.as_object().map_or(true, |m| !m.is_empty());
            }
            true
        });
    }
}

/// Drop array replacements that only undo server side defaulting.
///
/// Arrays are replaced wholesale, so a container list the API server filled
/// with defaults never equals the declared one. When the declared array is
/// unchanged since the last apply and every declared field still holds on
/// the live array, the replacement is dropped.
fn prune_defaulted_arrays(additions: &mut Value, original: &Value, current: &Value) {
    let Value::Object(map) = additions else {
        return;
    };
    map.retain(|key, value| {
        let original = original.get(key);
        let current = current.get(key);
        if value.is_array() {
            return !(original == Some(&*value)
                && current.map_or(false, |c| is_derivative(value, c)));
        }
        if value.as_object().map_or(false, |m| !m.is_empty()) {
            prune_defaulted_arrays(
                value,
                original.unwrap_or(&Value::Null),
                current.unwrap_or(&Value::Null),
            );
            return value.as_object().map_or(true, |m| !m.is_empty());
        }
        true
    });
}

/// Whether every field set in `declared` holds the same value in `live`
pub fn is_derivative(declared: &Value, live: &Value) -> bool {
    match (declared, live) {
        (Value::Null, _) => true,
        (Value::Object(declared), Value::Object(live)) => declared
            .iter()
            .all(|(k, v)| live.get(k).map_or(v.is_null(), |l| is_derivative(v, l))),
        (Value::Array(declared), Value::Array(live)) => {
            declared.len() == live.len()
                && declared.iter().zip(live).all(|(d, l)| is_derivative(d, l))
        }
        (declared, live) => declared == live,
    }
}

fn merge_patches(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_patches(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn check_preconditions(patch: &Value) -> Result<()> {
    let Some(map) = patch.as_object() else {
        return Ok(());
    };
    for field in ["apiVersion", "kind"] {
        if map.contains_key(field) {
            return Err(Error::MergePrecondition {
                field: field.to_string(),
            });
        }
    }
    if map
        .get("metadata")
        .and_then(Value::as_object)
        .map_or(false, |m| m.contains_key("name"))
    {
        return Err(Error::MergePrecondition {
            field: "metadata.name".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Typed helpers
// =============================================================================

/// Serialize a resource with `apiVersion` and `kind` filled in
pub fn to_document<K>(obj: &K) -> Result<Value>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "apiVersion".to_string(),
            Value::String(K::api_version(&()).into_owned()),
        );
        map.insert("kind".to_string(), Value::String(K::kind(&()).into_owned()));
    }
    Ok(value)
}

/// Record the current content of `obj` in its last-applied annotation
pub fn set_last_applied<K>(obj: &mut K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let meta = obj.meta_mut();
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    let snapshot = serde_json::to_string(&to_document(obj)?)?;
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
    Ok(())
}

/// Parsed last-applied annotation of `obj`, if present
pub fn last_applied<K: Resource>(obj: &K) -> Result<Option<Value>> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .map(|raw| serde_json::from_str(raw).map_err(Error::from))
        .transpose()
}

/// Copy the desired labels and annotations onto the live object.
///
/// Keys the operator sets win, keys only present on `current` survive.
pub fn merge_labels_and_annotations<K: Resource>(desired: &K, current: &mut K) {
    if let Some(labels) = &desired.meta().labels {
        current
            .meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(annotations) = &desired.meta().annotations {
        current
            .meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Three-way merge of a desired resource onto the live one.
///
/// `current` must carry the last-applied annotation written when it was
/// created or last updated. The baseline is read before the desired labels
/// and annotations are copied over, so declared keys that were dropped are
/// still removed.
pub fn merge_object<K>(desired: &K, current: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned,
{
    let original = last_applied(current)?.ok_or_else(|| Error::MissingLastApplied {
        kind: K::kind(&()).into_owned(),
        name: current.meta().name.clone().unwrap_or_default(),
    })?;
    let mut live = current.clone();
    merge_labels_and_annotations(desired, &mut live);

    let modified = to_document(desired)?;
    let live = to_document(&live)?;

    let merged = three_way_merge(&original, &modified, &live)?;
    Ok(serde_json::from_value(merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::ServiceAccount;
    use kube::api::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_create_merge_patch() {
        let from = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        let to = json!({"a": 1, "b": {"c": 5}, "e": [1], "f": "new"});
        assert_eq!(
            create_merge_patch(&from, &to),
            json!({"b": {"c": 5, "d": null}, "e": [1], "f": "new"})
        );
        assert_eq!(create_merge_patch(&to, &to), json!({}));
    }

    #[test]
    fn test_created_patch_applies() {
        let from = json!({"a": "b", "c": {"d": "e", "f": "g"}, "list": [1, 2, 3]});
        let to = json!({"a": "z", "c": {"d": "e"}, "list": [4]});
        let patch = create_merge_patch(&from, &to);
        assert_eq!(patch, json!({"a": "z", "c": {"f": null}, "list": [4]}));

        let mut target = from.clone();
        json_patch::merge(&mut target, &patch);
        assert_eq!(target, to);
    }

    #[test]
    fn test_declared_fields_converge() {
        let original = json!({"kind": "X", "spec": {"replicas": 1, "image": "a"}});
        let modified = original.clone();
        let current = json!({"kind": "X", "spec": {"replicas": 3, "image": "a", "defaulted": true}});

        let merged = three_way_merge(&original, &modified, &current).unwrap();
        assert_eq!(
            merged,
            json!({"kind": "X", "spec": {"replicas": 1, "image": "a", "defaulted": true}})
        );
    }

    #[test]
    fn test_dropped_fields_are_deleted() {
        let original = json!({"metadata": {"labels": {"ours": "1", "old": "x"}}});
        let modified = json!({"metadata": {"labels": {"ours": "1"}}});
        let current = json!({"metadata": {"labels": {"ours": "1", "old": "x", "user": "y"}}});

        let merged = three_way_merge(&original, &modified, &current).unwrap();
        assert_eq!(
            merged,
            json!({"metadata": {"labels": {"ours": "1", "user": "y"}}})
        );
    }

    #[test]
    fn test_noop_when_converged() {
        let doc = json!({"apiVersion": "v1", "kind": "X", "metadata": {"name": "a"}, "spec": {"x": [1]}});
        let mut current = doc.clone();
        current["metadata"]["resourceVersion"] = json!("42");

        assert_eq!(three_way_patch(&doc, &doc, &current).unwrap(), json!({}));
        assert_eq!(three_way_merge(&doc, &doc, &current).unwrap(), current);
    }

    #[test]
    fn test_defaulted_arrays_are_left_alone() {
        let original = json!({"spec": {"containers": [{"name": "a", "image": "x"}]}});
        let modified = original.clone();
        let current = json!({"spec": {"containers": [
            {"name": "a", "image": "x", "terminationMessagePath": "/dev/termination-log"}
        ]}});
        assert_eq!(three_way_patch(&original, &modified, &current).unwrap(), json!({}));

        // Drift in a declared field still converges
        let tampered = json!({"spec": {"containers": [{"name": "a", "image": "y"}]}});
        let merged = three_way_merge(&original, &modified, &tampered).unwrap();
        assert_eq!(merged, modified);

        // A changed declaration replaces the array
        let bumped = json!({"spec": {"containers": [{"name": "a", "image": "z"}]}});
        let merged = three_way_merge(&original, &bumped, &current).unwrap();
        assert_eq!(merged, bumped);
    }

    #[test]
    fn test_is_derivative() {
        assert!(is_derivative(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!is_derivative(&json!({"a": 1}), &json!({"a": 2})));
        assert!(!is_derivative(&json!([1]), &json!([1, 2])));
        assert!(is_derivative(&json!({"a": null}), &json!({})));
    }

    #[test]
    fn test_preconditions() {
        let original = json!({"kind": "X", "metadata": {"name": "a"}});
        let current = original.clone();

        let renamed = json!({"kind": "X", "metadata": {"name": "b"}});
        assert_matches!(
            three_way_merge(&original, &renamed, &current),
            Err(Error::MergePrecondition { field }) if field == "metadata.name"
        );

        let rekinded = json!({"kind": "Y", "metadata": {"name": "a"}});
        assert_matches!(
            three_way_merge(&original, &rekinded, &current),
            Err(Error::MergePrecondition { field }) if field == "kind"
        );
    }

    fn service_account(labels: &[(&str, &str)]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("hostpath-provisioner-admin-csi".into()),
                namespace: Some("hpp".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_set_last_applied_is_stable() {
        let mut sa = service_account(&[("k8s-app", "hostpath-provisioner")]);
        set_last_applied(&mut sa).unwrap();
        let first = sa.metadata.annotations.clone();
        set_last_applied(&mut sa).unwrap();
        assert_eq!(sa.metadata.annotations, first);

        let applied = last_applied(&sa).unwrap().unwrap();
        assert_eq!(applied["kind"], "ServiceAccount");
        assert!(applied["metadata"].get("annotations").is_none());
    }

    #[test]
    fn test_merge_object_preserves_user_labels() {
        let mut desired = service_account(&[("k8s-app", "hostpath-provisioner")]);
        set_last_applied(&mut desired).unwrap();

        let mut current = desired.clone();
        current
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("user".into(), "label".into());
        current
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("k8s-app".into(), "tampered".into());
        current.metadata.resource_version = Some("7".into());

        let merged = merge_object(&desired, &current).unwrap();
        let labels = merged.metadata.labels.unwrap();
        assert_eq!(labels["k8s-app"], "hostpath-provisioner");
        assert_eq!(labels["user"], "label");
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn test_merge_object_requires_baseline() {
        let desired = service_account(&[]);
        let current = service_account(&[]);
        assert_matches!(
            merge_object(&desired, &current),
            Err(Error::MissingLastApplied { .. })
        );
    }

    #[test]
    fn test_merge_labels_and_annotations() {
        let desired = service_account(&[("a", "ours")]);
        let mut current = service_account(&[("a", "theirs"), ("b", "user")]);
        merge_labels_and_annotations(&desired, &mut current);
        let labels = current.metadata.labels.unwrap();
        assert_eq!(labels["a"], "ours");
        assert_eq!(labels["b"], "user");
    }
}
