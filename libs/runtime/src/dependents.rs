//! Dependent reconciler (`spec.md §4.3`, component C3).

use std::collections::HashMap;

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::Value;

use crate::config::{DependentDescriptor, Gvk};
use crate::error::{Error, Result};

/// The subset of the Kubernetes API this component needs, so tests can
/// swap in an in-memory fake the way the teacher's test module swaps a real
/// API server for `tower_test::mock`.
#[async_trait]
pub trait DependentApi: Send + Sync {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;
    async fn create(&self, gvk: &Gvk, namespace: &str, object: DynamicObject) -> Result<()>;
    async fn update(&self, gvk: &Gvk, namespace: &str, object: DynamicObject) -> Result<()>;
    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<()>;
}

fn dependent_key(value: &Value) -> Option<(String, String)> {
    let kind = value.get("kind")?.as_str()?.to_owned();
    let name = value
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())?
        .to_owned();
    Some((kind, name))
}

fn merge_json(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let merged_value = match merged.get(key) {
                    Some(base_value) => merge_json(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

fn owner_reference(owner_gvk: &Gvk, owner_name: &str, owner_uid: &str) -> Value {
    serde_json::json!({
        "apiVersion": owner_gvk.api_version(),
        "kind": owner_gvk.kind,
        "name": owner_name,
        "uid": owner_uid,
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

fn set_owner_reference(object: &mut Value, owner_gvk: &Gvk, owner_name: &str, owner_uid: &str) {
    let metadata = object
        .as_object_mut()
        .expect("dependent object is a JSON object")
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    metadata["ownerReferences"] = Value::Array(vec![owner_reference(owner_gvk, owner_name, owner_uid)]);
}

fn value_to_dynamic_object(value: Value, namespace: &str) -> Result<DynamicObject> {
    let mut object: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::InvalidDependent(e.to_string()))?;
    object.metadata.namespace = Some(namespace.to_owned());
    Ok(object)
}

/// `spec.md §4.3`: converge `current` (from the assembler) to `desired`
/// (from the reconciler handler's response), keyed by `(kind, name)`.
/// Deletes run first, then updates, then creates, so a rename or
/// kind-replacement can free a name before the recreation that needs it.
pub async fn reconcile(
    api: &dyn DependentApi,
    descriptors: &[DependentDescriptor],
    owner_gvk: &Gvk,
    owner_name: &str,
    owner_uid: &str,
    namespace: &str,
    current: &[Value],
    desired: &[Value],
) -> Result<()> {
    let gvk_by_kind: HashMap<&str, &Gvk> = descriptors
        .iter()
        .map(|d| (d.gvk.kind.as_str(), &d.gvk))
        .collect();
    let orphan_by_kind: HashMap<&str, bool> = descriptors
        .iter()
        .map(|d| (d.gvk.kind.as_str(), d.orphan))
        .collect();

    let mut current_by_key = HashMap::new();
    for value in current {
        if let Some(key) = dependent_key(value) {
            current_by_key.insert(key, value);
        }
    }
    let mut desired_by_key = HashMap::new();
    for value in desired {
        let name_is_empty = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .map(str::is_empty)
            .unwrap_or(true);
        if name_is_empty {
            return Err(Error::InvalidDependent(
                "desired dependent has no metadata.name".into(),
            ));
        }
        let key = dependent_key(value)
            .ok_or_else(|| Error::InvalidDependent("desired dependent has no kind".into()))?;
        desired_by_key.insert(key, value);
    }

    // Deletes: in current but not desired.
    for (key, value) in &current_by_key {
        if desired_by_key.contains_key(key) {
            continue;
        }
        let (kind, name) = key;
        let gvk = gvk_by_kind
            .get(kind.as_str())
            .ok_or_else(|| Error::InvalidDependent(format!("unconfigured dependent kind {kind}")))?;
        if *orphan_by_kind.get(kind.as_str()).unwrap_or(&false) {
            let mut orphaned = (*value).clone();
            orphaned
                .as_object_mut()
                .expect("dependent object is a JSON object")
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()))["ownerReferences"] =
                Value::Array(vec![]);
            let object = value_to_dynamic_object(orphaned, namespace)?;
            api.update(gvk, namespace, object).await?;
        } else {
            api.delete(gvk, namespace, name).await?;
        }
    }

    // Updates: in both.
    for (key, desired_value) in &desired_by_key {
        let Some(current_value) = current_by_key.get(key) else {
            continue;
        };
        let (kind, name) = key;
        let gvk = gvk_by_kind
            .get(kind.as_str())
            .ok_or_else(|| Error::InvalidDependent(format!("unconfigured dependent kind {kind}")))?;

        let latest = api
            .get(gvk, namespace, name)
            .await?
            .ok_or_else(|| Error::Conflict {
                kind: kind.clone(),
                name: name.clone(),
            })?;
        let latest_value = serde_json::to_value(&latest).map_err(|e| Error::InvalidDependent(e.to_string()))?;

        let mut merged = merge_json(&latest_value, desired_value);
        set_owner_reference(&mut merged, owner_gvk, owner_name, owner_uid);

        if &merged == *current_value {
            continue;
        }

        let mut object = value_to_dynamic_object(merged, namespace)?;
        object.metadata.resource_version = latest.metadata.resource_version.clone();
        api.update(gvk, namespace, object).await?;
    }

    // Creates: in desired but not current.
    for (key, desired_value) in &desired_by_key {
        if current_by_key.contains_key(key) {
            continue;
        }
        let (kind, _name) = key;
        let gvk = gvk_by_kind
            .get(kind.as_str())
            .ok_or_else(|| Error::InvalidDependent(format!("unconfigured dependent kind {kind}")))?;

        let mut object_value = (*desired_value).clone();
        set_owner_reference(&mut object_value, owner_gvk, owner_name, owner_uid);
        let object = value_to_dynamic_object(object_value, namespace)?;
        api.create(gvk, namespace, object).await?;
    }

    Ok(())
}
