//! State assembler (`spec.md §4.2`, component C2).

use std::collections::HashMap;
use std::sync::Arc;

use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::config::{DependentDescriptor, Gvk, ReferenceDescriptor};
use crate::document::{resolve_name, StateDocument};

/// Read-only access to one kind's informer cache. Implemented over
/// `kube::runtime::reflector::Store<DynamicObject>` in `manager.rs`; kept as
/// a trait here so the assembler and its tests don't depend on a live
/// watcher being wired up.
pub trait ObjectStore: Send + Sync {
    fn list_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>>;
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>>;
    /// Every object currently cached, across all namespaces. Used by the
    /// syncer (`spec.md §4.6`), which has no narrower scope to work with.
    fn list_all(&self) -> Vec<Arc<DynamicObject>>;
}

/// Every GVK this controller (or the reference watcher) cares about, keyed
/// by `Gvk` so the assembler can look up the right cache for each
/// descriptor.
#[derive(Default)]
pub struct StoreRegistry {
    stores: HashMap<Gvk, Arc<dyn ObjectStore>>,
}

impl StoreRegistry {
    pub fn insert(&mut self, gvk: Gvk, store: Arc<dyn ObjectStore>) {
        self.stores.insert(gvk, store);
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&Arc<dyn ObjectStore>> {
        self.stores.get(gvk)
    }
}

fn owned_by(obj: &DynamicObject, owner_uid: &str) -> bool {
    obj.owner_references()
        .iter()
        .any(|r| r.uid == owner_uid && r.controller == Some(true))
}

/// `spec.md §4.2`: for each dependent descriptor, list objects of that kind
/// in the PR's namespace owned by the PR (declaration order, then name); for
/// each reference descriptor, resolve `nameFieldPath` and look the object up,
/// skipping silently on an empty path or a cache miss.
pub fn assemble(
    pr: &DynamicObject,
    namespace: &str,
    dependents: &[DependentDescriptor],
    references: &[ReferenceDescriptor],
    registry: &StoreRegistry,
) -> StateDocument {
    let owner_uid = pr.uid().unwrap_or_default();
    let pr_value = serde_json::to_value(pr).unwrap_or(serde_json::Value::Null);

    let mut dependent_values = Vec::new();
    for descriptor in dependents {
        let Some(store) = registry.get(&descriptor.gvk) else {
            continue;
        };
        let mut owned: Vec<Arc<DynamicObject>> = store
            .list_namespace(namespace)
            .into_iter()
            .filter(|obj| owned_by(obj, &owner_uid))
            .collect();
        owned.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        dependent_values.extend(owned.iter().map(|obj| serde_json::to_value(obj.as_ref()).unwrap()));
    }

    let mut reference_values = Vec::new();
    for descriptor in references {
        let Some(name) = resolve_name(&pr_value, &descriptor.name_field_path) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let Some(store) = registry.get(&descriptor.gvk) else {
            continue;
        };
        if let Some(obj) = store.get(namespace, &name) {
            reference_values.push(serde_json::to_value(obj.as_ref()).unwrap());
        }
    }

    StateDocument {
        object: pr_value,
        dependents: dependent_values,
        references: reference_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ObjectMeta;
    use serde_json::json;

    struct FixedStore(Vec<Arc<DynamicObject>>);

    impl ObjectStore for FixedStore {
        fn list_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
            self.0
                .iter()
                .filter(|o| o.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        }

        fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
            self.0
                .iter()
                .find(|o| o.namespace().as_deref() == Some(namespace) && o.name_any() == name)
                .cloned()
        }

        fn list_all(&self) -> Vec<Arc<DynamicObject>> {
            self.0.clone()
        }
    }

    fn gvk(kind: &str) -> Gvk {
        Gvk {
            group: "".into(),
            version: "v1".into(),
            kind: kind.into(),
            plural: format!("{}s", kind.to_lowercase()),
        }
    }

    fn pr(uid: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("my-pr".into()),
                namespace: Some("default".into()),
                uid: Some(uid.into()),
                ..Default::default()
            },
            data: json!({"spec": {"configRef": {"name": "shared"}}}),
        }
    }

    fn child(name: &str, owner_uid: &str, controller: bool) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    uid: owner_uid.into(),
                    controller: Some(controller),
                    block_owner_deletion: Some(true),
                    api_version: "v1".into(),
                    kind: "ConfigMap".into(),
                    name: "owner".into(),
                }]),
                ..Default::default()
            },
            data: json!({}),
        }
    }

    #[test]
    fn collects_only_controller_owned_dependents() {
        let owner = pr("abc-123");
        let owned = child("owned", "abc-123", true);
        let not_controller = child("not-controller", "abc-123", false);
        let other_owner = child("other-owner", "xyz", true);
        let store: Arc<dyn ObjectStore> = Arc::new(FixedStore(vec![
            Arc::new(owned),
            Arc::new(not_controller),
            Arc::new(other_owner),
        ]));
        let mut registry = StoreRegistry::default();
        registry.insert(gvk("ConfigMap"), store);

        let doc = assemble(&owner, "default", &[DependentDescriptor {
            gvk: gvk("ConfigMap"),
            orphan: false,
        }], &[], &registry);

        assert_eq!(doc.dependents.len(), 1);
        assert_eq!(doc.dependents[0]["metadata"]["name"], "owned");
    }

    #[test]
    fn reference_lookup_is_best_effort() {
        let owner = pr("abc-123");
        let shared = DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("shared".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            data: json!({"data": {"k": "v"}}),
        };
        let store: Arc<dyn ObjectStore> = Arc::new(FixedStore(vec![Arc::new(shared)]));
        let mut registry = StoreRegistry::default();
        registry.insert(gvk("ConfigMap"), store);

        let doc = assemble(&owner, "default", &[], &[ReferenceDescriptor {
            gvk: gvk("ConfigMap"),
            name_field_path: "spec.configRef.name".into(),
        }], &registry);

        assert_eq!(doc.references.len(), 1);
        assert_eq!(doc.references[0]["metadata"]["name"], "shared");
    }

    #[test]
    fn reference_miss_is_skipped_not_errored() {
        let owner = pr("abc-123");
        let registry = StoreRegistry::default();
        let doc = assemble(&owner, "default", &[], &[ReferenceDescriptor {
            gvk: gvk("ConfigMap"),
            name_field_path: "spec.configRef.name".into(),
        }], &registry);
        assert!(doc.references.is_empty());
    }
}
