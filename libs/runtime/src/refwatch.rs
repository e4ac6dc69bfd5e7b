//! Reference watcher (`spec.md §4.5`, component C5).
//!
//! One informer per reference GVK; on any event for an object `o`, scan the
//! primary cache for PRs in `o`'s namespace whose `nameFieldPath` resolves to
//! `o`'s name, and enqueue each match. Mirrors the teacher's
//! `echo/controller.rs` `deployment_watch`, which triggers a re-reconcile of
//! the owning `Echo` on a watched `Deployment` event, generalized from a
//! single hardcoded dependent kind to an arbitrary reference descriptor.

use std::sync::Arc;

use kube::ResourceExt;

use crate::assembler::ObjectStore;
use crate::config::ReferenceDescriptor;
use crate::document::resolve_name;
use crate::engine::NamespacedName;
use crate::queue::WorkQueue;

/// On an event for `changed` (an instance of `descriptor.gvk`), find every
/// PR in the primary cache whose `nameFieldPath` resolves to `changed`'s
/// name and enqueue it. O(PRs in namespace) per event.
pub async fn on_reference_event(
    descriptor: &ReferenceDescriptor,
    changed_namespace: &str,
    changed_name: &str,
    primary: &dyn ObjectStore,
    queue: &WorkQueue<NamespacedName>,
) {
    for pr in primary.list_namespace(changed_namespace) {
        let pr_value = match serde_json::to_value(pr.as_ref()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(name) = resolve_name(&pr_value, &descriptor.name_field_path) else {
            continue;
        };
        if name == changed_name {
            queue
                .enqueue_now(NamespacedName {
                    namespace: changed_namespace.to_owned(),
                    name: pr.name_any(),
                })
                .await;
        }
    }
}

/// All reference watchers for one controller, keyed by the GVK they watch.
/// `manager.rs` pairs one of these with a live `kube::runtime::watcher`
/// stream per entry.
pub struct ReferenceWatchers {
    pub descriptors: Vec<ReferenceDescriptor>,
    pub primary: Arc<dyn ObjectStore>,
    pub queue: Arc<WorkQueue<NamespacedName>>,
}

impl ReferenceWatchers {
    pub async fn handle(&self, descriptor_index: usize, namespace: &str, name: &str) {
        if let Some(descriptor) = self.descriptors.get(descriptor_index) {
            on_reference_event(descriptor, namespace, name, self.primary.as_ref(), &self.queue).await;
        }
    }
}
