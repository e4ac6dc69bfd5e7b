//! Reconcile engine (`spec.md §4.4`, component C4): the core state machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

use crate::assembler::{assemble, ObjectStore, StoreRegistry};
use crate::config::ControllerConfig;
use crate::dependents::{self, DependentApi};
use crate::document::StateDocument;
use crate::error::{Error, Result};
use crate::queue::{Backoff, WorkQueue};
use crate::transport::HandlerTransport;

/// A PR's queue key: its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Writes against the PR itself: finalizer list and status subresource.
/// Split out from `DependentApi` since the PR is never created or deleted
/// by this engine, only patched.
#[async_trait::async_trait]
pub trait PrApi: Send + Sync {
    async fn patch_finalizers(&self, namespace: &str, name: &str, finalizers: Vec<String>) -> Result<()>;
    async fn patch_status(&self, namespace: &str, name: &str, status: Value) -> Result<()>;
}

enum Outcome {
    /// The reconcile completed; `requeue_after` schedules the next visit.
    Success { requeue_after: Option<Duration> },
    /// There was nothing to do (PR forgotten, or finalizing with no work left).
    Noop,
}

fn finalizers_of(object: &Value) -> Vec<String> {
    object
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// `spec.md §4.4`'s "dependent change propagation": given a dependent
/// object event, find the PR key that should be re-enqueued, if the
/// dependent is controller-owned by one.
pub fn owning_key(dependent: &DynamicObject) -> Option<NamespacedName> {
    let namespace = dependent.namespace()?;
    let owner = dependent
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))?;
    Some(NamespacedName {
        namespace,
        name: owner.name.clone(),
    })
}

/// Owns one configured controller's reconcile loop: assembling state,
/// invoking handlers, reconciling dependents, and driving the work queue.
pub struct Engine {
    pub config: ControllerConfig,
    pub primary: Arc<dyn ObjectStore>,
    pub registry: Arc<StoreRegistry>,
    pub pr_api: Arc<dyn PrApi>,
    pub dependent_api: Arc<dyn DependentApi>,
    pub reconciler: Arc<dyn HandlerTransport>,
    pub finalizer: Option<Arc<dyn HandlerTransport>>,
    pub queue: Arc<WorkQueue<NamespacedName>>,
    pub backoff: Arc<Backoff<NamespacedName>>,
}

impl Engine {
    /// Drain the queue with `config.workers` concurrent worker loops.
    /// Returns once every worker loop exits, which only happens if the
    /// queue itself is dropped out from under them.
    pub async fn run_workers(self: Arc<Self>) {
        let worker_count = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                loop {
                    let key = engine.queue.pop().await;
                    engine.process(key).await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Process one dequeued key end to end: run the reconcile, then decide
    /// whether to requeue (backoff, conflict, or a configured `requeueAfter`).
    pub async fn process(&self, key: NamespacedName) {
        match self.process_once(&key).await {
            Ok(Outcome::Success { requeue_after }) => {
                self.backoff.forget(&key).await;
                if let Some(delay) = requeue_after {
                    self.queue.enqueue_after(key.clone(), delay).await;
                }
            }
            Ok(Outcome::Noop) => {}
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    namespace = %key.namespace,
                    name = %key.name,
                    controller = %self.config.name,
                    "reconcile failed"
                );
                if err.is_conflict() {
                    self.queue.enqueue_now(key.clone()).await;
                } else if err.should_requeue() {
                    let delay = self.backoff.next(&key).await;
                    self.queue.enqueue_after(key.clone(), delay).await;
                }
            }
        }
        self.queue.done(&key).await;
    }

    async fn process_once(&self, key: &NamespacedName) -> Result<Outcome> {
        let Some(pr) = self.primary.get(&key.namespace, &key.name) else {
            return Ok(Outcome::Noop);
        };
        if pr.meta().deletion_timestamp.is_some() {
            self.process_finalizing(key, &pr).await
        } else {
            self.process_active(key, &pr).await
        }
    }

    async fn process_active(&self, key: &NamespacedName, pr: &DynamicObject) -> Result<Outcome> {
        let doc = assemble(
            pr,
            &key.namespace,
            &self.config.dependents,
            &self.config.references,
            &self.registry,
        );
        let request = doc
            .to_bytes()
            .map_err(|e| Error::MalformedHandlerOutput(e.to_string()))?;
        let response_bytes = self.reconciler.invoke(request).await?;
        let response = StateDocument::from_bytes(&response_bytes)
            .map_err(|e| Error::MalformedHandlerOutput(e.to_string()))?;

        if self.config.reconciler.observe {
            tracing::info!(
                namespace = %key.namespace,
                name = %key.name,
                controller = %self.config.name,
                "observe-only reconciler, skipping writes"
            );
        } else {
            let current_finalizers = finalizers_of(&doc.object);
            let desired_finalizers = finalizers_of(&response.object);
            if current_finalizers != desired_finalizers {
                self.pr_api
                    .patch_finalizers(&key.namespace, &key.name, desired_finalizers)
                    .await?;
            }

            let owner_uid = pr.uid().unwrap_or_default();
            dependents::reconcile(
                self.dependent_api.as_ref(),
                &self.config.dependents,
                &self.config.resource,
                &key.name,
                &owner_uid,
                &key.namespace,
                &doc.dependents,
                &response.dependents,
            )
            .await?;

            let current_status = doc.object.get("status").cloned().unwrap_or(Value::Null);
            let desired_status = response.object.get("status").cloned().unwrap_or(Value::Null);
            if current_status != desired_status {
                self.pr_api
                    .patch_status(&key.namespace, &key.name, desired_status)
                    .await?;
            }
        }

        let requeue_after = self.config.reconciler.requeue_after.filter(|d| !d.is_zero());
        Ok(Outcome::Success { requeue_after })
    }

    async fn process_finalizing(&self, key: &NamespacedName, pr: &DynamicObject) -> Result<Outcome> {
        let Some(finalizer_cfg) = &self.config.finalizer else {
            return Ok(Outcome::Noop);
        };
        let current_finalizers = finalizers_of(&serde_json::to_value(pr).unwrap_or(Value::Null));
        if !current_finalizers.iter().any(|f| f == &finalizer_cfg.key) {
            return Ok(Outcome::Noop);
        }
        let transport = self.finalizer.as_ref().ok_or_else(|| {
            Error::Unrecoverable(format!(
                "controller {} has a finalizer configured with no transport wired",
                self.config.name
            ))
        })?;

        let doc = assemble(
            pr,
            &key.namespace,
            &self.config.dependents,
            &self.config.references,
            &self.registry,
        );
        let request = doc
            .to_bytes()
            .map_err(|e| Error::MalformedHandlerOutput(e.to_string()))?;
        let response_bytes = transport.invoke(request).await?;
        let response = StateDocument::from_bytes(&response_bytes)
            .map_err(|e| Error::MalformedHandlerOutput(e.to_string()))?;

        let desired_finalizers = finalizers_of(&response.object);
        if desired_finalizers != current_finalizers {
            self.pr_api
                .patch_finalizers(&key.namespace, &key.name, desired_finalizers)
                .await?;
        }

        Ok(Outcome::Success { requeue_after: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Gvk, HandlerConfig, ReconcilerConfig};
    use crate::transport::FnTransport;
    use kube::core::ObjectMeta;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeStore(StdMutex<HashMap<(String, String), Arc<DynamicObject>>>);

    impl FakeStore {
        fn with(objects: Vec<DynamicObject>) -> Arc<Self> {
            let mut map = HashMap::new();
            for obj in objects {
                map.insert(
                    (obj.namespace().unwrap_or_default(), obj.name_any()),
                    Arc::new(obj),
                );
            }
            Arc::new(Self(StdMutex::new(map)))
        }
    }

    impl ObjectStore for FakeStore {
        fn list_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
            self.0
                .lock()
                .unwrap()
                .values()
                .filter(|o| o.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        }

        fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
            self.0
                .lock()
                .unwrap()
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
        }

        fn list_all(&self) -> Vec<Arc<DynamicObject>> {
            self.0.lock().unwrap().values().cloned().collect()
        }
    }

    #[derive(Default)]
    struct FakePrApi {
        finalizer_calls: StdMutex<Vec<Vec<String>>>,
        status_calls: StdMutex<Vec<Value>>,
    }

    #[async_trait::async_trait]
    impl PrApi for FakePrApi {
        async fn patch_finalizers(&self, _ns: &str, _name: &str, finalizers: Vec<String>) -> Result<()> {
            self.finalizer_calls.lock().unwrap().push(finalizers);
            Ok(())
        }

        async fn patch_status(&self, _ns: &str, _name: &str, status: Value) -> Result<()> {
            self.status_calls.lock().unwrap().push(status);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NoopDependentApi;

    #[async_trait::async_trait]
    impl DependentApi for NoopDependentApi {
        async fn get(&self, _gvk: &Gvk, _ns: &str, _name: &str) -> Result<Option<DynamicObject>> {
            Ok(None)
        }
        async fn create(&self, _gvk: &Gvk, _ns: &str, _object: DynamicObject) -> Result<()> {
            Ok(())
        }
        async fn update(&self, _gvk: &Gvk, _ns: &str, _object: DynamicObject) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _gvk: &Gvk, _ns: &str, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn resource_gvk() -> Gvk {
        Gvk {
            group: "example.com".into(),
            version: "v1".into(),
            kind: "Widget".into(),
            plural: "widgets".into(),
        }
    }

    fn pr(name: &str, uid: &str, deleted: bool) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(uid.into()),
                deletion_timestamp: deleted.then(|| {
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
                }),
                ..Default::default()
            },
            data: json!({"spec": {}}),
        }
    }

    fn reconciler_config(observe: bool, requeue_after: Option<Duration>) -> ReconcilerConfig {
        ReconcilerConfig {
            handler: HandlerConfig::default(),
            requeue_after,
            observe,
        }
    }

    fn controller_config(name: &str, reconciler: ReconcilerConfig) -> ControllerConfig {
        ControllerConfig {
            name: name.into(),
            resource: resource_gvk(),
            dependents: vec![],
            references: vec![],
            reconciler,
            finalizer: None,
            syncer: Default::default(),
            workers: 1,
        }
    }

    fn engine_with(
        config: ControllerConfig,
        primary: Arc<dyn ObjectStore>,
        reconciler: Arc<dyn HandlerTransport>,
        pr_api: Arc<FakePrApi>,
        finalizer: Option<Arc<dyn HandlerTransport>>,
    ) -> Engine {
        Engine {
            config,
            primary,
            registry: Arc::new(StoreRegistry::default()),
            pr_api,
            dependent_api: Arc::new(NoopDependentApi),
            reconciler,
            finalizer,
            queue: Arc::new(WorkQueue::new()),
            backoff: Arc::new(Backoff::default()),
        }
    }

    #[tokio::test]
    async fn missing_pr_is_a_noop() {
        let store = FakeStore::with(vec![]);
        let reconciler: Arc<dyn HandlerTransport> = Arc::new(FnTransport::new(|req| Ok(req)));
        let pr_api = Arc::new(FakePrApi::default());
        let engine = engine_with(
            controller_config("widgets", reconciler_config(false, None)),
            store,
            reconciler,
            pr_api.clone(),
            None,
        );
        engine
            .process(NamespacedName {
                namespace: "default".into(),
                name: "gone".into(),
            })
            .await;
        assert!(pr_api.status_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_reconcile_patches_status_and_finalizers() {
        let object = pr("w1", "uid-1", false);
        let store = FakeStore::with(vec![object]);
        let reconciler: Arc<dyn HandlerTransport> = Arc::new(FnTransport::new(|req| {
            let mut doc = StateDocument::from_bytes(&req).unwrap();
            doc.object["metadata"]["finalizers"] = json!(["cleanup"]);
            doc.object["status"] = json!({"phase": "Ready"});
            Ok(doc.to_bytes().unwrap())
        }));
        let pr_api = Arc::new(FakePrApi::default());
        let engine = engine_with(
            controller_config("widgets", reconciler_config(false, None)),
            store,
            reconciler,
            pr_api.clone(),
            None,
        );
        engine
            .process(NamespacedName {
                namespace: "default".into(),
                name: "w1".into(),
            })
            .await;
        assert_eq!(
            pr_api.finalizer_calls.lock().unwrap().as_slice(),
            &[vec!["cleanup".to_string()]]
        );
        assert_eq!(
            pr_api.status_calls.lock().unwrap().as_slice(),
            &[json!({"phase": "Ready"})]
        );
    }

    #[tokio::test]
    async fn observe_only_skips_writes() {
        let object = pr("w1", "uid-1", false);
        let store = FakeStore::with(vec![object]);
        let reconciler: Arc<dyn HandlerTransport> = Arc::new(FnTransport::new(|req| {
            let mut doc = StateDocument::from_bytes(&req).unwrap();
            doc.object["status"] = json!({"phase": "Ready"});
            Ok(doc.to_bytes().unwrap())
        }));
        let pr_api = Arc::new(FakePrApi::default());
        let engine = engine_with(
            controller_config("widgets", reconciler_config(true, None)),
            store,
            reconciler,
            pr_api.clone(),
            None,
        );
        engine
            .process(NamespacedName {
                namespace: "default".into(),
                name: "w1".into(),
            })
            .await;
        assert!(pr_api.status_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_after_schedules_next_visit() {
        let object = pr("w1", "uid-1", false);
        let store = FakeStore::with(vec![object]);
        let reconciler: Arc<dyn HandlerTransport> = Arc::new(FnTransport::new(|req| Ok(req)));
        let pr_api = Arc::new(FakePrApi::default());
        let engine = Arc::new(engine_with(
            controller_config("widgets", reconciler_config(false, Some(Duration::from_millis(10)))),
            store,
            reconciler,
            pr_api,
            None,
        ));
        engine
            .process(NamespacedName {
                namespace: "default".into(),
                name: "w1".into(),
            })
            .await;
        let key = engine.queue.pop().await;
        assert_eq!(key.name, "w1");
    }

    #[tokio::test]
    async fn finalizing_without_configured_finalizer_is_noop() {
        let object = pr("w1", "uid-1", true);
        let store = FakeStore::with(vec![object]);
        let reconciler: Arc<dyn HandlerTransport> = Arc::new(FnTransport::new(|req| Ok(req)));
        let pr_api = Arc::new(FakePrApi::default());
        let engine = engine_with(
            controller_config("widgets", reconciler_config(false, None)),
            store,
            reconciler,
            pr_api.clone(),
            None,
        );
        engine
            .process(NamespacedName {
                namespace: "default".into(),
                name: "w1".into(),
            })
            .await;
        assert!(pr_api.finalizer_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn owning_key_finds_controller_owner() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        let dependent = DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("child".into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    uid: "uid-1".into(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                    api_version: "example.com/v1".into(),
                    kind: "Widget".into(),
                    name: "w1".into(),
                }]),
                ..Default::default()
            },
            data: json!({}),
        };
        let key = owning_key(&dependent).unwrap();
        assert_eq!(key.namespace, "default");
        assert_eq!(key.name, "w1");
    }
}
