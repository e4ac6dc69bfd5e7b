//! Controller manager (`spec.md §4.4`/§8.7, component C8).
//!
//! Wires one [`ControllerRuntime`] (primary + dependent + reference
//! informers, work queue, worker pool, syncer) per configured controller,
//! the same way the teacher's `echo::controller::run` wires a single
//! `Controller` plus a `Deployment` watcher behind one `tokio::select!`,
//! generalized here to an arbitrary number of controllers and an arbitrary
//! number of dependent/reference kinds per controller.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::core::DynamicObject;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::ResourceExt;
use serde_json::Value;

use crate::assembler::{ObjectStore, StoreRegistry};
use crate::config::{ControllerConfig, Gvk, RuntimeConfig};
use crate::dependents::DependentApi;
use crate::engine::{owning_key, Engine, NamespacedName, PrApi};
use crate::error::{Error, Result};
use crate::queue::{Backoff, WorkQueue};
use crate::refwatch::on_reference_event;
use crate::syncer;
use crate::transport::{self, HandlerTransport};

struct ReflectorStore(reflector::Store<DynamicObject>);

impl ObjectStore for ReflectorStore {
    fn list_namespace(&self, namespace: &str) -> Vec<Arc<DynamicObject>> {
        self.0
            .state()
            .into_iter()
            .filter(|o| o.namespace().as_deref() == Some(namespace))
            .collect()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
        self.0
            .state()
            .into_iter()
            .find(|o| o.namespace().as_deref() == Some(namespace) && o.name_any() == name)
    }

    fn list_all(&self) -> Vec<Arc<DynamicObject>> {
        self.0.state()
    }
}

struct KubeDependentApi {
    client: Client,
}

#[async_trait::async_trait]
impl DependentApi for KubeDependentApi {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &gvk.to_api_resource());
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create(&self, gvk: &Gvk, namespace: &str, object: DynamicObject) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &gvk.to_api_resource());
        api.create(&PostParams::default(), &object)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn update(&self, gvk: &Gvk, namespace: &str, object: DynamicObject) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &gvk.to_api_resource());
        let name = object.name_any();
        api.replace(&name, &PostParams::default(), &object)
            .await
            .map_err(|e| kube_conflict_or(e, &gvk.kind, &name))?;
        Ok(())
    }

    async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &gvk.to_api_resource());
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

struct KubePrApi {
    client: Client,
    resource: Gvk,
}

#[async_trait::async_trait]
impl PrApi for KubePrApi {
    async fn patch_finalizers(&self, namespace: &str, name: &str, finalizers: Vec<String>) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.resource.to_api_resource());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.resource.to_api_resource());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

fn kube_conflict_or(error: kube::Error, kind: &str, name: &str) -> Error {
    if let kube::Error::Api(ref response) = error {
        if response.code == 409 {
            return Error::Conflict {
                kind: kind.to_owned(),
                name: name.to_owned(),
            };
        }
    }
    Error::KubeError(error)
}

async fn enqueue_self(queue: &WorkQueue<NamespacedName>, object: &DynamicObject) {
    if let Some(namespace) = object.namespace() {
        queue
            .enqueue_now(NamespacedName {
                namespace,
                name: object.name_any(),
            })
            .await;
    }
}

async fn enqueue_owner(queue: &WorkQueue<NamespacedName>, object: &DynamicObject) {
    if let Some(key) = owning_key(object) {
        queue.enqueue_now(key).await;
    }
}

async fn reference_changed(
    descriptor: &crate::config::ReferenceDescriptor,
    object: &DynamicObject,
    primary: &dyn ObjectStore,
    queue: &WorkQueue<NamespacedName>,
) {
    let Some(namespace) = object.namespace() else {
        return;
    };
    on_reference_event(descriptor, &namespace, &object.name_any(), primary, queue).await;
}

/// Everything one configured controller needs at runtime.
pub struct ControllerRuntime {
    config: ControllerConfig,
    client: Client,
}

impl ControllerRuntime {
    pub fn new(config: ControllerConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// Build transports, informers, the engine and its satellites, and run
    /// them until `shutdown` resolves.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let reconciler = transport::from_config(&self.config.reconciler.handler, &self.config.name)?;
        let finalizer: Option<Arc<dyn HandlerTransport>> = match &self.config.finalizer {
            Some(f) => Some(Arc::from(transport::from_config(
                &f.handler,
                &format!("{}.finalizer", self.config.name),
            )?)),
            None => None,
        };
        let reconciler: Arc<dyn HandlerTransport> = Arc::from(reconciler);

        let primary_resource = self.config.resource.to_api_resource();
        let primary_api: Api<DynamicObject> = Api::all_with(self.client.clone(), &primary_resource);
        let (primary_reader, primary_writer) = reflector::store();
        let primary: Arc<dyn ObjectStore> = Arc::new(ReflectorStore(primary_reader));

        let queue: Arc<WorkQueue<NamespacedName>> = Arc::new(WorkQueue::new());

        // Every add/update/delete of the PR itself is a reconcile trigger:
        // the dependent and reference watches below only re-enqueue an
        // *existing* PR, so without this a freshly created PR with no
        // children would never be picked up.
        let primary_watch = {
            let queue = Arc::clone(&queue);
            watcher(primary_api, watcher::Config::default())
                .default_backoff()
                .reflect(primary_writer)
                .for_each(move |event| {
                    let queue = Arc::clone(&queue);
                    async move {
                        match event {
                            Ok(watcher::Event::Applied(object)) => enqueue_self(&queue, &object).await,
                            Ok(watcher::Event::Deleted(object)) => enqueue_self(&queue, &object).await,
                            Ok(watcher::Event::Restarted(objects)) => {
                                for object in &objects {
                                    enqueue_self(&queue, object).await;
                                }
                            }
                            Err(_) => {}
                        }
                    }
                })
        };

        let mut registry = StoreRegistry::default();
        let mut dependent_watches = Vec::new();
        for descriptor in &self.config.dependents {
            let api: Api<DynamicObject> =
                Api::all_with(self.client.clone(), &descriptor.gvk.to_api_resource());
            let (reader, writer) = reflector::store();
            registry.insert(descriptor.gvk.clone(), Arc::new(ReflectorStore(reader)));
            let queue = Arc::clone(&queue);
            dependent_watches.push(
                watcher(api, watcher::Config::default())
                    .default_backoff()
                    .reflect(writer)
                    .for_each(move |event| {
                        let queue = Arc::clone(&queue);
                        async move {
                            match event {
                                Ok(watcher::Event::Applied(object)) => enqueue_owner(&queue, &object).await,
                                Ok(watcher::Event::Deleted(object)) => enqueue_owner(&queue, &object).await,
                                Ok(watcher::Event::Restarted(objects)) => {
                                    for object in &objects {
                                        enqueue_owner(&queue, object).await;
                                    }
                                }
                                Err(_) => {}
                            }
                        }
                    })
                    .boxed(),
            );
        }

        let mut reference_watches = Vec::new();
        for descriptor in self.config.references.clone() {
            let api: Api<DynamicObject> =
                Api::all_with(self.client.clone(), &descriptor.gvk.to_api_resource());
            let (reader, writer) = reflector::store();
            registry.insert(descriptor.gvk.clone(), Arc::new(ReflectorStore(reader)));
            let primary = Arc::clone(&primary);
            let queue = Arc::clone(&queue);
            reference_watches.push(
                watcher(api, watcher::Config::default())
                    .default_backoff()
                    .reflect(writer)
                    .for_each(move |event| {
                        let descriptor = descriptor.clone();
                        let primary = Arc::clone(&primary);
                        let queue = Arc::clone(&queue);
                        async move {
                            match event {
                                Ok(watcher::Event::Applied(object)) => {
                                    reference_changed(&descriptor, &object, primary.as_ref(), &queue).await
                                }
                                Ok(watcher::Event::Deleted(object)) => {
                                    reference_changed(&descriptor, &object, primary.as_ref(), &queue).await
                                }
                                Ok(watcher::Event::Restarted(objects)) => {
                                    for object in &objects {
                                        reference_changed(&descriptor, object, primary.as_ref(), &queue).await;
                                    }
                                }
                                Err(_) => {}
                            }
                        }
                    })
                    .boxed(),
            );
        }

        let registry = Arc::new(registry);
        let engine = Arc::new(Engine {
            config: self.config.clone(),
            primary: Arc::clone(&primary),
            registry,
            pr_api: Arc::new(KubePrApi {
                client: self.client.clone(),
                resource: self.config.resource.clone(),
            }),
            dependent_api: Arc::new(KubeDependentApi {
                client: self.client.clone(),
            }),
            reconciler,
            finalizer,
            queue: Arc::clone(&queue),
            backoff: Arc::new(Backoff::default()),
        });

        let syncer_task = syncer::run(self.config.syncer.clone(), Arc::clone(&primary), Arc::clone(&queue));
        let workers = Arc::clone(&engine).run_workers();

        tracing::info!(controller = %self.config.name, "controller runtime starting");
        tokio::select! {
            _ = primary_watch => {}
            _ = futures::future::join_all(dependent_watches) => {}
            _ = futures::future::join_all(reference_watches) => {}
            _ = syncer_task => {}
            _ = workers => {}
            _ = shutdown => {
                tracing::info!(controller = %self.config.name, "controller runtime shutting down");
            }
        }
        Ok(())
    }
}

/// Runs every configured controller concurrently and drains in-flight work
/// for `grace_period` once a shutdown signal arrives, mirroring the
/// teacher's `shutdown_on_signal` behavior generalized to many runtimes.
pub struct Manager {
    runtimes: Vec<ControllerRuntime>,
    grace_period: Duration,
}

impl Manager {
    pub fn new(config: RuntimeConfig, client: Client, grace_period: Duration) -> Self {
        let runtimes = config
            .controllers
            .into_iter()
            .map(|c| ControllerRuntime::new(c, client.clone()))
            .collect();
        Self { runtimes, grace_period }
    }

    pub async fn run(self) {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let mut handles = Vec::new();
        for runtime in self.runtimes {
            let mut shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let name = runtime.config.name.clone();
                if let Err(err) = runtime
                    .run(async move {
                        let _ = shutdown_rx.recv().await;
                    })
                    .await
                {
                    tracing::error!(controller = %name, error = %err, "controller runtime exited with error");
                }
            }));
        }

        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining controllers");
        let _ = shutdown_tx.send(());

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.grace_period, drain).await.is_err() {
            tracing::warn!(
                grace_period = ?self.grace_period,
                "grace period elapsed with controllers still draining"
            );
        }
    }
}
