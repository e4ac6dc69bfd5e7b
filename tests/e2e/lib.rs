#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;
    use whitebox_runtime::config::{
        ControllerConfig, DependentDescriptor, ExecConfig, FinalizerConfig, Gvk, HandlerConfig,
        ReconcilerConfig,
    };
    use whitebox_runtime::manager::ControllerRuntime;

    fn configmap_gvk() -> Gvk {
        Gvk {
            group: "".into(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
            plural: "configmaps".into(),
        }
    }

    // Desired state: a finalizer, and a dependent ConfigMap carrying the
    // primary's data. `jq` reshapes the state document in place rather than
    // needing a purpose-built handler binary.
    fn reconciler_handler() -> HandlerConfig {
        let filter = r#"
            .object.metadata.finalizers = ["e2e.whitebox/cleanup"] |
            .dependents = [{
              "apiVersion": "v1",
              "kind": "ConfigMap",
              "metadata": {"name": (.object.metadata.name + "-child")},
              "data": (.object.data // {})
            }]
        "#;
        HandlerConfig {
            exec: Some(ExecConfig {
                command: "jq".into(),
                args: vec![filter.trim().into()],
                working_dir: None,
                env: vec![],
                timeout: Some(Duration::from_secs(5)),
                debug: false,
            }),
            http: None,
        }
    }

    // Releases the finalizer unconditionally; owner-reference based garbage
    // collection takes care of the dependent ConfigMap once the primary is
    // actually removed.
    fn finalizer_handler() -> HandlerConfig {
        HandlerConfig {
            exec: Some(ExecConfig {
                command: "jq".into(),
                args: vec![".object.metadata.finalizers = []".into()],
                working_dir: None,
                env: vec![],
                timeout: Some(Duration::from_secs(5)),
                debug: false,
            }),
            http: None,
        }
    }

    fn controller_config(name: &str) -> ControllerConfig {
        ControllerConfig {
            name: name.into(),
            resource: configmap_gvk(),
            dependents: vec![DependentDescriptor {
                gvk: configmap_gvk(),
                orphan: false,
            }],
            references: vec![],
            reconciler: ReconcilerConfig {
                handler: reconciler_handler(),
                requeue_after: None,
                observe: false,
            },
            finalizer: Some(FinalizerConfig {
                handler: finalizer_handler(),
                key: "e2e.whitebox/cleanup".into(),
            }),
            syncer: Default::default(),
            workers: 2,
        }
    }

    fn has_child() -> impl Condition<ConfigMap> {
        |obj: Option<&ConfigMap>| obj.is_some()
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(20),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn run_controller_in_background(name: &str, client: Client) -> tokio::sync::oneshot::Sender<()> {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let runtime = ControllerRuntime::new(controller_config(name), client);
        tokio::spawn(async move {
            let _ = runtime
                .run(async move {
                    let _ = stop_rx.await;
                })
                .await;
        });
        // give the informers a moment to establish their initial list/watch.
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop_tx
    }

    #[tokio::test]
    async fn converges_dependent_configmap_and_finalizer() {
        let client = Client::try_default().await.unwrap();
        let stop = run_controller_in_background("e2e-converge", client.clone()).await;

        let cm_api = Api::<ConfigMap>::namespaced(client.clone(), "default");
        let name = "e2e-primary";
        let primary = ConfigMap {
            metadata: kube::core::ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            data: Some([("greeting".to_string(), "hello".to_string())].into()),
            ..Default::default()
        };
        cm_api.create(&PostParams::default(), &primary).await.unwrap();

        let child_name = format!("{name}-child");
        wait_for(cm_api.clone(), &child_name, has_child()).await;

        let child = cm_api.get(&child_name).await.unwrap();
        assert_eq!(
            child.data.as_ref().and_then(|d| d.get("greeting")).map(String::as_str),
            Some("hello")
        );

        let updated = cm_api.get(name).await.unwrap();
        assert!(updated
            .finalizers()
            .iter()
            .any(|f| f == "e2e.whitebox/cleanup"));

        cm_api.delete(name, &Default::default()).await.unwrap();
        wait_for(
            cm_api.clone(),
            name,
            conditions::is_deleted(&updated.uid().unwrap()),
        )
        .await;

        let child = cm_api.get(&child_name).await.unwrap();
        wait_for(
            cm_api.clone(),
            &child_name,
            conditions::is_deleted(&child.uid().unwrap()),
        )
        .await;

        let _ = stop.send(());
    }
}
