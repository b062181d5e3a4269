//! Persistent per-process services
//!
//! Every process of an app runs as one service named `{app}-{process}`. A
//! deploy creates the service the first time and updates it in place after
//! that, carrying the version index it read.

use std::collections::HashMap;

use tracing::info;

use super::SwarmProvisioner;
use crate::cluster::{
    ClusterClient, EndpointSpec, PortConfig, RestartCondition, RestartPolicy, ServiceMode,
    ServiceSpec, TaskSpec, LABEL_APP_IMAGE, LABEL_APP_NAME, LABEL_APP_PLATFORM, LABEL_APP_PROCESS,
};
use crate::provision::{App, ProvisionResult};

/// Inputs of a persistent service spec
#[derive(Debug, Clone)]
pub struct ServiceOpts<'a> {
    pub app: &'a App,
    pub process: &'a str,
    pub command: &'a str,
    pub image: &'a str,
    /// Container port the process listens on
    pub port: u16,
    /// Spec of the running service, if there is one
    pub base_spec: Option<&'a ServiceSpec>,
}

/// Name of the persistent service running `process` of `app`
pub fn service_name_for_app(app: &str, process: &str) -> String {
    format!("{}-{}", app, process)
}

// ============================================================================
// SBIO: Pure spec construction (no I/O)
// ============================================================================

/// Spec of a persistent process service
///
/// With a base spec everything an operator may have changed (replicas,
/// restart policy, unknown settings, other env vars) is kept; image, command,
/// `PORT` and the dockyard labels are overwritten.
pub fn service_spec_for_app(opts: &ServiceOpts<'_>) -> ServiceSpec {
    let mut spec = match opts.base_spec {
        Some(base) => base.clone(),
        None => default_spec(),
    };
    let labels = process_labels(opts.app, opts.process, opts.image);

    spec.name = service_name_for_app(&opts.app.name, opts.process);
    spec.labels.extend(labels.clone());

    let container = &mut spec.task_template.container_spec;
    container.image = opts.image.to_string();
    container.command = vec![
        "/bin/sh".to_string(),
        "-lc".to_string(),
        opts.command.to_string(),
    ];
    container.args.clear();
    container.labels.extend(labels);
    set_env(&mut container.env, "PORT", &opts.port.to_string());

    let target = u32::from(opts.port);
    let endpoint = spec.endpoint_spec.get_or_insert_with(EndpointSpec::default);
    if !endpoint.ports.iter().any(|p| p.target_port == target) {
        endpoint.ports = vec![PortConfig {
            protocol: "tcp".to_string(),
            target_port: target,
            published_port: 0,
        }];
    }
    spec
}

fn default_spec() -> ServiceSpec {
    ServiceSpec {
        task_template: TaskSpec {
            restart_policy: Some(RestartPolicy {
                condition: RestartCondition::Any,
                ..Default::default()
            }),
            ..Default::default()
        },
        mode: ServiceMode::replicated(1),
        ..Default::default()
    }
}

fn process_labels(app: &App, process: &str, image: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_APP_NAME.to_string(), app.name.clone());
    labels.insert(LABEL_APP_PROCESS.to_string(), process.to_string());
    labels.insert(LABEL_APP_PLATFORM.to_string(), app.platform.clone());
    labels.insert(LABEL_APP_IMAGE.to_string(), image.to_string());
    labels
}

/// Set `KEY=value` in an env list, replacing an existing entry for `KEY`
fn set_env(env: &mut Vec<String>, key: &str, value: &str) {
    let prefix = format!("{}=", key);
    env.retain(|e| !e.starts_with(&prefix));
    env.push(format!("{}{}", prefix, value));
}

// ============================================================================
// I/O boundary
// ============================================================================

impl SwarmProvisioner {
    /// Create or update the service of one process
    ///
    /// A stale version index comes back as a conflict; nothing is retried.
    pub(crate) async fn deploy_process(
        &self,
        client: &dyn ClusterClient,
        app: &App,
        process: &str,
        command: &str,
        image: &str,
        port: u16,
    ) -> ProvisionResult<()> {
        let name = service_name_for_app(&app.name, process);
        let existing = match client.inspect_service(&name).await {
            Ok(service) => Some(service),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let opts = ServiceOpts {
            app,
            process,
            command,
            image,
            port,
            base_spec: existing.as_ref().map(|s| &s.spec),
        };
        let spec = service_spec_for_app(&opts);

        match existing {
            Some(service) => {
                client
                    .update_service(&service.id, service.version.index, &spec)
                    .await?;
                info!("Updated service {} to {}", name, image);
            }
            None => {
                let id = client.create_service(&spec).await?;
                info!("Created service {} ({}) running {}", name, id, image);
            }
        }
        Ok(())
    }

    /// Reconcile every process of `image`, then record it as the app's
    /// current image
    ///
    /// Processes already reconciled stay updated when a later one fails.
    pub(crate) async fn deploy_processes(
        &self,
        client: &dyn ClusterClient,
        app: &App,
        image: &str,
    ) -> ProvisionResult<()> {
        let metadata = self.images.image_metadata(image).await?;
        let port = metadata.container_port().unwrap_or(self.config.default_port);
        for (process, command) in metadata.processes() {
            self.deploy_process(client, app, &process, &command, image, port)
                .await?;
        }
        self.images.append_app_image(&app.name, image).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cluster::{ClusterError, InitRequest, MemoryCluster};
    use crate::image::ImageMetadata;
    use crate::provision::ProvisionError;
    use crate::store::{ImageStore, MemoryStore};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn opts<'a>(app: &'a App, base: Option<&'a ServiceSpec>) -> ServiceOpts<'a> {
        ServiceOpts {
            app,
            process: "web",
            command: "python app.py",
            image: "dockyard/app-myapp:v2",
            port: 8080,
            base_spec: base,
        }
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name_for_app("myapp", "worker"), "myapp-worker");
    }

    #[test]
    fn test_new_spec_defaults() {
        let app = App::new("myapp", "python");
        let spec = service_spec_for_app(&opts(&app, None));

        assert_eq!(spec.name, "myapp-web");
        assert_eq!(spec.mode.replicas(), 1);
        let container = &spec.task_template.container_spec;
        assert_eq!(container.command, vec!["/bin/sh", "-lc", "python app.py"]);
        assert_eq!(container.env, vec!["PORT=8080"]);
        assert_eq!(
            container.labels.get(LABEL_APP_PROCESS).map(String::as_str),
            Some("web")
        );
        assert_eq!(
            spec.labels.get(LABEL_APP_NAME).map(String::as_str),
            Some("myapp")
        );
        assert_eq!(spec.endpoint_spec.unwrap().ports[0].target_port, 8080);
    }

    #[test]
    fn test_base_spec_keeps_operator_settings() {
        let app = App::new("myapp", "python");
        let mut base = service_spec_for_app(&opts(&app, None));
        base.mode = ServiceMode::replicated(5);
        base.task_template.container_spec.env.push("DEBUG=1".to_string());
        base.extra
            .insert("UpdateConfig".to_string(), serde_json::json!({"Parallelism": 2}));
        base.task_template.container_spec.image = "dockyard/app-myapp:v1".to_string();

        let spec = service_spec_for_app(&opts(&app, Some(&base)));
        assert_eq!(spec.mode.replicas(), 5);
        assert!(spec.extra.contains_key("UpdateConfig"));
        assert_eq!(spec.task_template.container_spec.image, "dockyard/app-myapp:v2");
        assert_eq!(
            spec.task_template.container_spec.env,
            vec!["DEBUG=1", "PORT=8080"]
        );
        assert_eq!(
            spec.labels.get(LABEL_APP_IMAGE).map(String::as_str),
            Some("dockyard/app-myapp:v2")
        );
    }

    #[test]
    fn test_set_env_replaces_key() {
        let mut env = vec!["PORT=1".to_string(), "PORTAL=x".to_string()];
        set_env(&mut env, "PORT", "2");
        assert_eq!(env, vec!["PORTAL=x", "PORT=2"]);
    }

    async fn manager(cluster: &MemoryCluster) -> Arc<dyn ClusterClient> {
        let client = cluster.client("http://10.0.0.1:2375");
        client
            .init_swarm(&InitRequest {
                listen_addr: "0.0.0.0:2377".to_string(),
                advertise_addr: "10.0.0.1:2377".to_string(),
            })
            .await
            .unwrap();
        client
    }

    async fn register_processes(store: &MemoryStore, image: &str) {
        let mut processes = BTreeMap::new();
        processes.insert("web".to_string(), "./web".to_string());
        processes.insert("worker".to_string(), "./worker".to_string());
        let metadata = ImageMetadata::new(image).with_processes(&processes, None);
        store
            .save_custom_data(image, metadata.custom_data)
            .await
            .unwrap();
    }

    async fn service_image(client: &dyn ClusterClient, name: &str) -> String {
        client
            .inspect_service(name)
            .await
            .unwrap()
            .spec
            .task_template
            .container_spec
            .image
    }

    #[tokio::test]
    async fn test_deploy_processes_records_image() {
        let (provisioner, cluster, store) = provisioner(fast_config());
        let client = manager(&cluster).await;
        register_processes(&store, "img:v1").await;

        let app = App::new("myapp", "python");
        provisioner
            .deploy_processes(client.as_ref(), &app, "img:v1")
            .await
            .unwrap();

        let names: Vec<String> = cluster
            .services()
            .await
            .into_iter()
            .map(|s| s.spec.name)
            .collect();
        assert_eq!(names, vec!["myapp-web", "myapp-worker"]);
        assert_eq!(
            store.current_image("myapp").await.unwrap().as_deref(),
            Some("img:v1")
        );
        let web = client.inspect_service("myapp-web").await.unwrap();
        assert_eq!(
            web.spec.task_template.container_spec.env,
            vec!["PORT=8888"]
        );
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict_without_retry() {
        let (provisioner, cluster, _store) = provisioner(fast_config());
        let client = manager(&cluster).await;
        let app = App::new("myapp", "python");
        provisioner
            .deploy_process(client.as_ref(), &app, "web", "./web", "img:v1", 8888)
            .await
            .unwrap();

        cluster.race_next_inspect("myapp-web").await;
        let err = provisioner
            .deploy_process(client.as_ref(), &app, "web", "./web", "img:v2", 8888)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Cluster(ClusterError::Conflict { .. })
        ));

        // A retry would have re-read the version and gone through
        let calls = cluster.calls().await;
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("update_service:")).count(),
            0
        );
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("create_service:")).count(),
            1
        );
        assert_eq!(service_image(client.as_ref(), "myapp-web").await, "img:v1");
    }

    #[tokio::test]
    async fn test_failed_process_keeps_earlier_ones() {
        let (provisioner, cluster, store) = provisioner(fast_config());
        let client = manager(&cluster).await;
        register_processes(&store, "img:v1").await;
        register_processes(&store, "img:v2").await;
        let app = App::new("myapp", "python");
        provisioner
            .deploy_processes(client.as_ref(), &app, "img:v1")
            .await
            .unwrap();

        // web reconciles first, then worker hits a stale version
        cluster.race_next_inspect("myapp-worker").await;
        let err = provisioner
            .deploy_processes(client.as_ref(), &app, "img:v2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Cluster(ClusterError::Conflict { .. })
        ));

        assert_eq!(service_image(client.as_ref(), "myapp-web").await, "img:v2");
        assert_eq!(
            service_image(client.as_ref(), "myapp-worker").await,
            "img:v1"
        );
        assert_eq!(
            store.app_images("myapp").await.unwrap(),
            vec!["img:v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_first_deploy_records_nothing() {
        let (provisioner, cluster, store) = provisioner(fast_config());
        let client = manager(&cluster).await;
        register_processes(&store, "img:v1").await;
        cluster.fail_on("create service").await;

        let app = App::new("myapp", "python");
        let err = provisioner
            .deploy_processes(client.as_ref(), &app, "img:v1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Cluster(ClusterError::Api { status: 500, .. })
        ));
        assert!(cluster.services().await.is_empty());
        assert!(store.app_images("myapp").await.unwrap().is_empty());
    }
}
