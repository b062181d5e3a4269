//! One-shot build services
//!
//! A build runs a single command in a fresh container: the service has one
//! replica and restart policy `none`, so its only task ends in a terminal
//! state. The caller holds a [`BuildService`] and removes it once it is done
//! with the container, whatever the outcome. Dropping the handle first, as a
//! cancelled deploy does, removes the service in the background.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::SwarmProvisioner;
use crate::cluster::{
    ClusterClient, ContainerSpec, LogSink, RestartCondition, RestartPolicy, ServiceMode,
    ServiceSpec, Task, TaskSpec, TaskState, LABEL_APP_NAME, LABEL_APP_PLATFORM,
    LABEL_BUILD_IMAGE, LABEL_IS_BUILD,
};
use crate::image::split_image_name;
use crate::provision::{App, ProvisionError, ProvisionResult};

/// A build container that exited successfully
pub(crate) struct BuildOutcome {
    pub task: Task,
    /// Client of the engine the container ran on
    pub client: Arc<dyn ClusterClient>,
}

impl BuildOutcome {
    pub fn container_id(&self) -> &str {
        self.task.container_id()
    }
}

/// A created build service, removed on drop unless [`remove`](Self::remove)
/// ran first
pub(crate) struct BuildService {
    client: Arc<dyn ClusterClient>,
    id: String,
    removed: bool,
}

impl BuildService {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the service now; failures are logged
    pub async fn remove(mut self) {
        self.removed = true;
        remove_service_and_log(self.client.as_ref(), &self.id).await;
    }
}

impl Drop for BuildService {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Build service {} abandoned, removing in background", id);
                handle.spawn(async move {
                    remove_service_and_log(client.as_ref(), &id).await;
                });
            }
            Err(_) => error!("Build service {} left behind: no runtime to remove it", id),
        }
    }
}

// ============================================================================
// SBIO: Pure spec construction (no I/O)
// ============================================================================

/// Unique name of a build service for `app`
pub fn build_service_name(app: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-build-{}", app, &suffix[..12])
}

/// Spec of a one-shot build service running `cmds` in `image`
///
/// `building_image` is the image the build will produce; custom data reported
/// from inside the container is attached to it.
pub fn build_service_spec(
    app: &App,
    image: &str,
    building_image: &str,
    cmds: Vec<String>,
) -> ServiceSpec {
    let mut labels = HashMap::new();
    labels.insert(LABEL_APP_NAME.to_string(), app.name.clone());
    labels.insert(LABEL_APP_PLATFORM.to_string(), app.platform.clone());
    labels.insert(LABEL_IS_BUILD.to_string(), "true".to_string());
    labels.insert(LABEL_BUILD_IMAGE.to_string(), building_image.to_string());

    ServiceSpec {
        name: build_service_name(&app.name),
        labels: labels.clone(),
        task_template: TaskSpec {
            container_spec: ContainerSpec {
                image: image.to_string(),
                command: cmds,
                labels,
                ..Default::default()
            },
            restart_policy: Some(RestartPolicy {
                condition: RestartCondition::None,
                ..Default::default()
            }),
            ..Default::default()
        },
        mode: ServiceMode::replicated(1),
        ..Default::default()
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

impl SwarmProvisioner {
    /// Create the build service
    pub(crate) async fn create_build_service(
        &self,
        client: &Arc<dyn ClusterClient>,
        app: &App,
        image: &str,
        building_image: &str,
        cmds: Vec<String>,
    ) -> ProvisionResult<BuildService> {
        let spec = build_service_spec(app, image, building_image, cmds);
        let id = client.create_service(&spec).await?;
        debug!("Created build service {} ({}) from {}", spec.name, id, image);
        Ok(BuildService {
            client: client.clone(),
            id,
            removed: false,
        })
    }

    /// Wait for the build container to finish and copy its output to `sink`
    ///
    /// Fails with [`ProvisionError::BuildFailed`] on a non-zero exit code.
    pub(crate) async fn run_build(
        &self,
        client: &Arc<dyn ClusterClient>,
        service_id: &str,
        sink: LogSink<'_>,
    ) -> ProvisionResult<BuildOutcome> {
        let tasks = self
            .waiter
            .wait(client.as_ref(), service_id, TaskState::Shutdown)
            .await?;
        let task = tasks
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::NoTasks(service_id.to_string()))?;

        let node_client = self.client_for_node(client, &task.node_id).await?;
        let container_id = task.container_id().to_string();
        node_client.container_logs(&container_id, sink).await?;
        let exit_code = node_client.wait_container(&container_id).await?;
        if exit_code != 0 {
            return Err(ProvisionError::BuildFailed(exit_code));
        }
        debug!("Build container {} finished", container_id);

        Ok(BuildOutcome {
            task,
            client: node_client,
        })
    }

    /// Commit the build container as `image` and push it; returns the image id
    pub(crate) async fn commit_push_build_image(
        &self,
        client: &dyn ClusterClient,
        container_id: &str,
        image: &str,
    ) -> ProvisionResult<String> {
        let (repo, tag) = split_image_name(image);
        let id = client.commit_container(container_id, &repo, &tag).await?;
        info!("Committed container {} as {}", container_id, image);
        self.push_image(client, image).await?;
        Ok(id)
    }

    /// Push `image` to the configured registry
    ///
    /// Without a registry images stay on the engine that built them.
    pub(crate) async fn push_image(
        &self,
        client: &dyn ClusterClient,
        image: &str,
    ) -> ProvisionResult<()> {
        let has_registry = self
            .config
            .registry
            .as_deref()
            .map(|r| !r.is_empty())
            .unwrap_or(false);
        if !has_registry {
            debug!("No registry configured, not pushing {}", image);
            return Ok(());
        }
        let (repo, tag) = split_image_name(image);
        client.push_image(&repo, &tag).await?;
        info!("Pushed {}", image);
        Ok(())
    }
}

/// Remove a build service; failures are logged and swallowed
pub(crate) async fn remove_service_and_log(client: &dyn ClusterClient, service_id: &str) {
    match client.remove_service(service_id).await {
        Ok(()) => debug!("Removed build service {}", service_id),
        Err(e) => error!("Failed to remove build service {}: {}", service_id, e),
    }
}
