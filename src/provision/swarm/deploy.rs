//! Archive and image deploys
//!
//! Both deploys follow the same shape: start a build service, run the deploy
//! body against it, then remove the build service whether the body succeeded
//! or not. A deploy dropped mid-body still removes it, in the background. The
//! body ends by reconciling one service per process.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::info;

use super::SwarmProvisioner;
use crate::cluster::{ClusterClient, ImageInspect, LogSink};
use crate::image::{
    app_image_name, archive_deploy_cmds, build_image, parse_procfile, processes_from_entrypoint,
    read_procfile_cmds, split_image_name, with_default_tag, ImageMetadata,
};
use crate::provision::{App, ProvisionError, ProvisionResult};
use crate::store::StoreError;

impl SwarmProvisioner {
    /// Build `archive_url` on the app's build image and deploy the result
    pub(crate) async fn deploy_archive(
        &self,
        app: &App,
        archive_url: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<String> {
        let client = self.choose_client().await?;
        let current = self.images.current_image(&app.name).await?;
        let base_image = build_image(&self.config, app, current.as_deref());
        let version = self.images.next_image_version(&app.name).await?;
        let new_image = app_image_name(&self.config, &app.name, version);
        info!(
            "Deploying {} from archive on {} as {}",
            app.name, base_image, new_image
        );

        let cmds = archive_deploy_cmds(&self.config, archive_url);
        let build = self
            .create_build_service(&client, app, &base_image, &new_image, cmds)
            .await?;
        let result = self
            .archive_deploy_body(&client, build.id(), app, &new_image, events)
            .await;
        build.remove().await;
        result.map(|_| new_image)
    }

    async fn archive_deploy_body(
        &self,
        client: &Arc<dyn ClusterClient>,
        service_id: &str,
        app: &App,
        new_image: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<()> {
        let outcome = self.run_build(client, service_id, &mut *events).await?;
        self.commit_push_build_image(outcome.client.as_ref(), outcome.container_id(), new_image)
            .await?;

        // Processes reported from inside the build take precedence
        let registered = match self.images.image_metadata(new_image).await {
            Ok(metadata) => metadata,
            Err(StoreError::ImageNotFound(_)) => ImageMetadata::new(new_image),
            Err(e) => return Err(e.into()),
        };
        if registered.processes().is_empty() {
            events
                .write_all(b"  ---> No processes registered, trying to get entrypoint\n")
                .await?;
            let inspect = outcome.client.inspect_image(new_image).await?;
            let processes = processes_from_entrypoint(inspect.config.entrypoint())
                .ok_or_else(|| ProvisionError::NoProcfileOrEntrypoint(new_image.to_string()))?;
            let exposed_port = single_exposed_port(new_image, &inspect)?;
            let metadata = ImageMetadata::new(new_image)
                .with_processes(&processes, exposed_port.as_deref());
            self.images
                .save_custom_data(new_image, metadata.custom_data)
                .await?;
        }

        self.deploy_processes(client.as_ref(), app, new_image).await
    }

    /// Deploy a pre-built image under a new app image name
    pub(crate) async fn deploy_image(
        &self,
        app: &App,
        image: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<String> {
        let client = self.choose_client().await?;
        let image = with_default_tag(image);
        let version = self.images.next_image_version(&app.name).await?;
        let new_image = app_image_name(&self.config, &app.name, version);
        info!("Deploying {} from image {} as {}", app.name, image, new_image);

        events.write_all(b"---- Pulling image ----\n").await?;
        let build = self
            .create_build_service(&client, app, &image, &new_image, read_procfile_cmds())
            .await?;
        let result = self
            .image_deploy_body(&client, build.id(), app, &image, &new_image, events)
            .await;
        build.remove().await;
        result.map(|_| new_image)
    }

    async fn image_deploy_body(
        &self,
        client: &Arc<dyn ClusterClient>,
        service_id: &str,
        app: &App,
        image: &str,
        new_image: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<()> {
        let mut procfile_output: Vec<u8> = Vec::new();
        let outcome = self
            .run_build(client, service_id, &mut procfile_output)
            .await?;
        let node_client = outcome.client;

        let inspect = node_client.inspect_image(image).await?;
        let exposed_port = single_exposed_port(image, &inspect)?;

        let mut processes = parse_procfile(&String::from_utf8_lossy(&procfile_output));
        if processes.is_empty() {
            events
                .write_all(b"  ---> Procfile not found, trying to get entrypoint\n")
                .await?;
            processes = processes_from_entrypoint(inspect.config.entrypoint())
                .ok_or_else(|| ProvisionError::NoProcfileOrEntrypoint(image.to_string()))?;
        }
        write_processes(&mut *events, &processes).await?;

        let (repo, tag) = split_image_name(new_image);
        node_client.tag_image(image, &repo, &tag).await?;
        self.push_image(node_client.as_ref(), new_image).await?;

        let metadata =
            ImageMetadata::new(new_image).with_processes(&processes, exposed_port.as_deref());
        self.images
            .save_custom_data(new_image, metadata.custom_data)
            .await?;

        self.deploy_processes(client.as_ref(), app, new_image).await
    }
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// The image's only exposed port; more than one is ambiguous
fn single_exposed_port(image: &str, inspect: &ImageInspect) -> ProvisionResult<Option<String>> {
    let ports = inspect.config.exposed_ports();
    if ports.len() > 1 {
        return Err(ProvisionError::TooManyPorts {
            image: image.to_string(),
            ports: ports.join(", "),
        });
    }
    Ok(ports.into_iter().next())
}

async fn write_processes(
    events: LogSink<'_>,
    processes: &BTreeMap<String, String>,
) -> ProvisionResult<()> {
    for (name, command) in processes {
        let line = format!("  ---> Process {} found with command: {}\n", name, command);
        events.write_all(line.as_bytes()).await?;
    }
    Ok(())
}
