//! Swarm provisioner
//!
//! Runs apps as Docker swarm services: one persistent service per app
//! process, plus short-lived build services that run a single container to
//! completion.
//!
//! ## Module layout
//!
//! - `waiter`: bounded polling for task states
//! - `nodes`: join, label, drain and remove swarm nodes
//! - `build`: one-shot build services and image commit/push
//! - `reconcile`: create-or-update of persistent process services
//! - `units`: task/service/node join into units
//! - `deploy`: archive and image deploys built from the above

mod build;
mod deploy;
mod nodes;
mod reconcile;
mod units;
mod waiter;

pub use reconcile::{service_name_for_app, service_spec_for_app, ServiceOpts};
pub use waiter::TaskWaiter;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    AddNodeOptions, App, ProvisionError, ProvisionResult, Provisioner, ProvisionerContext,
    RemoveNodeOptions, Unit,
};
use crate::cluster::{ClientConnector, ClusterClient, LogSink, Node};
use crate::config::SwarmConfig;
use crate::image::CustomData;
use crate::store::{ImageStore, MemberStore};

/// Name the swarm provisioner is registered under
pub const PROVISIONER_NAME: &str = "swarm";

/// Provisioner backed by a Docker swarm
pub struct SwarmProvisioner {
    config: Arc<SwarmConfig>,
    connector: Arc<dyn ClientConnector>,
    images: Arc<dyn ImageStore>,
    members: Arc<dyn MemberStore>,
    waiter: TaskWaiter,
}

impl SwarmProvisioner {
    pub fn new(context: ProvisionerContext) -> Self {
        let waiter = TaskWaiter::from_config(&context.config);
        Self {
            config: context.config,
            connector: context.connector,
            images: context.images,
            members: context.members,
            waiter,
        }
    }

    /// Registry constructor
    pub fn factory(context: ProvisionerContext) -> ProvisionResult<Arc<dyn Provisioner>> {
        Ok(Arc::new(Self::new(context)))
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    // =========================================================================
    // Cluster access
    // =========================================================================

    /// Client for a known manager of the swarm
    ///
    /// Members are tried in the order they were stored; one that cannot be
    /// reached or is not a manager any more is skipped.
    pub(crate) async fn choose_client(&self) -> ProvisionResult<Arc<dyn ClusterClient>> {
        let members = self.members.members().await?;
        if members.is_empty() {
            return Err(ProvisionError::NoCluster);
        }

        let mut last_error = None;
        for address in &members {
            let client = match self.connector.connect(address) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Skipping swarm member {}: {}", address, e);
                    last_error = Some(e);
                    continue;
                }
            };
            match client.info().await {
                Ok(info) if info.swarm.control_available => return Ok(client),
                Ok(_) => debug!("Swarm member {} is no longer a manager", address),
                Err(e) => {
                    warn!("Skipping swarm member {}: {}", address, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Err(ProvisionError::NoCluster),
        }
    }

    /// Client talking to the engine of a node, falling back to `client`
    /// when the node carries no address label
    pub(crate) async fn client_for_node(
        &self,
        client: &Arc<dyn ClusterClient>,
        node_id: &str,
    ) -> ProvisionResult<Arc<dyn ClusterClient>> {
        let node = client.inspect_node(node_id).await?;
        let address = node.address();
        if address.is_empty() || address == client.address() {
            return Ok(client.clone());
        }
        Ok(self.connector.connect(address)?)
    }

    /// Store the addresses of every manager as the known members
    pub(crate) async fn refresh_members(&self, client: &dyn ClusterClient) -> ProvisionResult<()> {
        let nodes = client.list_nodes().await?;
        let members = manager_addresses(&nodes);
        debug!("Refreshing swarm members: {:?}", members);
        self.members.set_members(members).await?;
        Ok(())
    }
}

/// Addresses of manager nodes that carry an address label
fn manager_addresses(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.is_manager() && !n.address().is_empty())
        .map(|n| n.address().to_string())
        .collect()
}

#[async_trait]
impl Provisioner for SwarmProvisioner {
    fn name(&self) -> &str {
        PROVISIONER_NAME
    }

    async fn units(&self, app: &App) -> ProvisionResult<Vec<Unit>> {
        self.app_units(app).await
    }

    async fn routable_units(&self, app: &App) -> ProvisionResult<Vec<Unit>> {
        self.app_routable_units(app).await
    }

    async fn archive_deploy(
        &self,
        app: &App,
        archive_url: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<String> {
        self.deploy_archive(app, archive_url, events).await
    }

    async fn image_deploy(
        &self,
        app: &App,
        image: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<String> {
        self.deploy_image(app, image, events).await
    }

    async fn register_unit(
        &self,
        unit_id: &str,
        custom_data: Option<CustomData>,
    ) -> ProvisionResult<()> {
        self.register_build_unit(unit_id, custom_data).await
    }

    async fn list_nodes(&self, address_filter: &[String]) -> ProvisionResult<Vec<Node>> {
        self.list_swarm_nodes(address_filter).await
    }

    async fn get_node(&self, address: &str) -> ProvisionResult<Node> {
        self.get_swarm_node(address).await
    }

    async fn add_node(&self, opts: &AddNodeOptions) -> ProvisionResult<()> {
        self.add_swarm_node(opts).await
    }

    async fn remove_node(&self, opts: &RemoveNodeOptions) -> ProvisionResult<()> {
        self.remove_swarm_node(opts).await
    }
}
