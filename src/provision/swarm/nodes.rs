//! Swarm membership: add, remove and list nodes

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::SwarmProvisioner;
use crate::cluster::{
    url_to_host, Availability, ClusterClient, InitRequest, JoinRequest, Node, LABEL_NODE_ADDR,
};
use crate::provision::{AddNodeOptions, ProvisionError, ProvisionResult, RemoveNodeOptions};

impl SwarmProvisioner {
    /// Nodes whose address host is in `address_filter`, or all of them
    ///
    /// Without a known cluster the list is empty.
    pub(crate) async fn list_swarm_nodes(
        &self,
        address_filter: &[String],
    ) -> ProvisionResult<Vec<Node>> {
        let client = match self.choose_client().await {
            Ok(client) => client,
            Err(ProvisionError::NoCluster) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let nodes = client.list_nodes().await?;
        Ok(filter_nodes(nodes, address_filter))
    }

    pub(crate) async fn get_swarm_node(&self, address: &str) -> ProvisionResult<Node> {
        self.list_swarm_nodes(&[address.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::NodeNotFound(address.to_string()))
    }

    /// Bring the engine at `opts.address` into the swarm and label it
    ///
    /// The first node initialises the swarm, later ones join it. A node that
    /// joined but could not be labelled stays in the swarm.
    pub(crate) async fn add_swarm_node(&self, opts: &AddNodeOptions) -> ProvisionResult<()> {
        let existing = match self.choose_client().await {
            Ok(client) => Some(client),
            Err(ProvisionError::NoCluster) => None,
            Err(e) => return Err(e),
        };
        let new_client = self.connector.connect(&opts.address)?;

        match existing {
            None => {
                info!("Initialising swarm on {}", opts.address);
                let request = init_request(&opts.address, self.config.swarm_port);
                new_client.init_swarm(&request).await?;
            }
            Some(existing) => {
                info!("Joining {} to swarm via {}", opts.address, existing.address());
                self.join_swarm(existing.as_ref(), new_client.as_ref(), &opts.address)
                    .await?;
            }
        }

        let info = new_client.info().await?;
        let node = new_client.inspect_node(&info.swarm.node_id).await?;
        let mut spec = node.spec.clone();
        spec.labels = node_labels(&opts.address, &opts.metadata);
        new_client
            .update_node(&node.id, node.version.index, &spec)
            .await?;
        info!("Node {} registered as {}", node.id, opts.address);

        self.refresh_members(new_client.as_ref()).await
    }

    async fn join_swarm(
        &self,
        existing: &dyn ClusterClient,
        new_client: &dyn ClusterClient,
        address: &str,
    ) -> ProvisionResult<()> {
        let swarm = existing.inspect_swarm().await?;
        let info = existing.info().await?;

        let mut remote_addrs: Vec<String> = info
            .swarm
            .remote_managers
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.addr)
            .filter(|a| !a.is_empty())
            .collect();
        if remote_addrs.is_empty() {
            remote_addrs.push(format!(
                "{}:{}",
                url_to_host(existing.address()),
                self.config.swarm_port
            ));
        }
        debug!("Join {} through managers {:?}", address, remote_addrs);

        let mut request = join_request(address, self.config.swarm_port, remote_addrs);
        request.join_token = swarm.join_tokens.manager;
        new_client.join_swarm(&request).await?;
        Ok(())
    }

    /// Remove the node at `opts.address`, draining it first on request
    ///
    /// The drain is not awaited; the removal is forced right after it.
    pub(crate) async fn remove_swarm_node(&self, opts: &RemoveNodeOptions) -> ProvisionResult<()> {
        let node = self.get_swarm_node(&opts.address).await?;
        let client: Arc<dyn ClusterClient> = self.choose_client().await?;

        if opts.rebalance {
            let mut spec = node.spec.clone();
            spec.availability = Availability::Drain;
            client
                .update_node(&node.id, node.version.index, &spec)
                .await?;
            info!("Node {} drained", node.id);
        }
        client.remove_node(&node.id, true).await?;
        info!("Node {} ({}) removed", node.id, opts.address);

        if let Err(e) = self.refresh_members(client.as_ref()).await {
            if client.address() != node.address() {
                return Err(e);
            }
            // The manager we talked to was the node just removed
            warn!("Could not refresh members through removed node: {}", e);
            let members: Vec<String> = self
                .members
                .members()
                .await?
                .into_iter()
                .filter(|m| m != node.address())
                .collect();
            self.members.set_members(members).await?;
        }
        Ok(())
    }
}

// ============================================================================
// SBIO: Pure node logic (no I/O)
// ============================================================================

/// Labels of a newly added node: its address plus caller metadata
pub fn node_labels(address: &str, metadata: &HashMap<String, String>) -> HashMap<String, String> {
    let mut labels = metadata.clone();
    labels.insert(LABEL_NODE_ADDR.to_string(), address.to_string());
    labels
}

/// Keep nodes whose address host appears in the filter; an empty filter keeps all
pub fn filter_nodes(nodes: Vec<Node>, address_filter: &[String]) -> Vec<Node> {
    if address_filter.is_empty() {
        return nodes;
    }
    let hosts: HashSet<String> = address_filter.iter().map(|a| url_to_host(a)).collect();
    nodes
        .into_iter()
        .filter(|n| hosts.contains(&n.host()))
        .collect()
}

fn init_request(address: &str, swarm_port: u16) -> InitRequest {
    InitRequest {
        listen_addr: format!("0.0.0.0:{}", swarm_port),
        advertise_addr: format!("{}:{}", url_to_host(address), swarm_port),
    }
}

fn join_request(address: &str, swarm_port: u16, remote_addrs: Vec<String>) -> JoinRequest {
    JoinRequest {
        listen_addr: format!("0.0.0.0:{}", swarm_port),
        advertise_addr: format!("{}:{}", url_to_host(address), swarm_port),
        remote_addrs,
        join_token: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::store::MemberStore;

    fn add(address: &str) -> AddNodeOptions {
        AddNodeOptions {
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_labels_keep_address() {
        let mut metadata = HashMap::new();
        metadata.insert("pool".to_string(), "gpu".to_string());
        metadata.insert(LABEL_NODE_ADDR.to_string(), "spoofed".to_string());

        let labels = node_labels("http://10.0.0.1:2375", &metadata);
        assert_eq!(labels.get("pool").map(String::as_str), Some("gpu"));
        assert_eq!(
            labels.get(LABEL_NODE_ADDR).map(String::as_str),
            Some("http://10.0.0.1:2375")
        );
    }

    #[test]
    fn test_filter_nodes_by_host() {
        let nodes = vec![
            Node::new("n1").with_label(LABEL_NODE_ADDR, "http://10.0.0.1:2375"),
            Node::new("n2").with_label(LABEL_NODE_ADDR, "https://10.0.0.2:2376"),
        ];
        assert_eq!(filter_nodes(nodes.clone(), &[]).len(), 2);

        let filtered = filter_nodes(nodes, &["tcp://10.0.0.2:2375".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "n2");
    }

    #[test]
    fn test_swarm_requests() {
        let init = init_request("http://10.0.0.1:2375", 2377);
        assert_eq!(init.listen_addr, "0.0.0.0:2377");
        assert_eq!(init.advertise_addr, "10.0.0.1:2377");

        let join = join_request("http://10.0.0.2:2375", 4000, vec!["10.0.0.1:4000".to_string()]);
        assert_eq!(join.advertise_addr, "10.0.0.2:4000");
        assert_eq!(join.remote_addrs, vec!["10.0.0.1:4000"]);
    }

    #[tokio::test]
    async fn test_list_nodes_without_cluster_is_empty() {
        let (provisioner, _, _) = provisioner(fast_config());
        assert!(provisioner.list_swarm_nodes(&[]).await.unwrap().is_empty());
        assert!(matches!(
            provisioner.get_swarm_node("http://10.0.0.1:2375").await,
            Err(ProvisionError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_node_keeps_metadata() {
        let (provisioner, _, store) = provisioner(fast_config());
        let mut opts = add("http://10.0.0.1:2375");
        opts.metadata.insert("pool".to_string(), "web".to_string());
        provisioner.add_swarm_node(&opts).await.unwrap();

        let node = provisioner
            .get_swarm_node("http://10.0.0.1:2375")
            .await
            .unwrap();
        assert_eq!(node.metadata().get("pool").map(String::as_str), Some("web"));
        assert_eq!(
            store.members().await.unwrap(),
            vec!["http://10.0.0.1:2375".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_last_node_clears_members() {
        let (provisioner, cluster, store) = provisioner(fast_config());
        provisioner
            .add_swarm_node(&add("http://10.0.0.1:2375"))
            .await
            .unwrap();
        provisioner
            .remove_swarm_node(&RemoveNodeOptions {
                address: "http://10.0.0.1:2375".to_string(),
                rebalance: false,
            })
            .await
            .unwrap();

        assert!(cluster.nodes().await.is_empty());
        assert!(store.members().await.unwrap().is_empty());
    }
}
