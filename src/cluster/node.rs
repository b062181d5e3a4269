//! Node resource - a machine that is a member of the swarm
//!
//! A Node is created by the control plane when an engine initialises or joins
//! the swarm. dockyard never creates nodes directly, it only:
//! - labels them with their reachable engine address and caller metadata
//! - drains them before removal
//! - removes them

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::addr::url_to_host;
use super::{LABEL_NODE_ADDR, LABEL_PREFIX};

/// Version index used for optimistic-concurrency updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    #[serde(rename = "Index", default)]
    pub index: u64,
}

/// A Node in the swarm, as reported by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Cluster-assigned identity
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Version", default)]
    pub version: Version,

    #[serde(rename = "CreatedAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(rename = "Spec", default)]
    pub spec: NodeSpec,

    #[serde(rename = "Status", default)]
    pub status: NodeStatus,

    /// Present only on manager nodes
    #[serde(rename = "ManagerStatus", default, skip_serializing_if = "Option::is_none")]
    pub manager_status: Option<ManagerStatus>,
}

/// The writable part of a Node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "Role", default)]
    pub role: NodeRole,

    #[serde(rename = "Availability", default)]
    pub availability: Availability,
}

/// Scheduling availability of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Node accepts new tasks
    #[default]
    Active,
    /// Node keeps its tasks but accepts no new ones
    Pause,
    /// Node accepts no tasks and existing ones are evicted
    Drain,
}

/// Role of a node in the swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Worker,
    Manager,
}

/// Observed state of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// unknown, down, ready or disconnected
    #[serde(rename = "State", default)]
    pub state: String,

    #[serde(rename = "Message", default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// IP address the node connects to the swarm from
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

/// Raft membership details of a manager node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerStatus {
    #[serde(rename = "Leader", default)]
    pub leader: bool,

    #[serde(rename = "Reachability", default)]
    pub reachability: String,

    /// Swarm listen address (host:port)
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

impl Node {
    /// Create a new Node with minimal configuration
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Set the role
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.spec.role = role;
        self
    }

    /// The reachable engine address this node was registered with
    pub fn address(&self) -> &str {
        self.spec
            .labels
            .get(LABEL_NODE_ADDR)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Host part of the reachable address
    pub fn host(&self) -> String {
        url_to_host(self.address())
    }

    /// Caller metadata, i.e. every label dockyard did not set for itself
    pub fn metadata(&self) -> HashMap<String, String> {
        self.spec
            .labels
            .iter()
            .filter(|(k, _)| !k.starts_with(LABEL_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Check if node is a swarm manager
    pub fn is_manager(&self) -> bool {
        self.spec.role == NodeRole::Manager || self.manager_status.is_some()
    }

    /// Check if node can receive new tasks
    pub fn is_schedulable(&self) -> bool {
        self.spec.availability == Availability::Active
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Availability::Active => "active",
            Availability::Pause => "pause",
            Availability::Drain => "drain",
        };
        write!(f, "{}", s)
    }
}
