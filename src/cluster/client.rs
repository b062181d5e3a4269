//! Control-plane client contract
//!
//! [`ClusterClient`] is the request/response surface dockyard needs from a
//! swarm: node, service and task CRUD, image commit/tag/push and container
//! log streaming. Implementations perform no retries; every failure is
//! returned with the name of the operation that produced it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWrite;

use super::node::{Node, NodeSpec};
use super::service::{Service, ServiceSpec, Task};

/// Result type for control-plane calls
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by a [`ClusterClient`]
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{op}: request failed: {source}")]
    Transport {
        op: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op}: {kind} not found: {id}")]
    NotFound {
        op: String,
        kind: String,
        id: String,
    },

    #[error("{op}: version conflict: {message}")]
    Conflict { op: String, message: String },

    #[error("{op}: control plane returned {status}: {message}")]
    Api {
        op: String,
        status: u16,
        message: String,
    },

    #[error("{op}: invalid response: {message}")]
    Decode { op: String, message: String },

    #[error("Invalid engine address: {0}")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ClusterError {
    pub fn not_found(op: &str, kind: &str, id: &str) -> Self {
        ClusterError::NotFound {
            op: op.to_string(),
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn conflict(op: &str, message: impl Into<String>) -> Self {
        ClusterError::Conflict {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn api(op: &str, status: u16, message: impl Into<String>) -> Self {
        ClusterError::Api {
            op: op.to_string(),
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

/// Engine-level information (`GET /info`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Swarm", default)]
    pub swarm: SwarmNodeInfo,
}

/// Swarm membership of the engine answering the call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmNodeInfo {
    #[serde(rename = "NodeID", default)]
    pub node_id: String,

    /// inactive, pending, active, error or locked
    #[serde(rename = "LocalNodeState", default)]
    pub local_node_state: String,

    #[serde(rename = "ControlAvailable", default)]
    pub control_available: bool,

    #[serde(rename = "RemoteManagers", default)]
    pub remote_managers: Option<Vec<RemoteManager>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteManager {
    #[serde(rename = "NodeID", default)]
    pub node_id: String,

    #[serde(rename = "Addr", default)]
    pub addr: String,
}

/// Swarm-wide information (`GET /swarm`), only answered by managers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmInfo {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "JoinTokens", default)]
    pub join_tokens: JoinTokens,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinTokens {
    #[serde(rename = "Worker", default)]
    pub worker: String,

    #[serde(rename = "Manager", default)]
    pub manager: String,
}

/// Request to bootstrap a new swarm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    #[serde(rename = "AdvertiseAddr")]
    pub advertise_addr: String,
}

/// Request to join an existing swarm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    #[serde(rename = "AdvertiseAddr")]
    pub advertise_addr: String,

    #[serde(rename = "RemoteAddrs")]
    pub remote_addrs: Vec<String>,

    #[serde(rename = "JoinToken")]
    pub join_token: String,
}

/// Image details (`GET /images/{name}/json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInspect {
    #[serde(rename = "Id", default)]
    pub id: String,

    #[serde(rename = "Config", default)]
    pub config: ImageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,

    /// Keys look like `8080/tcp`
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl ImageConfig {
    pub fn entrypoint(&self) -> &[String] {
        self.entrypoint.as_deref().unwrap_or(&[])
    }

    /// Exposed ports, sorted for stable output
    pub fn exposed_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .exposed_ports
            .as_ref()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        ports.sort();
        ports
    }
}

/// Task list filter; all set criteria must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub service: Option<String>,
    pub labels: Vec<(String, String)>,
}

impl TaskFilter {
    pub fn service(id: impl Into<String>) -> Self {
        Self {
            service: Some(id.into()),
            labels: vec![],
        }
    }

    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            service: None,
            labels: vec![(key.into(), value.into())],
        }
    }

    /// Engine API `filters` query value
    pub fn to_query(&self) -> serde_json::Value {
        let mut filters = serde_json::Map::new();
        if let Some(service) = &self.service {
            filters.insert("service".to_string(), serde_json::json!([service]));
        }
        if !self.labels.is_empty() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            filters.insert("label".to_string(), serde_json::json!(labels));
        }
        serde_json::Value::Object(filters)
    }

    /// Check a task's labels and service against this filter
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(service) = &self.service {
            if &task.service_id != service {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| task.labels.get(k).map(|tv| tv == v).unwrap_or(false))
    }
}

/// Output sink for streamed container logs
pub type LogSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Client for one engine endpoint of the swarm control plane
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Address this client talks to
    fn address(&self) -> &str;

    async fn info(&self) -> ClusterResult<EngineInfo>;

    /// Bootstrap a new swarm with this engine as first manager; returns its node id
    async fn init_swarm(&self, request: &InitRequest) -> ClusterResult<String>;

    async fn inspect_swarm(&self) -> ClusterResult<SwarmInfo>;

    async fn join_swarm(&self, request: &JoinRequest) -> ClusterResult<()>;

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>>;

    async fn inspect_node(&self, id: &str) -> ClusterResult<Node>;

    /// Replace a node spec; `version` must match the current version index
    async fn update_node(&self, id: &str, version: u64, spec: &NodeSpec) -> ClusterResult<()>;

    async fn remove_node(&self, id: &str, force: bool) -> ClusterResult<()>;

    /// Create a service; returns its id
    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String>;

    /// Look a service up by id or name
    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<Service>;

    /// Replace a service spec; `version` must match the current version index
    async fn update_service(&self, id: &str, version: u64, spec: &ServiceSpec)
        -> ClusterResult<()>;

    async fn remove_service(&self, id: &str) -> ClusterResult<()>;

    async fn list_tasks(&self, filter: &TaskFilter) -> ClusterResult<Vec<Task>>;

    async fn inspect_image(&self, image: &str) -> ClusterResult<ImageInspect>;

    /// Commit a container's filesystem as `repo:tag`; returns the image id
    async fn commit_container(&self, container_id: &str, repo: &str, tag: &str)
        -> ClusterResult<String>;

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> ClusterResult<()>;

    async fn push_image(&self, repo: &str, tag: &str) -> ClusterResult<()>;

    /// Copy a container's past and live stdout/stderr into `sink` until it closes
    async fn container_logs(&self, container_id: &str, sink: LogSink<'_>) -> ClusterResult<()>;

    /// Block until the container exits; returns its exit code
    async fn wait_container(&self, container_id: &str) -> ClusterResult<i64>;
}

/// Opens clients for engine addresses
pub trait ClientConnector: Send + Sync {
    fn connect(&self, address: &str) -> ClusterResult<Arc<dyn ClusterClient>>;
}
