//! Provisioner capability set
//!
//! A provisioner turns apps into running units on some substrate and manages
//! the nodes that substrate runs on. Implementations are looked up by name in
//! a [`ProvisionerRegistry`] once at start-up.

pub mod swarm;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;

use crate::cluster::{ClientConnector, ClusterError, LogSink, Node, TaskState};
use crate::config::{ConfigError, SwarmConfig};
use crate::image::CustomData;
use crate::store::{ImageStore, MemberStore, StoreError};

pub use swarm::SwarmProvisioner;

/// Result type for provisioner operations
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that can occur while provisioning
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No cluster node available")]
    NoCluster,

    #[error("Unexpected result code for build container: {0}")]
    BuildFailed(i64),

    #[error("Timed out after {waited_secs}s waiting for tasks of service {service} to reach {state}")]
    TaskTimeout {
        service: String,
        state: TaskState,
        waited_secs: u64,
    },

    #[error("Task {task} of service {service} failed to schedule: {message}")]
    TaskSchedulingFailed {
        service: String,
        task: String,
        message: String,
    },

    #[error("No tasks found for service {0}")]
    NoTasks(String),

    #[error("No procfile or entrypoint found in image {0}")]
    NoProcfileOrEntrypoint(String),

    #[error("Too many ports in image {image} ({ports}). You should specify which one you want to.")]
    TooManyPorts { image: String, ports: String },

    #[error("Invalid build image label for build service {0}")]
    InvalidBuildImageLabel(String),

    #[error("Unknown provisioner: {0}")]
    UnknownProvisioner(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An application as seen by a provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub name: String,

    /// Platform the app builds on, e.g. `python`
    pub platform: String,

    /// Number of deploys the app went through so far
    pub deploys: u32,

    /// Rebuild from the platform image on the next deploy
    pub update_platform: bool,
}

impl App {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            deploys: 0,
            update_platform: false,
        }
    }

    pub fn with_deploys(mut self, deploys: u32) -> Self {
        self.deploys = deploys;
        self
    }

    pub fn with_update_platform(mut self, update_platform: bool) -> Self {
        self.update_platform = update_platform;
        self
    }
}

/// Lifecycle status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Starting,
    Started,
    Stopped,
    Error,
}

impl UnitStatus {
    /// Status of a unit backed by a task in `state`
    pub fn from_task_state(state: TaskState) -> Self {
        match state {
            TaskState::Running => UnitStatus::Started,
            TaskState::Failed | TaskState::Rejected => UnitStatus::Error,
            s if s.is_terminal() => UnitStatus::Stopped,
            _ => UnitStatus::Starting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Starting => "starting",
            UnitStatus::Started => "started",
            UnitStatus::Stopped => "stopped",
            UnitStatus::Error => "error",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One running instance of an app process
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Container id
    pub id: String,
    pub app_name: String,
    pub process_name: String,
    pub platform: String,
    pub ip: String,
    pub status: UnitStatus,

    /// `http://ip:port`; none when the node address is unknown
    pub address: Option<Url>,
}

/// Options for adding a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddNodeOptions {
    /// Reachable engine address, e.g. `http://10.0.0.5:2375`
    pub address: String,

    /// Caller metadata stored as node labels
    pub metadata: HashMap<String, String>,
}

/// Options for removing a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveNodeOptions {
    pub address: String,

    /// Drain the node before removing it
    pub rebalance: bool,
}

/// What a provisioner can do for the layer above it
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Every unit of an app
    async fn units(&self, app: &App) -> ProvisionResult<Vec<Unit>>;

    /// Units of the app's web process
    async fn routable_units(&self, app: &App) -> ProvisionResult<Vec<Unit>>;

    /// Build an app from a source archive and deploy it; returns the new image
    async fn archive_deploy(
        &self,
        app: &App,
        archive_url: &str,
        events: LogSink<'_>,
    ) -> ProvisionResult<String>;

    /// Deploy a pre-built image; returns the new app image
    async fn image_deploy(&self, app: &App, image: &str, events: LogSink<'_>)
        -> ProvisionResult<String>;

    /// Attach custom data reported from inside a build container
    async fn register_unit(
        &self,
        unit_id: &str,
        custom_data: Option<CustomData>,
    ) -> ProvisionResult<()>;

    /// Nodes, optionally restricted to the given addresses
    async fn list_nodes(&self, address_filter: &[String]) -> ProvisionResult<Vec<Node>>;

    async fn get_node(&self, address: &str) -> ProvisionResult<Node>;

    async fn add_node(&self, opts: &AddNodeOptions) -> ProvisionResult<()>;

    async fn remove_node(&self, opts: &RemoveNodeOptions) -> ProvisionResult<()>;
}

/// Collaborators a provisioner is constructed with
#[derive(Clone)]
pub struct ProvisionerContext {
    pub config: Arc<SwarmConfig>,
    pub connector: Arc<dyn ClientConnector>,
    pub images: Arc<dyn ImageStore>,
    pub members: Arc<dyn MemberStore>,
}

/// Constructor of a named provisioner
pub type ProvisionerFactory = fn(ProvisionerContext) -> ProvisionResult<Arc<dyn Provisioner>>;

/// Name to constructor table
pub struct ProvisionerRegistry {
    factories: HashMap<String, ProvisionerFactory>,
}

impl ProvisionerRegistry {
    /// Registry with the built-in provisioners
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(swarm::PROVISIONER_NAME, SwarmProvisioner::factory);
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a constructor, replacing any previous one with that name
    pub fn register(&mut self, name: &str, factory: ProvisionerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the provisioner registered as `name`
    pub fn build(
        &self,
        name: &str,
        context: ProvisionerContext,
    ) -> ProvisionResult<Arc<dyn Provisioner>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownProvisioner(name.to_string()))?;
        factory(context)
    }
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
