//! # Cluster control plane
//!
//! Types and clients for the Docker swarm dockyard deploys onto.
//!
//! ## Core Resources
//!
//! - **Node**: a machine that is a member of the swarm
//! - **Service**: declarative spec for a set of replicated containers
//! - **Task**: one scheduled container instance backing a service
//!
//! ## Clients
//!
//! ```text
//!                ┌──────────────────────┐
//!                │   ClusterClient      │  (trait)
//!                └──────────┬───────────┘
//!            ┌──────────────┴──────────────┐
//!   ┌────────▼────────┐           ┌────────▼────────┐
//!   │  DockerClient   │           │  MemoryCluster  │
//!   │ Engine API/HTTP │           │   in-process    │
//!   └─────────────────┘           └─────────────────┘
//! ```
//!
//! Every mutation of a node or service carries the version index that was
//! read; the control plane rejects stale versions with a conflict.

pub mod addr;
pub mod client;
pub mod docker;
pub mod memory;
pub mod node;
pub mod service;

pub use addr::url_to_host;
pub use client::{
    ClientConnector, ClusterClient, ClusterError, ClusterResult, EngineInfo, ImageConfig,
    ImageInspect, InitRequest, JoinRequest, LogSink, SwarmInfo, TaskFilter,
};
pub use docker::{DockerClient, DockerConnector, TlsMaterial};
pub use memory::{MemoryCluster, RunResult};
pub use node::{Availability, ManagerStatus, Node, NodeRole, NodeSpec, NodeStatus, Version};
pub use service::{
    ContainerSpec, ContainerStatus, Endpoint, EndpointSpec, PortConfig, RestartCondition,
    RestartPolicy, Service, ServiceMode, ServiceSpec, Task, TaskSpec, TaskState, TaskStatus,
};

/// Default swarm control-plane port
pub const SWARM_PORT: u16 = 2377;

/// Prefix of every label dockyard sets
pub const LABEL_PREFIX: &str = "dockyard.";

/// Node label holding the node's reachable engine address
pub const LABEL_NODE_ADDR: &str = "dockyard.node-addr";

/// App a service or task belongs to
pub const LABEL_APP_NAME: &str = "dockyard.app-name";

/// Process of the app a persistent service runs
pub const LABEL_APP_PROCESS: &str = "dockyard.app-process";

/// Platform of the app
pub const LABEL_APP_PLATFORM: &str = "dockyard.app-platform";

/// Image a persistent service was last deployed with
pub const LABEL_APP_IMAGE: &str = "dockyard.app-image";

/// Marks ephemeral build services and their tasks
pub const LABEL_IS_BUILD: &str = "dockyard.is-build";

/// Image an ephemeral build service is producing
pub const LABEL_BUILD_IMAGE: &str = "dockyard.build-image";
