//! In-process control plane
//!
//! `MemoryCluster` keeps nodes, services, tasks, containers and images in one
//! shared state and hands out a [`ClusterClient`] per engine address. It
//! enforces version indexes the way a swarm manager does, schedules one task
//! per replica onto active nodes and runs one-shot containers (restart policy
//! `none`) to completion with a scripted [`RunResult`].
//!
//! Every mutating call is appended to a journal, see [`MemoryCluster::calls`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::addr::url_to_host;
use super::client::{
    ClientConnector, ClusterClient, ClusterError, ClusterResult, EngineInfo, ImageConfig,
    ImageInspect, InitRequest, JoinRequest, JoinTokens, LogSink, RemoteManager, SwarmInfo,
    SwarmNodeInfo, TaskFilter,
};
use super::node::{Availability, ManagerStatus, Node, NodeRole, NodeSpec, NodeStatus, Version};
use super::service::{
    ContainerStatus, Endpoint, RestartCondition, Service, ServiceSpec, Task,
    TaskState, TaskStatus,
};
use crate::image::with_default_tag;

const NOT_MANAGER: &str = "This node is not a swarm manager.";

/// First port handed out for published ports without an explicit number
const PUBLISHED_PORT_BASE: u32 = 30000;

/// Scripted outcome of a one-shot container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub exit_code: i64,
    pub output: String,
}

impl RunResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Container {
    image: String,
    output: String,
    exit_code: i64,
}

#[derive(Debug, Default)]
struct ClusterState {
    swarm: Option<SwarmInfo>,
    /// engine address -> node id of the engine once it is a swarm member
    engines: HashMap<String, String>,
    nodes: Vec<Node>,
    services: Vec<Service>,
    tasks: Vec<Task>,
    containers: HashMap<String, Container>,
    images: HashMap<String, ImageInspect>,
    run_results: HashMap<String, RunResult>,
    pushed: Vec<String>,
    failing: HashSet<String>,
    /// Services whose next inspect is overtaken by another writer
    racing: HashSet<String>,
    calls: Vec<String>,
    next_id: u64,
    next_port: u32,
}

impl ClusterState {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn check_failure(&self, op: &str) -> ClusterResult<()> {
        if self.failing.contains(op) {
            return Err(ClusterError::api(op, 500, "injected failure"));
        }
        Ok(())
    }

    /// Node/service/task calls must reach a manager of the swarm
    fn require_manager(&self, op: &str, address: &str) -> ClusterResult<()> {
        self.check_failure(op)?;
        let is_manager = self
            .engines
            .get(address)
            .and_then(|id| self.nodes.iter().find(|n| &n.id == id))
            .map(|n| n.is_manager())
            .unwrap_or(false);
        if self.swarm.is_none() || !is_manager {
            return Err(ClusterError::api(op, 503, NOT_MANAGER));
        }
        Ok(())
    }

    fn register_node(&mut self, address: &str, role: NodeRole, swarm_port: &str) -> String {
        let id = self.new_id("node");
        let host = url_to_host(address);
        let manager_status = match role {
            NodeRole::Manager => Some(ManagerStatus {
                leader: self.nodes.is_empty(),
                reachability: "reachable".to_string(),
                addr: format!("{}:{}", host, swarm_port),
            }),
            NodeRole::Worker => None,
        };
        self.nodes.push(Node {
            id: id.clone(),
            version: Version { index: 1 },
            created_at: Some(Utc::now()),
            spec: NodeSpec {
                name: None,
                labels: HashMap::new(),
                role,
                availability: Availability::Active,
            },
            status: NodeStatus {
                state: "ready".to_string(),
                message: String::new(),
                addr: host,
            },
            manager_status,
        });
        self.engines.insert(address.to_string(), id.clone());
        id
    }

    fn find_service(&self, id_or_name: &str) -> Option<usize> {
        self.services
            .iter()
            .position(|s| s.id == id_or_name || s.spec.name == id_or_name)
    }

    fn image(&self, name: &str) -> Option<&ImageInspect> {
        self.images
            .get(name)
            .or_else(|| self.images.get(&with_default_tag(name)))
    }

    fn assign_ports(&mut self, spec: &ServiceSpec, previous: &Endpoint) -> Endpoint {
        let mut ports = Vec::new();
        for port in spec
            .endpoint_spec
            .as_ref()
            .map(|e| e.ports.as_slice())
            .unwrap_or(&[])
        {
            let mut port = port.clone();
            if port.published_port == 0 {
                port.published_port = match previous
                    .ports
                    .iter()
                    .find(|p| p.target_port == port.target_port)
                {
                    Some(p) => p.published_port,
                    None => {
                        self.next_port += 1;
                        PUBLISHED_PORT_BASE + self.next_port
                    }
                };
            }
            ports.push(port);
        }
        Endpoint { ports }
    }

    /// Replace the tasks of a service with freshly scheduled ones
    fn schedule(&mut self, service_index: usize) {
        let service = self.services[service_index].clone();
        self.tasks.retain(|t| t.service_id != service.id);

        let one_shot = service
            .spec
            .task_template
            .restart_policy
            .as_ref()
            .map(|p| p.condition == RestartCondition::None)
            .unwrap_or(false);
        let active: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_schedulable())
            .map(|n| n.id.clone())
            .collect();

        let container_spec = &service.spec.task_template.container_spec;
        let mut labels = service.spec.labels.clone();
        labels.extend(container_spec.labels.clone());

        for slot in 0..service.spec.mode.replicas() as usize {
            let task_id = self.new_id("task");
            let mut task = Task {
                id: task_id,
                service_id: service.id.clone(),
                labels: labels.clone(),
                desired_state: TaskState::Running,
                ..Default::default()
            };

            if active.is_empty() {
                task.status = TaskStatus {
                    state: TaskState::Pending,
                    message: "pending task scheduling".to_string(),
                    err: "no suitable node (0 nodes available for new tasks)".to_string(),
                    container_status: ContainerStatus::default(),
                };
                self.tasks.push(task);
                continue;
            }

            let container_id = self.new_id("container");
            task.node_id = active[slot % active.len()].clone();

            let image = container_spec.image.clone();
            let (state, exit_code, output) = if one_shot {
                let result = self.run_results.get(&image).cloned().unwrap_or_default();
                let state = if result.exit_code == 0 {
                    TaskState::Complete
                } else {
                    TaskState::Failed
                };
                (state, result.exit_code, result.output)
            } else {
                (TaskState::Running, 0, String::new())
            };

            if state == TaskState::Failed {
                task.status.err = format!("task: non-zero exit ({})", exit_code);
            }
            task.status.state = state;
            task.status.message = state.to_string();
            task.status.container_status = ContainerStatus {
                container_id: container_id.clone(),
                exit_code,
            };
            if one_shot {
                task.desired_state = TaskState::Shutdown;
            }

            self.containers.insert(
                container_id,
                Container {
                    image,
                    output,
                    exit_code,
                },
            );
            self.tasks.push(task);
        }
    }
}

/// In-process swarm control plane
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client answering as the engine at `address`
    pub fn client(&self, address: &str) -> Arc<dyn ClusterClient> {
        Arc::new(MemoryEngine {
            address: address.to_string(),
            state: self.state.clone(),
        })
    }

    /// Make an image available to every engine
    pub async fn add_image(&self, name: &str, config: ImageConfig) {
        let mut state = self.state.lock().await;
        let id = state.new_id("sha256");
        state
            .images
            .insert(with_default_tag(name), ImageInspect { id, config });
    }

    /// Script what one-shot containers running `image` print and exit with
    pub async fn set_run_result(&self, image: &str, result: RunResult) {
        self.state
            .lock()
            .await
            .run_results
            .insert(image.to_string(), result);
    }

    /// Make every call of operation `op` (e.g. `"push image"`) fail
    pub async fn fail_on(&self, op: &str) {
        self.state.lock().await.failing.insert(op.to_string());
    }

    /// Let another writer update `service` right after its next inspect, so
    /// the version the caller read is stale by the time it updates
    pub async fn race_next_inspect(&self, service: &str) {
        self.state.lock().await.racing.insert(service.to_string());
    }

    /// Journal of mutating calls, oldest first
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.state.lock().await.nodes.clone()
    }

    pub async fn services(&self) -> Vec<Service> {
        self.state.lock().await.services.clone()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks.clone()
    }

    /// Images pushed so far as `repo:tag`
    pub async fn pushed_images(&self) -> Vec<String> {
        self.state.lock().await.pushed.clone()
    }
}

impl ClientConnector for MemoryCluster {
    fn connect(&self, address: &str) -> ClusterResult<Arc<dyn ClusterClient>> {
        if address.trim().is_empty() {
            return Err(ClusterError::InvalidAddress(address.to_string()));
        }
        Ok(self.client(address))
    }
}

/// One engine endpoint of a [`MemoryCluster`]
struct MemoryEngine {
    address: String,
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl ClusterClient for MemoryEngine {
    fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self) -> ClusterResult<EngineInfo> {
        let state = self.state.lock().await;
        state.check_failure("info")?;
        let node_id = state.engines.get(&self.address).cloned();
        let node = node_id
            .as_ref()
            .and_then(|id| state.nodes.iter().find(|n| &n.id == id));

        let swarm = match node {
            Some(node) => SwarmNodeInfo {
                node_id: node.id.clone(),
                local_node_state: "active".to_string(),
                control_available: node.is_manager(),
                remote_managers: Some(
                    state
                        .nodes
                        .iter()
                        .filter_map(|n| {
                            n.manager_status.as_ref().map(|m| RemoteManager {
                                node_id: n.id.clone(),
                                addr: m.addr.clone(),
                            })
                        })
                        .collect(),
                ),
            },
            None => SwarmNodeInfo {
                local_node_state: "inactive".to_string(),
                ..Default::default()
            },
        };
        Ok(EngineInfo {
            name: url_to_host(&self.address),
            swarm,
        })
    }

    async fn init_swarm(&self, request: &InitRequest) -> ClusterResult<String> {
        let op = "init swarm";
        let mut state = self.state.lock().await;
        state.check_failure(op)?;
        if state.engines.contains_key(&self.address) {
            return Err(ClusterError::api(
                op,
                503,
                "This node is already part of a swarm.",
            ));
        }
        if state.swarm.is_none() {
            let id = state.new_id("swarm");
            let worker = state.new_id("SWMTKN-worker");
            let manager = state.new_id("SWMTKN-manager");
            state.swarm = Some(SwarmInfo {
                id,
                join_tokens: JoinTokens { worker, manager },
            });
        }
        let port = request
            .listen_addr
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let id = state.register_node(&self.address, NodeRole::Manager, &port);
        state.calls.push(format!("init_swarm:{}", self.address));
        debug!("Memory swarm initialised by {} as {}", self.address, id);
        Ok(id)
    }

    async fn inspect_swarm(&self) -> ClusterResult<SwarmInfo> {
        let op = "inspect swarm";
        let state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        state
            .swarm
            .clone()
            .ok_or_else(|| ClusterError::api(op, 503, NOT_MANAGER))
    }

    async fn join_swarm(&self, request: &JoinRequest) -> ClusterResult<()> {
        let op = "join swarm";
        let mut state = self.state.lock().await;
        state.check_failure(op)?;
        if state.engines.contains_key(&self.address) {
            return Err(ClusterError::api(
                op,
                503,
                "This node is already part of a swarm.",
            ));
        }
        let Some(swarm) = state.swarm.clone() else {
            return Err(ClusterError::api(op, 500, "no swarm to join"));
        };
        let role = if request.join_token == swarm.join_tokens.manager {
            NodeRole::Manager
        } else if request.join_token == swarm.join_tokens.worker {
            NodeRole::Worker
        } else {
            return Err(ClusterError::api(op, 400, "invalid join token"));
        };
        let port = request
            .listen_addr
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string();
        state.register_node(&self.address, role, &port);
        state.calls.push(format!("join_swarm:{}", self.address));
        Ok(())
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        let state = self.state.lock().await;
        state.require_manager("list nodes", &self.address)?;
        Ok(state.nodes.clone())
    }

    async fn inspect_node(&self, id: &str) -> ClusterResult<Node> {
        let op = "inspect node";
        let state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        state
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(op, "node", id))
    }

    async fn update_node(&self, id: &str, version: u64, spec: &NodeSpec) -> ClusterResult<()> {
        let op = "update node";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| ClusterError::not_found(op, "node", id))?;
        if node.version.index != version {
            return Err(ClusterError::conflict(
                op,
                format!(
                    "update out of sequence: have {}, got {}",
                    node.version.index, version
                ),
            ));
        }
        node.spec = spec.clone();
        node.version.index += 1;
        let availability = spec.availability;
        state
            .calls
            .push(format!("update_node:{}:{}", id, availability));

        if availability == Availability::Drain {
            for task in state.tasks.iter_mut().filter(|t| t.node_id == id) {
                task.desired_state = TaskState::Shutdown;
                task.status.state = TaskState::Shutdown;
            }
        }
        Ok(())
    }

    async fn remove_node(&self, id: &str, force: bool) -> ClusterResult<()> {
        let op = "remove node";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        let Some(index) = state.nodes.iter().position(|n| n.id == id) else {
            return Err(ClusterError::not_found(op, "node", id));
        };
        if !force && state.nodes[index].status.state == "ready" {
            return Err(ClusterError::api(
                op,
                400,
                format!("node {} is not down and can't be removed", id),
            ));
        }
        state.nodes.remove(index);
        state.engines.retain(|_, node_id| node_id.as_str() != id);
        state.tasks.retain(|t| t.node_id != id);
        state.calls.push(format!("remove_node:{}", id));
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String> {
        let op = "create service";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        if state.find_service(&spec.name).is_some() {
            return Err(ClusterError::conflict(
                op,
                format!("service {} already exists", spec.name),
            ));
        }
        let id = state.new_id("service");
        let endpoint = state.assign_ports(spec, &Endpoint::default());
        state.services.push(Service {
            id: id.clone(),
            version: Version { index: 1 },
            spec: spec.clone(),
            endpoint,
        });
        let index = state.services.len() - 1;
        state.schedule(index);
        state.calls.push(format!("create_service:{}", spec.name));
        Ok(id)
    }

    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<Service> {
        let op = "inspect service";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        let index = state
            .find_service(id_or_name)
            .ok_or_else(|| ClusterError::not_found(op, "service", id_or_name))?;
        let service = state.services[index].clone();
        if state.racing.remove(&service.spec.name) {
            state.services[index].version.index += 1;
        }
        Ok(service)
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> ClusterResult<()> {
        let op = "update service";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        let index = state
            .find_service(id)
            .ok_or_else(|| ClusterError::not_found(op, "service", id))?;
        let current = state.services[index].version.index;
        if current != version {
            return Err(ClusterError::conflict(
                op,
                format!("update out of sequence: have {}, got {}", current, version),
            ));
        }
        let previous = state.services[index].endpoint.clone();
        let endpoint = state.assign_ports(spec, &previous);
        let service = &mut state.services[index];
        service.spec = spec.clone();
        service.endpoint = endpoint;
        service.version.index += 1;
        let name = service.spec.name.clone();
        state.schedule(index);
        state.calls.push(format!("update_service:{}", name));
        Ok(())
    }

    async fn remove_service(&self, id: &str) -> ClusterResult<()> {
        let op = "remove service";
        let mut state = self.state.lock().await;
        state.require_manager(op, &self.address)?;
        let index = state
            .find_service(id)
            .ok_or_else(|| ClusterError::not_found(op, "service", id))?;
        let service = state.services.remove(index);
        state.tasks.retain(|t| t.service_id != service.id);
        state
            .calls
            .push(format!("remove_service:{}", service.spec.name));
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> ClusterResult<Vec<Task>> {
        let state = self.state.lock().await;
        state.require_manager("list tasks", &self.address)?;

        // The filter accepts a service name as well as an id
        let mut filter = filter.clone();
        if let Some(service) = &filter.service {
            if let Some(index) = state.find_service(service) {
                filter.service = Some(state.services[index].id.clone());
            }
        }
        Ok(state
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn inspect_image(&self, image: &str) -> ClusterResult<ImageInspect> {
        let op = "inspect image";
        let state = self.state.lock().await;
        state.check_failure(op)?;
        state
            .image(image)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(op, "image", image))
    }

    async fn commit_container(
        &self,
        container_id: &str,
        repo: &str,
        tag: &str,
    ) -> ClusterResult<String> {
        let op = "commit container";
        let mut state = self.state.lock().await;
        state.check_failure(op)?;
        let container = state
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(op, "container", container_id))?;
        let config = state
            .image(&container.image)
            .map(|i| i.config.clone())
            .unwrap_or_default();
        let id = state.new_id("sha256");
        state.images.insert(
            format!("{}:{}", repo, tag),
            ImageInspect {
                id: id.clone(),
                config,
            },
        );
        state
            .calls
            .push(format!("commit_container:{}:{}:{}", container_id, repo, tag));
        Ok(id)
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> ClusterResult<()> {
        let op = "tag image";
        let mut state = self.state.lock().await;
        state.check_failure(op)?;
        let source = state
            .image(image)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(op, "image", image))?;
        state.images.insert(format!("{}:{}", repo, tag), source);
        state
            .calls
            .push(format!("tag_image:{}:{}:{}", image, repo, tag));
        Ok(())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> ClusterResult<()> {
        let op = "push image";
        let mut state = self.state.lock().await;
        state.check_failure(op)?;
        let name = format!("{}:{}", repo, tag);
        if state.image(&name).is_none() {
            return Err(ClusterError::not_found(op, "image", &name));
        }
        state.calls.push(format!("push_image:{}", name));
        state.pushed.push(name);
        Ok(())
    }

    async fn container_logs(&self, container_id: &str, sink: LogSink<'_>) -> ClusterResult<()> {
        let op = "container logs";
        let output = {
            let state = self.state.lock().await;
            state.check_failure(op)?;
            state
                .containers
                .get(container_id)
                .map(|c| c.output.clone())
                .ok_or_else(|| ClusterError::not_found(op, "container", container_id))?
        };
        sink.write_all(output.as_bytes()).await?;
        sink.flush().await?;
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> ClusterResult<i64> {
        let op = "wait container";
        let state = self.state.lock().await;
        state.check_failure(op)?;
        state
            .containers
            .get(container_id)
            .map(|c| c.exit_code)
            .ok_or_else(|| ClusterError::not_found(op, "container", container_id))
    }
}
