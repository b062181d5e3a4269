//! Service and Task resources
//!
//! A Service is the declarative spec for a set of replicated containers. The
//! control plane turns it into Tasks, one scheduled container each. dockyard
//! owns two kinds of services:
//! - persistent: one per app process, updated in place on every deploy
//! - ephemeral build: one replica, never restarted, deleted after the build
//!
//! Spec structs keep any field dockyard does not model in an `extra` map so a
//! read-modify-write cycle does not drop settings an operator applied.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::node::Version;

/// A service as reported by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Version", default)]
    pub version: Version,

    #[serde(rename = "Spec", default)]
    pub spec: ServiceSpec,

    #[serde(rename = "Endpoint", default)]
    pub endpoint: Endpoint,
}

/// The writable part of a Service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "TaskTemplate", default)]
    pub task_template: TaskSpec,

    #[serde(rename = "Mode", default)]
    pub mode: ServiceMode,

    #[serde(rename = "EndpointSpec", default, skip_serializing_if = "Option::is_none")]
    pub endpoint_spec: Option<EndpointSpec>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Template every task of the service is created from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "ContainerSpec", default)]
    pub container_spec: ContainerSpec,

    #[serde(rename = "RestartPolicy", default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Container configuration of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "Image", default)]
    pub image: String,

    #[serde(rename = "Command", default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(rename = "Args", default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Labels", default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// When the substrate restarts a task's container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(rename = "Condition", default)]
    pub condition: RestartCondition,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestartCondition {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "on-failure")]
    OnFailure,
    #[default]
    #[serde(rename = "any")]
    Any,
}

/// Replicated or global scheduling mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMode {
    #[serde(rename = "Replicated", default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<ReplicatedService>,

    #[serde(rename = "Global", default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedService {
    #[serde(rename = "Replicas", default)]
    pub replicas: u64,
}

impl ServiceMode {
    /// Replicated mode with a fixed replica count
    pub fn replicated(replicas: u64) -> Self {
        Self {
            replicated: Some(ReplicatedService { replicas }),
            global: None,
        }
    }

    /// Number of tasks the service asks for (global services count as one)
    pub fn replicas(&self) -> u64 {
        match (&self.replicated, &self.global) {
            (Some(r), _) => r.replicas,
            (None, Some(_)) => 1,
            (None, None) => 1,
        }
    }
}

/// Requested port publishing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(rename = "Ports", default)]
    pub ports: Vec<PortConfig>,
}

/// Actual endpoint state, including ports the substrate assigned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "Ports", default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(rename = "Protocol", default)]
    pub protocol: String,

    #[serde(rename = "TargetPort", default)]
    pub target_port: u32,

    /// 0 asks the substrate to pick one
    #[serde(rename = "PublishedPort", default)]
    pub published_port: u32,
}

impl Service {
    /// First published port, if the service exposes any
    pub fn first_published_port(&self) -> Option<u32> {
        self.endpoint.ports.first().map(|p| p.published_port)
    }

    /// Read a service label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.spec.labels.get(key).map(|s| s.as_str())
    }
}

/// A task: one scheduled container instance of a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "ServiceID", default)]
    pub service_id: String,

    #[serde(rename = "NodeID", default)]
    pub node_id: String,

    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "Status", default)]
    pub status: TaskStatus,

    #[serde(rename = "DesiredState", default)]
    pub desired_state: TaskState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(rename = "State", default)]
    pub state: TaskState,

    #[serde(rename = "Message", default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Scheduler or runtime error, e.g. "no suitable node"
    #[serde(rename = "Err", default, skip_serializing_if = "String::is_empty")]
    pub err: String,

    #[serde(rename = "ContainerStatus", default)]
    pub container_status: ContainerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    #[serde(rename = "ContainerID", default)]
    pub container_id: String,

    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

/// Task lifecycle state, ordered the way the substrate advances tasks
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    New,
    Allocated,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    /// The task will not make further progress
    pub fn is_terminal(&self) -> bool {
        *self >= TaskState::Complete
    }

    /// Whether a task in this state satisfies a wait for `target`
    ///
    /// A terminal target is satisfied by any terminal state (a one-shot
    /// container ends in `complete` or `failed`, not necessarily `shutdown`).
    pub fn satisfies(&self, target: TaskState) -> bool {
        if target.is_terminal() {
            self.is_terminal()
        } else {
            *self >= target
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Allocated => "allocated",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Ready => "ready",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Shutdown => "shutdown",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Remove => "remove",
            TaskState::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Task {
    pub fn container_id(&self) -> &str {
        &self.status.container_status.container_id
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_order() {
        assert!(TaskState::Pending < TaskState::Running);
        assert!(TaskState::Running < TaskState::Complete);
        assert!(TaskState::Shutdown < TaskState::Failed);
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Complete.is_terminal());
    }

    #[test]
    fn test_satisfies_terminal_target() {
        assert!(TaskState::Complete.satisfies(TaskState::Shutdown));
        assert!(TaskState::Failed.satisfies(TaskState::Shutdown));
        assert!(!TaskState::Running.satisfies(TaskState::Shutdown));
    }

    #[test]
    fn test_satisfies_running_target() {
        assert!(TaskState::Running.satisfies(TaskState::Running));
        assert!(TaskState::Complete.satisfies(TaskState::Running));
        assert!(!TaskState::Starting.satisfies(TaskState::Running));
    }

    #[test]
    fn test_unknown_spec_fields_survive_roundtrip() {
        let json = r#"{
            "Name": "myapp-web",
            "Labels": {"dockyard.app-name": "myapp"},
            "TaskTemplate": {
                "ContainerSpec": {"Image": "reg/app-myapp:v1", "Mounts": [{"Source": "/data"}]},
                "Resources": {"Limits": {"MemoryBytes": 104857600}}
            },
            "Mode": {"Replicated": {"Replicas": 4}},
            "UpdateConfig": {"Parallelism": 2}
        }"#;

        let spec: ServiceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.mode.replicas(), 4);
        assert!(spec.extra.contains_key("UpdateConfig"));
        assert!(spec.task_template.extra.contains_key("Resources"));
        assert!(spec.task_template.container_spec.extra.contains_key("Mounts"));

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["UpdateConfig"]["Parallelism"], 2);
        assert_eq!(value["TaskTemplate"]["ContainerSpec"]["Mounts"][0]["Source"], "/data");
    }

    #[test]
    fn test_deserialize_task() {
        let json = r#"{
            "ID": "0kzzo1i0y4jz",
            "ServiceID": "9mnpnzenvg8p",
            "NodeID": "60gvrl6tm78dmak4yl7srz94v",
            "Status": {
                "State": "complete",
                "ContainerStatus": {"ContainerID": "e5d62702a1b4", "ExitCode": 0}
            },
            "DesiredState": "shutdown"
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.state(), TaskState::Complete);
        assert_eq!(task.container_id(), "e5d62702a1b4");
        assert_eq!(task.desired_state, TaskState::Shutdown);
    }

    #[test]
    fn test_restart_condition_names() {
        let policy = RestartPolicy {
            condition: RestartCondition::None,
            ..Default::default()
        };
        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(value["Condition"], "none");
    }

    #[test]
    fn test_first_published_port() {
        let mut service = Service::default();
        assert_eq!(service.first_published_port(), None);

        service.endpoint.ports = vec![
            PortConfig {
                protocol: "tcp".to_string(),
                target_port: 8888,
                published_port: 30000,
            },
            PortConfig {
                protocol: "tcp".to_string(),
                target_port: 9000,
                published_port: 30001,
            },
        ];
        assert_eq!(service.first_published_port(), Some(30000));
    }
}
