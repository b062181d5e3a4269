//! Unit projection
//!
//! Units are not stored anywhere: every query lists the app's tasks and
//! joins them with their node (for the IP) and service (for the process
//! name and published port).

use std::collections::HashMap;

use reqwest::Url;
use tracing::{debug, warn};

use super::SwarmProvisioner;
use crate::cluster::{
    Node, Service, Task, TaskFilter, LABEL_APP_NAME, LABEL_APP_PROCESS, LABEL_BUILD_IMAGE,
    LABEL_IS_BUILD,
};
use crate::image::{CustomData, WEB_PROCESS};
use crate::provision::{App, ProvisionError, ProvisionResult, Unit, UnitStatus};
use crate::store::StoreError;

// ============================================================================
// SBIO: Pure projection (no I/O)
// ============================================================================

/// Unit backed by `task`
pub fn project_unit(app: &App, task: &Task, node: Option<&Node>, service: &Service) -> Unit {
    let ip = node.map(|n| n.host()).unwrap_or_default();
    let port = service.first_published_port().unwrap_or(0);
    let address = if ip.is_empty() {
        None
    } else {
        Url::parse(&format!("http://{}:{}", ip, port)).ok()
    };
    Unit {
        id: task.container_id().to_string(),
        app_name: app.name.clone(),
        process_name: service
            .label(LABEL_APP_PROCESS)
            .unwrap_or_default()
            .to_string(),
        platform: app.platform.clone(),
        ip,
        status: UnitStatus::from_task_state(task.state()),
        address,
    }
}

/// Units of the web process, in their original order
pub fn filter_routable(units: Vec<Unit>, web_process: &str) -> Vec<Unit> {
    units
        .into_iter()
        .filter(|u| u.process_name == web_process)
        .collect()
}

/// Tasks that back app units: not builds, and still meant to run
fn is_unit_task(task: &Task) -> bool {
    let is_build = task
        .labels
        .get(LABEL_IS_BUILD)
        .map(|v| v == "true")
        .unwrap_or(false);
    !is_build && !task.desired_state.is_terminal()
}

/// Build tasks whose container is `container_id`, in listing order
pub fn find_build_tasks<'a>(tasks: &'a [Task], container_id: &str) -> Vec<&'a Task> {
    if container_id.is_empty() {
        return vec![];
    }
    tasks
        .iter()
        .filter(|t| t.container_id() == container_id)
        .collect()
}

// ============================================================================
// I/O boundary
// ============================================================================

impl SwarmProvisioner {
    pub(crate) async fn app_units(&self, app: &App) -> ProvisionResult<Vec<Unit>> {
        let client = self.choose_client().await?;
        let tasks = client
            .list_tasks(&TaskFilter::label(LABEL_APP_NAME, app.name.clone()))
            .await?;

        let mut nodes: HashMap<String, Node> = HashMap::new();
        let mut services: HashMap<String, Service> = HashMap::new();
        let mut units = Vec::with_capacity(tasks.len());
        for task in tasks.iter().filter(|t| is_unit_task(t)) {
            if !task.node_id.is_empty() && !nodes.contains_key(&task.node_id) {
                let node = client.inspect_node(&task.node_id).await?;
                nodes.insert(task.node_id.clone(), node);
            }
            if !services.contains_key(&task.service_id) {
                let service = client.inspect_service(&task.service_id).await?;
                services.insert(task.service_id.clone(), service);
            }
            if let Some(service) = services.get(&task.service_id) {
                units.push(project_unit(app, task, nodes.get(&task.node_id), service));
            }
        }
        Ok(units)
    }

    pub(crate) async fn app_routable_units(&self, app: &App) -> ProvisionResult<Vec<Unit>> {
        let web_process = self.web_process_name(app).await?;
        let units = self.app_units(app).await?;
        Ok(filter_routable(units, &web_process))
    }

    /// Web process of the app's current image
    async fn web_process_name(&self, app: &App) -> ProvisionResult<String> {
        let Some(image) = self.images.current_image(&app.name).await? else {
            return Ok(WEB_PROCESS.to_string());
        };
        match self.images.image_metadata(&image).await {
            Ok(metadata) => Ok(metadata.web_process_name()),
            Err(StoreError::ImageNotFound(_)) => Ok(WEB_PROCESS.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach custom data to the image the build running `unit_id` produces
    pub(crate) async fn register_build_unit(
        &self,
        unit_id: &str,
        custom_data: Option<CustomData>,
    ) -> ProvisionResult<()> {
        let Some(custom_data) = custom_data else {
            return Ok(());
        };
        let client = self.choose_client().await?;
        let tasks = client
            .list_tasks(&TaskFilter::label(LABEL_IS_BUILD, "true"))
            .await?;

        let candidates = find_build_tasks(&tasks, unit_id);
        let Some(task) = candidates.first() else {
            debug!("No build task runs container {}", unit_id);
            return Ok(());
        };
        if candidates.len() > 1 {
            warn!(
                "{} build tasks run container {}, using service {}",
                candidates.len(),
                unit_id,
                task.service_id
            );
        }

        let service = client.inspect_service(&task.service_id).await?;
        let image = service.label(LABEL_BUILD_IMAGE).unwrap_or_default();
        if image.is_empty() {
            return Err(ProvisionError::InvalidBuildImageLabel(
                service.spec.name.clone(),
            ));
        }
        self.images.save_custom_data(image, custom_data).await?;
        debug!("Registered custom data of {} for {}", unit_id, image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        ContainerStatus, Endpoint, NodeRole, PortConfig, TaskState, TaskStatus, LABEL_NODE_ADDR,
    };

    fn service(process: &str, ports: &[u32]) -> Service {
        let mut service = Service {
            id: format!("srv-{}", process),
            ..Default::default()
        };
        service
            .spec
            .labels
            .insert(LABEL_APP_PROCESS.to_string(), process.to_string());
        service.endpoint = Endpoint {
            ports: ports
                .iter()
                .map(|p| PortConfig {
                    protocol: "tcp".to_string(),
                    target_port: 8888,
                    published_port: *p,
                })
                .collect(),
        };
        service
    }

    fn task(container: &str, state: TaskState) -> Task {
        Task {
            id: format!("task-{}", container),
            node_id: "n1".to_string(),
            status: TaskStatus {
                state,
                container_status: ContainerStatus {
                    container_id: container.to_string(),
                    exit_code: 0,
                },
                ..Default::default()
            },
            desired_state: TaskState::Running,
            ..Default::default()
        }
    }

    fn unit(id: &str, process: &str) -> Unit {
        Unit {
            id: id.to_string(),
            app_name: "myapp".to_string(),
            process_name: process.to_string(),
            platform: "python".to_string(),
            ip: "10.0.0.1".to_string(),
            status: UnitStatus::Started,
            address: None,
        }
    }

    #[test]
    fn test_project_unit() {
        let app = App::new("myapp", "python");
        let node = Node::new("n1")
            .with_role(NodeRole::Manager)
            .with_label(LABEL_NODE_ADDR, "http://10.0.0.1:2375");
        let unit = project_unit(
            &app,
            &task("c1", TaskState::Running),
            Some(&node),
            &service("web", &[30001, 30002]),
        );

        assert_eq!(unit.id, "c1");
        assert_eq!(unit.process_name, "web");
        assert_eq!(unit.ip, "10.0.0.1");
        assert_eq!(unit.status, UnitStatus::Started);
        assert_eq!(unit.address.unwrap().as_str(), "http://10.0.0.1:30001/");
    }

    #[test]
    fn test_project_unit_without_node() {
        let app = App::new("myapp", "python");
        let unit = project_unit(
            &app,
            &task("", TaskState::Pending),
            None,
            &service("worker", &[]),
        );
        assert_eq!(unit.ip, "");
        assert!(unit.address.is_none());
        assert_eq!(unit.status, UnitStatus::Starting);
    }

    #[test]
    fn test_filter_routable_keeps_order() {
        let units = vec![
            unit("c1", "web"),
            unit("c2", "worker"),
            unit("c3", "web"),
            unit("c4", "worker"),
        ];
        let routable = filter_routable(units, "web");
        let ids: Vec<&str> = routable.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[test]
    fn test_unit_tasks_exclude_builds_and_history() {
        let mut build = task("c1", TaskState::Complete);
        build
            .labels
            .insert(LABEL_IS_BUILD.to_string(), "true".to_string());
        assert!(!is_unit_task(&build));

        let mut old = task("c2", TaskState::Shutdown);
        old.desired_state = TaskState::Shutdown;
        assert!(!is_unit_task(&old));

        assert!(is_unit_task(&task("c3", TaskState::Running)));
    }

    #[test]
    fn test_find_build_tasks() {
        let tasks = vec![
            task("c1", TaskState::Complete),
            task("", TaskState::Pending),
            task("c2", TaskState::Complete),
        ];
        assert_eq!(find_build_tasks(&tasks, "c2").len(), 1);
        assert!(find_build_tasks(&tasks, "").is_empty());
        assert!(find_build_tasks(&tasks, "c9").is_empty());
    }
}
