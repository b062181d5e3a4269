//! Bounded polling for task states

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::cluster::{ClusterClient, Task, TaskFilter, TaskState};
use crate::config::SwarmConfig;
use crate::provision::{ProvisionError, ProvisionResult};

/// Waits for the tasks of a service to reach a lifecycle state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskWaiter {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl TaskWaiter {
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self::new(config.task_poll_interval(), config.task_max_wait())
    }

    /// Poll until at least one task of `service_id` satisfies `target`
    ///
    /// Returns the satisfying tasks in the order the control plane listed
    /// them. A task the scheduler cannot place fails the wait at once.
    pub async fn wait(
        &self,
        client: &dyn ClusterClient,
        service_id: &str,
        target: TaskState,
    ) -> ProvisionResult<Vec<Task>> {
        let started = Instant::now();
        let filter = TaskFilter::service(service_id);
        loop {
            let tasks = client.list_tasks(&filter).await?;
            if let Some(done) = check_tasks(service_id, &tasks, target)? {
                return Ok(done);
            }
            if started.elapsed() >= self.max_wait {
                return Err(ProvisionError::TaskTimeout {
                    service: service_id.to_string(),
                    state: target,
                    waited_secs: self.max_wait.as_secs(),
                });
            }
            debug!(
                "Waiting for {} task(s) of service {} to reach {}",
                tasks.len(),
                service_id,
                target
            );
            sleep(self.poll_interval).await;
        }
    }
}

// ============================================================================
// SBIO: Pure task classification (no I/O)
// ============================================================================

/// Classify one poll: `Some(tasks)` when the wait is over, `None` to keep
/// polling, an error when a task can never get there
pub fn check_tasks(
    service_id: &str,
    tasks: &[Task],
    target: TaskState,
) -> ProvisionResult<Option<Vec<Task>>> {
    if let Some(stuck) = tasks.iter().find(|t| is_scheduling_failure(t)) {
        let message = if stuck.status.err.is_empty() {
            stuck.status.message.clone()
        } else {
            stuck.status.err.clone()
        };
        return Err(ProvisionError::TaskSchedulingFailed {
            service: service_id.to_string(),
            task: stuck.id.clone(),
            message,
        });
    }

    let done: Vec<Task> = tasks
        .iter()
        .filter(|t| t.state().satisfies(target))
        .cloned()
        .collect();
    if done.is_empty() {
        Ok(None)
    } else {
        Ok(Some(done))
    }
}

/// Rejected, or not yet placed with a scheduler error attached
fn is_scheduling_failure(task: &Task) -> bool {
    match task.state() {
        TaskState::Rejected => true,
        s => s <= TaskState::Pending && !task.status.err.is_empty(),
    }
}
