//! Operations UI layers may invoke on the engine.

use std::sync::Arc;

use ap_core::task_store::TaskStoreError;
use ap_core::types::{Priority, Task, TaskId};
use async_trait::async_trait;
use serde_json::json;

use crate::hub::Subscription;
use crate::protocol::ControlRequest;
use crate::snapshot::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task #{0} not found")]
    NotFound(TaskId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;

impl From<TaskStoreError> for ControlError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(id) => ControlError::NotFound(id),
            TaskStoreError::InvalidTransition { .. } => ControlError::Conflict(e.to_string()),
            other => ControlError::Internal(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn add_task(&self, project: &str, description: &str, priority: Priority) -> Result<Task>;
    async fn mark_done(&self, id: TaskId) -> Result<Task>;
    async fn archive(&self, id: TaskId) -> Result<Task>;
    /// Discard the plan and return the task to `pending`.
    async fn replan(&self, id: TaskId) -> Result<Task>;
    /// Stop the running executor; the task returns to `planned`.
    async fn stop_task(&self, id: TaskId) -> Result<()>;
    async fn toggle_autopilot(&self, id: TaskId) -> Result<Task>;
    async fn set_all_autopilot(&self, enabled: bool) -> Result<usize>;
    async fn start_project(&self, project: &str) -> Result<()>;
    async fn stop_project(&self, project: &str) -> Result<()>;

    fn snapshot(&self) -> Arc<Snapshot>;
    fn subscribe(&self) -> Subscription;
    fn request_refresh(&self);
    fn task_log(&self, id: TaskId) -> Result<Vec<String>>;
}

/// Execute a wire-level request and render its result as JSON.
pub async fn dispatch(surface: &dyn ControlSurface, req: ControlRequest) -> Result<serde_json::Value> {
    let value = match req {
        ControlRequest::AddTask {
            project,
            description,
            priority,
        } => {
            if description.trim().is_empty() {
                return Err(ControlError::Invalid("description must not be empty".into()));
            }
            to_json(surface.add_task(&project, &description, priority).await?)
        }
        ControlRequest::MarkDone { task_id } => to_json(surface.mark_done(task_id).await?),
        ControlRequest::Archive { task_id } => to_json(surface.archive(task_id).await?),
        ControlRequest::Replan { task_id } => to_json(surface.replan(task_id).await?),
        ControlRequest::StopTask { task_id } => {
            surface.stop_task(task_id).await?;
            json!({ "stopped": task_id })
        }
        ControlRequest::ToggleAutopilot { task_id } => {
            to_json(surface.toggle_autopilot(task_id).await?)
        }
        ControlRequest::SetAllAutopilot { enabled } => {
            json!({ "changed": surface.set_all_autopilot(enabled).await? })
        }
        ControlRequest::StartProject { project } => {
            surface.start_project(&project).await?;
            json!({ "started": project })
        }
        ControlRequest::StopProject { project } => {
            surface.stop_project(&project).await?;
            json!({ "stopped": project })
        }
        ControlRequest::Refresh => {
            surface.request_refresh();
            json!({ "refresh": "scheduled" })
        }
    };
    surface.request_refresh();
    Ok(value)
}

fn to_json(task: Task) -> serde_json::Value {
    serde_json::to_value(task).unwrap_or(serde_json::Value::Null)
}
