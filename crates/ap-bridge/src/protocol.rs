use ap_core::types::{Priority, Task, TaskId};
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Messages delivered to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum BridgeMessage {
    Snapshot(Box<Snapshot>),
    Event(EventPayload),
    Error { code: String, message: String },
}

impl BridgeMessage {
    pub fn event_type(&self) -> Option<&str> {
        match self {
            BridgeMessage::Event(e) => Some(&e.event_type),
            _ => None,
        }
    }
}

/// Event type names carried in [`EventPayload::event_type`].
pub mod events {
    pub const TASK_CHANGED: &str = "task_changed";
    pub const PLAN_STARTED: &str = "plan_started";
    pub const PLAN_READY: &str = "plan_ready";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_FINISHED: &str = "step_finished";
    pub const STEP_RETRY: &str = "step_retry";
    pub const LOOP_STARTED: &str = "loop_started";
    pub const LOOP_STOPPED: &str = "loop_stopped";
    pub const GUARDRAIL_PAUSED: &str = "guardrail_paused";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub task_id: Option<TaskId>,
    pub project: Option<String>,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EventPayload {
    pub fn for_task(event_type: &str, task: &Task, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            task_id: Some(task.id),
            project: Some(task.project.clone()),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn for_project(event_type: &str, project: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            task_id: None,
            project: Some(project.to_string()),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Control requests accepted from UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    AddTask {
        project: String,
        description: String,
        #[serde(default)]
        priority: Priority,
    },
    MarkDone { task_id: TaskId },
    Archive { task_id: TaskId },
    Replan { task_id: TaskId },
    StopTask { task_id: TaskId },
    ToggleAutopilot { task_id: TaskId },
    SetAllAutopilot { enabled: bool },
    StartProject { project: String },
    StopProject { project: String },
    Refresh,
}
