use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task identifiers are allocated monotonically by the task store.
pub type TaskId = u64;

/// Project name used for tasks that are not tied to a project directory.
pub const SYSTEM_PROJECT: &str = "_system";

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Med,
    Low,
}

impl Priority {
    /// Sort key: lower ranks are scheduled first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Med => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Med => "med",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "h" => Ok(Priority::High),
            "med" | "medium" | "m" => Ok(Priority::Med),
            "low" | "l" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Planned,
    Running,
    Done,
    Failed,
    Blocked,
    Archived,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Planned => "planned",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Blocked => "blocked",
            TaskState::Archived => "archived",
        }
    }

    /// States that require a readable plan on disk.
    pub fn requires_plan(self) -> bool {
        matches!(
            self,
            TaskState::Planned | TaskState::Running | TaskState::Blocked
        )
    }

    /// States a project loop may pick up.
    pub fn is_eligible(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Planned)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

fn default_assignee() -> String {
    "agent".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Older files only carry `done`; see [`Task::effective_state`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default)]
    pub plan_file: String,
    #[serde(default)]
    pub block_reason: String,
    #[serde(default)]
    pub fail_reason: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default = "default_true")]
    pub auto_pilot: bool,
    #[serde(default = "default_assignee")]
    pub assignee: String,
    #[serde(default)]
    pub optional: bool,
}

impl Task {
    pub fn new(
        id: TaskId,
        project: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            project: project.into(),
            description: description.into(),
            priority,
            created_at: Utc::now(),
            state: Some(TaskState::Pending),
            plan_file: String::new(),
            block_reason: String::new(),
            fail_reason: String::new(),
            done: false,
            auto_pilot: true,
            assignee: default_assignee(),
            optional: false,
        }
    }

    pub fn effective_state(&self) -> TaskState {
        match self.state {
            Some(state) => state,
            None if self.done => TaskState::Done,
            None => TaskState::Pending,
        }
    }

    pub fn is_system(&self) -> bool {
        self.project == SYSTEM_PROJECT
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

impl LogLevel {
    /// Five-character tag used in log files.
    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Success => "OK   ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "OK" => Some(LogLevel::Success),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    /// 0 for system-wide entries.
    pub task_id: TaskId,
    pub project: String,
    pub message: String,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl LogEntry {
    pub fn new(
        task_id: TaskId,
        project: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            time: Utc::now(),
            task_id,
            project: project.into(),
            message: message.into(),
            level,
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
