//! Immutable view of the whole system, rebuilt on demand and shared with
//! every subscriber behind an `Arc`.

use std::sync::{Arc, RwLock};

use ap_core::log_ring::LogRing;
use ap_core::task_store::TaskStore;
use ap_core::types::{LogEntry, Task, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::git::{ProjectScanner, ProjectStatus};
use crate::metrics::{MetricsScanner, SessionContext, UsageMetrics};

/// Runtime facts the assembler cannot read from the stores.
pub trait RuntimeProbe: Send + Sync {
    fn is_running(&self, id: TaskId) -> bool;
    fn is_generating(&self, id: TaskId) -> bool;
    fn running_projects(&self) -> Vec<String>;
    fn pause_reason(&self) -> Option<String>;
}

/// State shown to users: the stored state, or `generating` while a plan is
/// being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Pending,
    Generating,
    Planned,
    Running,
    Done,
    Failed,
    Blocked,
    Archived,
}

impl From<TaskState> for DisplayState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending => DisplayState::Pending,
            TaskState::Planned => DisplayState::Planned,
            TaskState::Running => DisplayState::Running,
            TaskState::Done => DisplayState::Done,
            TaskState::Failed => DisplayState::Failed,
            TaskState::Blocked => DisplayState::Blocked,
            TaskState::Archived => DisplayState::Archived,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub effective_state: DisplayState,
    pub is_running: bool,
}

/// Static labels shown alongside the live data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    pub version: String,
    pub agent_binary: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub labels: Labels,
    pub metrics: UsageMetrics,
    pub session: SessionContext,
    pub tasks: Vec<TaskView>,
    pub projects: Vec<ProjectStatus>,
    pub logs: Vec<LogEntry>,
    pub running_projects: Vec<String>,
    pub pause_reason: Option<String>,
}

impl Snapshot {
    pub fn task(&self, id: TaskId) -> Option<&TaskView> {
        self.tasks.iter().find(|t| t.task.id == id)
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

pub struct SnapshotAssembler {
    store: Arc<TaskStore>,
    log: Arc<LogRing>,
    probe: Arc<dyn RuntimeProbe>,
    projects: ProjectScanner,
    metrics: MetricsScanner,
    labels: Labels,
    log_limit: usize,
    latest: RwLock<Arc<Snapshot>>,
}

impl SnapshotAssembler {
    pub fn new(
        store: Arc<TaskStore>,
        log: Arc<LogRing>,
        probe: Arc<dyn RuntimeProbe>,
        projects: ProjectScanner,
        metrics: MetricsScanner,
        labels: Labels,
    ) -> Self {
        Self {
            store,
            log,
            probe,
            projects,
            metrics,
            labels,
            log_limit: 200,
            latest: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    /// The last published snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild from all sources and publish. Performs blocking I/O.
    pub fn refresh(&self) -> Arc<Snapshot> {
        let previous = self.latest();
        let tasks = match self.store.list_active() {
            Ok(tasks) => tasks.into_iter().map(|t| self.view(t)).collect(),
            Err(e) => {
                warn!(error = %e, "task store unreadable, keeping previous task list");
                previous.tasks.clone()
            }
        };
        let (metrics, session) = self.metrics.scan();
        let mut running_projects = self.probe.running_projects();
        running_projects.sort();

        let snapshot = Arc::new(Snapshot {
            generated_at: Some(Utc::now()),
            labels: self.labels.clone(),
            metrics,
            session,
            tasks,
            projects: self.projects.scan(),
            logs: self.log.recent(self.log_limit),
            running_projects,
            pause_reason: self.probe.pause_reason(),
        });

        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        snapshot
    }

    fn view(&self, task: Task) -> TaskView {
        let is_running = self.probe.is_running(task.id);
        let state = task.effective_state();
        let effective_state = if state == TaskState::Pending && self.probe.is_generating(task.id) {
            DisplayState::Generating
        } else {
            state.into()
        };
        TaskView {
            task,
            effective_state,
            is_running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::types::{LogLevel, Priority};
    use std::collections::HashSet;
    use std::path::Path;

    #[derive(Default)]
    struct StaticProbe {
        running: HashSet<TaskId>,
        generating: HashSet<TaskId>,
    }

    impl RuntimeProbe for StaticProbe {
        fn is_running(&self, id: TaskId) -> bool {
            self.running.contains(&id)
        }
        fn is_generating(&self, id: TaskId) -> bool {
            self.generating.contains(&id)
        }
        fn running_projects(&self) -> Vec<String> {
            vec!["zeta".into(), "demo".into()]
        }
        fn pause_reason(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn refresh_enriches_tasks_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path().join("tasks.json")));
        let log = Arc::new(LogRing::in_memory(100));

        let a = store.add("demo", "generate me", Priority::Med).unwrap();
        let b = store.add("demo", "run me", Priority::Med).unwrap();
        let c = store.add("demo", "hidden", Priority::Med).unwrap();
        store.mark_planned(b.id, Path::new("/p.md")).unwrap();
        store.update_state(b.id, TaskState::Running).unwrap();
        store.archive(c.id).unwrap();
        log.log(b.id, "demo", LogLevel::Info, "working");

        let probe = StaticProbe {
            running: [b.id].into_iter().collect(),
            generating: [a.id].into_iter().collect(),
        };
        let assembler = SnapshotAssembler::new(
            store,
            log,
            Arc::new(probe),
            ProjectScanner::new(dir.path().join("projects")),
            MetricsScanner::new(dir.path().join("claude")),
            Labels::default(),
        );

        assert!(assembler.latest().generated_at.is_none());
        let snap = assembler.refresh();

        assert_eq!(snap.tasks.len(), 2);
        assert_eq!(snap.task(a.id).unwrap().effective_state, DisplayState::Generating);
        let running = snap.task(b.id).unwrap();
        assert!(running.is_running);
        assert_eq!(running.effective_state, DisplayState::Running);
        assert!(snap.task(c.id).is_none());
        assert_eq!(snap.logs.len(), 1);
        assert_eq!(snap.running_projects, vec!["demo", "zeta"]);
        assert!(Arc::ptr_eq(&snap, &assembler.latest()));
    }

    #[test]
    fn task_view_serializes_flat() {
        let view = TaskView {
            task: Task::new(1, "demo", "x", Priority::Low),
            effective_state: DisplayState::Generating,
            is_running: false,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["effective_state"], "generating");
    }
}
