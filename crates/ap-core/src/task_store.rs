//! Durable single-file task queue.
//!
//! Every mutation takes the store lock, reads the whole file, applies the
//! change and rewrites the file atomically. Observers are notified after the
//! lock is released.

use crate::fsutil::write_atomic;
use crate::types::{Priority, Task, TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task #{0} not found")]
    NotFound(TaskId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task file is corrupt: {0}")]
    Corrupt(String),
    #[error("task #{id} cannot move from {from} to {to}: {reason}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    StateChanged { from: TaskState, to: TaskState },
    Updated,
}

/// A committed mutation, delivered to observers outside the store lock.
#[derive(Debug, Clone)]
pub struct TaskChange {
    pub kind: ChangeKind,
    pub task: Task,
}

impl TaskChange {
    /// Name of the outbound webhook event this change maps to, if any.
    pub fn webhook_event(&self) -> Option<&'static str> {
        match self.kind {
            ChangeKind::Created => Some("task_created"),
            ChangeKind::StateChanged {
                to: TaskState::Done,
                ..
            } => Some("task_done"),
            ChangeKind::StateChanged {
                to: TaskState::Blocked,
                ..
            } => Some("task_blocked"),
            _ => None,
        }
    }
}

pub trait StoreObserver: Send + Sync {
    fn on_change(&self, change: &TaskChange);
}

// ---------------------------------------------------------------------------
// On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default = "first_id")]
    next_id: TaskId,
    #[serde(default)]
    tasks: Vec<Task>,
}

impl Default for TaskFile {
    fn default() -> Self {
        Self {
            next_id: first_id(),
            tasks: Vec::new(),
        }
    }
}

fn first_id() -> TaskId {
    1
}

impl TaskFile {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TaskStoreError::NotFound(id))
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore").field("path", &self.path).finish()
    }
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    // -- reads --------------------------------------------------------------

    pub fn list_all(&self) -> Result<Vec<Task>> {
        let _guard = self.acquire();
        Ok(self.read_file()?.tasks)
    }

    /// Every task that is not archived.
    pub fn list_active(&self) -> Result<Vec<Task>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|t| t.effective_state() != TaskState::Archived)
            .collect())
    }

    pub fn list_pending(&self) -> Result<Vec<Task>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|t| t.effective_state() == TaskState::Pending)
            .collect())
    }

    /// Tasks a project loop may pick up, highest priority first, FIFO within
    /// a priority.
    pub fn list_autopilot_pending(&self, project: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .list_all()?
            .into_iter()
            .filter(|t| t.auto_pilot && t.project == project && t.effective_state().is_eligible())
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    pub fn next_autopilot(&self, project: &str) -> Result<Option<Task>> {
        Ok(self.list_autopilot_pending(project)?.into_iter().next())
    }

    /// Distinct projects that have autopilot-eligible tasks.
    pub fn projects_with_autopilot_pending(&self) -> Result<Vec<String>> {
        let mut projects: Vec<String> = self
            .list_all()?
            .into_iter()
            .filter(|t| t.auto_pilot && t.effective_state().is_eligible())
            .map(|t| t.project)
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    pub fn get(&self, id: TaskId) -> Result<Task> {
        self.list_all()?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(TaskStoreError::NotFound(id))
    }

    // -- mutations ----------------------------------------------------------

    pub fn add(&self, project: &str, description: &str, priority: Priority) -> Result<Task> {
        self.mutate(|file| {
            let id = file.next_id;
            file.next_id += 1;
            let task = Task::new(id, project, description, priority);
            file.tasks.push(task.clone());
            Ok((
                task.clone(),
                vec![TaskChange {
                    kind: ChangeKind::Created,
                    task,
                }],
            ))
        })
    }

    /// Move a task to `state`. Entering a plan-bearing state requires a plan file.
    pub fn update_state(&self, id: TaskId, state: TaskState) -> Result<Task> {
        self.mutate_task(id, |task| {
            if state.requires_plan() && task.plan_file.is_empty() {
                return Err(refuse(task, state, "no plan file"));
            }
            Ok(Some(transition(task, state)))
        })
    }

    pub fn set_plan_file(&self, id: TaskId, path: &Path) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.plan_file = path.to_string_lossy().into_owned();
            Ok(Some(ChangeKind::Updated))
        })
    }

    /// Record the plan path and move to `planned` in one write. Refused unless
    /// the task is still `pending`, so a user's archive or done made while the
    /// plan was generated is not overwritten.
    pub fn mark_planned(&self, id: TaskId, path: &Path) -> Result<Task> {
        self.mutate_task(id, |task| {
            if task.effective_state() != TaskState::Pending {
                return Err(refuse(task, TaskState::Planned, "task is no longer pending"));
            }
            task.plan_file = path.to_string_lossy().into_owned();
            task.fail_reason.clear();
            Ok(Some(transition(task, TaskState::Planned)))
        })
    }

    /// `planned` -> `running`. Refused when the task left `planned` (re-plan,
    /// archive, done) or lost its plan file since it was picked up.
    pub fn start_run(&self, id: TaskId) -> Result<Task> {
        self.mutate_task(id, |task| {
            if task.effective_state() != TaskState::Planned {
                return Err(refuse(task, TaskState::Running, "task is no longer planned"));
            }
            if task.plan_file.is_empty() {
                return Err(refuse(task, TaskState::Running, "no plan file"));
            }
            Ok(Some(transition(task, TaskState::Running)))
        })
    }

    /// Back to `pending` with the plan reference cleared. The caller removes
    /// the plan document.
    pub fn reset_plan(&self, id: TaskId) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.plan_file.clear();
            task.block_reason.clear();
            task.fail_reason.clear();
            Ok(Some(transition(task, TaskState::Pending)))
        })
    }

    pub fn set_block_reason(&self, id: TaskId, reason: &str) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.block_reason = reason.to_string();
            Ok(Some(ChangeKind::Updated))
        })
    }

    pub fn set_fail_reason(&self, id: TaskId, reason: &str) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.fail_reason = reason.to_string();
            Ok(Some(ChangeKind::Updated))
        })
    }

    /// Idempotent: a task that is already done is left untouched.
    pub fn mark_done(&self, id: TaskId) -> Result<Task> {
        self.mutate_task(id, |task| {
            if task.effective_state() == TaskState::Done {
                return Ok(None);
            }
            Ok(Some(transition(task, TaskState::Done)))
        })
    }

    pub fn archive(&self, id: TaskId) -> Result<Task> {
        self.mutate_task(id, |task| Ok(Some(transition(task, TaskState::Archived))))
    }

    /// Flip the autopilot flag and return the updated task.
    pub fn toggle_autopilot(&self, id: TaskId) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.auto_pilot = !task.auto_pilot;
            Ok(Some(ChangeKind::Updated))
        })
    }

    /// Set the autopilot flag on every task. Returns how many changed.
    pub fn set_all_autopilot(&self, enabled: bool) -> Result<usize> {
        self.mutate(|file| {
            let mut changes = Vec::new();
            for task in file.tasks.iter_mut().filter(|t| t.auto_pilot != enabled) {
                task.auto_pilot = enabled;
                changes.push(TaskChange {
                    kind: ChangeKind::Updated,
                    task: task.clone(),
                });
            }
            Ok((changes.len(), changes))
        })
    }

    pub fn update_description(&self, id: TaskId, description: &str) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.description = description.to_string();
            Ok(Some(ChangeKind::Updated))
        })
    }

    pub fn update_assignee(&self, id: TaskId, assignee: &str) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.assignee = assignee.to_string();
            Ok(Some(ChangeKind::Updated))
        })
    }

    pub fn set_optional(&self, id: TaskId, optional: bool) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.optional = optional;
            Ok(Some(ChangeKind::Updated))
        })
    }

    pub fn set_priority(&self, id: TaskId, priority: Priority) -> Result<Task> {
        self.mutate_task(id, |task| {
            task.priority = priority;
            Ok(Some(ChangeKind::Updated))
        })
    }

    /// Reset every `running` task to `planned` (or `pending` when it lost
    /// its plan reference), recording `note`. Returns the affected ids.
    pub fn recover_interrupted(&self, note: &str) -> Result<Vec<TaskId>> {
        self.mutate(|file| {
            let mut ids = Vec::new();
            let mut changes = Vec::new();
            for task in file
                .tasks
                .iter_mut()
                .filter(|t| t.effective_state() == TaskState::Running)
            {
                let target = if task.plan_file.is_empty() {
                    TaskState::Pending
                } else {
                    TaskState::Planned
                };
                let kind = transition(task, target);
                task.fail_reason = note.to_string();
                ids.push(task.id);
                changes.push(TaskChange {
                    kind,
                    task: task.clone(),
                });
            }
            Ok((ids, changes))
        })
    }

    // -- internals ----------------------------------------------------------

    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| {
            warn!("task store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn read_file(&self) -> Result<TaskFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TaskFile::default()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(TaskFile::default());
        }
        let mut file: TaskFile =
            serde_json::from_str(&data).map_err(|e| TaskStoreError::Corrupt(e.to_string()))?;
        let max_id = file.tasks.iter().map(|t| t.id).max().unwrap_or(0);
        if file.next_id <= max_id {
            warn!(next_id = file.next_id, max_id, "next_id behind existing tasks, bumping");
            file.next_id = max_id + 1;
        }
        Ok(file)
    }

    fn write_file(&self, file: &TaskFile) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(file).map_err(|e| TaskStoreError::Corrupt(e.to_string()))?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut TaskFile) -> Result<(R, Vec<TaskChange>)>,
    ) -> Result<R> {
        let (out, changes) = {
            let _guard = self.acquire();
            let mut file = self.read_file()?;
            let (out, changes) = f(&mut file)?;
            if !changes.is_empty() {
                self.write_file(&file)?;
            }
            (out, changes)
        };
        self.notify(&changes);
        Ok(out)
    }

    fn mutate_task(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut Task) -> Result<Option<ChangeKind>>,
    ) -> Result<Task> {
        self.mutate(|file| {
            let task = file.task_mut(id)?;
            let changes = match f(task)? {
                Some(kind) => vec![TaskChange {
                    kind,
                    task: task.clone(),
                }],
                None => Vec::new(),
            };
            Ok((task.clone(), changes))
        })
    }

    fn notify(&self, changes: &[TaskChange]) {
        if changes.is_empty() {
            return;
        }
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for change in changes {
            debug!(task_id = change.task.id, kind = ?change.kind, "task store change");
            for observer in &observers {
                observer.on_change(change);
            }
        }
    }
}

fn refuse(task: &Task, to: TaskState, reason: &'static str) -> TaskStoreError {
    TaskStoreError::InvalidTransition {
        id: task.id,
        from: task.effective_state(),
        to,
        reason,
    }
}

/// Apply a state change, keeping the legacy `done` flag in sync.
fn transition(task: &mut Task, to: TaskState) -> ChangeKind {
    let from = task.effective_state();
    task.state = Some(to);
    task.done = to == TaskState::Done;
    if to == TaskState::Running {
        task.block_reason.clear();
        task.fail_reason.clear();
    }
    if from == to {
        ChangeKind::Updated
    } else {
        ChangeKind::StateChanged { from, to }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks.json"));
        (dir, store)
    }

    #[test]
    fn ids_are_monotonic_and_survive_reload() {
        let (dir, store) = store();
        let a = store.add("demo", "one", Priority::Med).unwrap();
        let b = store.add("demo", "two", Priority::Med).unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        let reopened = TaskStore::new(dir.path().join("tasks.json"));
        let c = reopened.add("demo", "three", Priority::Low).unwrap();
        assert_eq!(c.id, 3);
    }

    #[test]
    fn planned_requires_plan_file() {
        let (_dir, store) = store();
        let task = store.add("demo", "x", Priority::Med).unwrap();
        let err = store.update_state(task.id, TaskState::Planned).unwrap_err();
        assert!(matches!(err, TaskStoreError::InvalidTransition { .. }));

        store.mark_planned(task.id, Path::new("/tmp/plan.md")).unwrap();
        let task = store.update_state(task.id, TaskState::Running).unwrap();
        assert_eq!(task.effective_state(), TaskState::Running);
    }

    #[test]
    fn corrupt_file_is_reported_and_left_alone() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.list_all(), Err(TaskStoreError::Corrupt(_))));
        assert!(store.add("demo", "x", Priority::Med).is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn missing_task_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.get(42), Err(TaskStoreError::NotFound(42))));
        assert!(matches!(store.archive(42), Err(TaskStoreError::NotFound(42))));
    }

    #[test]
    fn next_id_repairs_when_behind() {
        let (_dir, store) = store();
        std::fs::write(
            store.path(),
            r#"{"next_id":1,"tasks":[{"id":5,"project":"p","description":"d","created_at":"2024-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        let task = store.add("p", "new", Priority::Med).unwrap();
        assert_eq!(task.id, 6);
    }
}
