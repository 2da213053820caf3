//! Registry of running task executors and project loops.
//!
//! Every entry owns a cancellation token and a done latch. Map mutations
//! happen under a single lock that is never held across an await; workers
//! remove their own entry before releasing the latch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use ap_agents::executor::{ExecOutcome, TaskExecutor};
use ap_core::plan::Plan;
use ap_core::types::{Task, TaskId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("task #{0} is already running")]
    AlreadyRunning(TaskId),
    #[error("project {0} already has a running loop")]
    ProjectAlreadyRunning(String),
    #[error("capacity exhausted: {max} project loops already running")]
    CapacityExhausted { max: usize },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

struct Runner {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecOutcome>>,
}

struct Loop {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    runners: HashMap<TaskId, Runner>,
    loops: HashMap<String, Loop>,
}

/// Awaitable result of [`EngineManager::start`].
pub struct RunHandle {
    id: TaskId,
    done: watch::Receiver<Option<ExecOutcome>>,
}

impl RunHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Resolve to the executor's terminal outcome.
    pub async fn wait(mut self) -> ExecOutcome {
        match self.done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(ExecOutcome::Cancelled),
            Err(_) => ExecOutcome::Cancelled,
        }
    }
}

pub struct EngineManager {
    executor: Arc<TaskExecutor>,
    root: CancellationToken,
    registry: Arc<Mutex<Registry>>,
}

impl EngineManager {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self::with_root(executor, CancellationToken::new())
    }

    /// Manager whose loops are children of `root`.
    pub fn with_root(executor: Arc<TaskExecutor>, root: CancellationToken) -> Self {
        Self {
            executor,
            root,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    // -----------------------------------------------------------------------
    // Task runners
    // -----------------------------------------------------------------------

    /// Run `plan` for `task` on a new worker whose token is a child of `parent`.
    pub fn start(&self, task: Task, plan: Plan, parent: &CancellationToken) -> Result<RunHandle> {
        let id = task.id;
        let cancel = parent.child_token();
        let (tx, rx) = watch::channel(None);
        {
            let mut reg = self.acquire();
            if reg.runners.contains_key(&id) {
                return Err(ManagerError::AlreadyRunning(id));
            }
            reg.runners.insert(
                id,
                Runner {
                    cancel: cancel.clone(),
                    done: rx.clone(),
                },
            );
        }
        debug!(task_id = id, "runner registered");

        let executor = self.executor.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let outcome = executor.run(&task, &plan, cancel).await;
            lock(&registry).runners.remove(&id);
            debug!(task_id = id, ?outcome, state = ?outcome.state(), "runner finished");
            let _ = tx.send(Some(outcome));
        });

        Ok(RunHandle { id, done: rx })
    }

    /// Cancel the runner for `id` and wait until it has exited. No-op when idle.
    pub async fn stop(&self, id: TaskId) {
        let entry = {
            let reg = self.acquire();
            reg.runners
                .get(&id)
                .map(|r| (r.cancel.clone(), r.done.clone()))
        };
        let Some((cancel, mut done)) = entry else {
            return;
        };
        info!(task_id = id, "stopping task");
        cancel.cancel();
        let _ = done.wait_for(Option::is_some).await;
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.acquire().runners.contains_key(&id)
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.acquire().runners.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every loop and every runner.
    pub async fn stop_all(&self) {
        let (loops, runners) = {
            let reg = self.acquire();
            let loops: Vec<_> = reg
                .loops
                .values()
                .map(|l| (l.cancel.clone(), l.done.clone()))
                .collect();
            let runners: Vec<_> = reg
                .runners
                .values()
                .map(|r| (r.cancel.clone(), r.done.clone()))
                .collect();
            (loops, runners)
        };
        info!(loops = loops.len(), runners = runners.len(), "stopping all work");

        for (cancel, _) in &loops {
            cancel.cancel();
        }
        for (cancel, _) in &runners {
            cancel.cancel();
        }
        for (_, mut done) in loops {
            let _ = done.wait_for(|d| *d).await;
        }
        for (_, mut done) in runners {
            let _ = done.wait_for(Option::is_some).await;
        }
    }

    // -----------------------------------------------------------------------
    // Project loops
    // -----------------------------------------------------------------------

    /// Start a loop for `project` unless one exists or `max_concurrent`
    /// loops are already running (`0` means unbounded).
    pub fn start_project<F, Fut>(&self, project: &str, max_concurrent: usize, runner: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let (tx, rx) = watch::channel(false);
        {
            let mut reg = self.acquire();
            if reg.loops.contains_key(project) {
                return Err(ManagerError::ProjectAlreadyRunning(project.to_string()));
            }
            if max_concurrent > 0 && reg.loops.len() >= max_concurrent {
                warn!(project, max_concurrent, "project loop refused, capacity exhausted");
                return Err(ManagerError::CapacityExhausted { max: max_concurrent });
            }
            reg.loops.insert(
                project.to_string(),
                Loop {
                    cancel: cancel.clone(),
                    done: rx,
                },
            );
        }
        info!(project, "project loop started");

        let work = runner(cancel);
        let registry = self.registry.clone();
        let name = project.to_string();
        tokio::spawn(async move {
            work.await;
            lock(&registry).loops.remove(&name);
            info!(project = %name, "project loop exited");
            let _ = tx.send(true);
        });
        Ok(())
    }

    /// Cancel the loop for `project` and wait for it to exit. No-op when idle.
    pub async fn stop_project(&self, project: &str) {
        let entry = {
            let reg = self.acquire();
            reg.loops
                .get(project)
                .map(|l| (l.cancel.clone(), l.done.clone()))
        };
        let Some((cancel, mut done)) = entry else {
            return;
        };
        info!(project, "stopping project loop");
        cancel.cancel();
        let _ = done.wait_for(|d| *d).await;
    }

    pub fn is_project_running(&self, project: &str) -> bool {
        self.acquire().loops.contains_key(project)
    }

    pub fn running_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.acquire().loops.keys().cloned().collect();
        names.sort();
        names
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| {
        warn!("engine registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}
