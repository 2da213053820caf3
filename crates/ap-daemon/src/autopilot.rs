//! The engine's control surface: task and loop operations plus snapshot access.

use std::sync::Arc;

use ap_agents::planner::GenerationTracker;
use ap_bridge::control::{ControlError, ControlSurface, Result};
use ap_bridge::driver::RefreshHandle;
use ap_bridge::hub::{Hub, Subscription};
use ap_bridge::snapshot::{RuntimeProbe, Snapshot, SnapshotAssembler};
use ap_core::types::{LogLevel, Priority, Task, TaskId, SYSTEM_PROJECT};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::guardrail::Guardrail;
use crate::manager::{EngineManager, ManagerError};
use crate::project_loop::LoopContext;

/// Runtime state for the snapshot assembler.
pub struct EngineProbe {
    manager: Arc<EngineManager>,
    tracker: GenerationTracker,
    guardrail: Arc<Guardrail>,
}

impl EngineProbe {
    pub fn new(manager: Arc<EngineManager>, tracker: GenerationTracker, guardrail: Arc<Guardrail>) -> Self {
        Self {
            manager,
            tracker,
            guardrail,
        }
    }
}

impl RuntimeProbe for EngineProbe {
    fn is_running(&self, id: TaskId) -> bool {
        self.manager.is_running(id)
    }
    fn is_generating(&self, id: TaskId) -> bool {
        self.tracker.is_generating(id)
    }
    fn running_projects(&self) -> Vec<String> {
        self.manager.running_projects()
    }
    fn pause_reason(&self) -> Option<String> {
        self.guardrail.cached_reason()
    }
}

impl From<ManagerError> for ControlError {
    fn from(e: ManagerError) -> Self {
        ControlError::Conflict(e.to_string())
    }
}

pub struct Autopilot {
    ctx: Arc<LoopContext>,
    assembler: Arc<SnapshotAssembler>,
    hub: Hub,
    refresh: RefreshHandle,
}

impl Autopilot {
    pub fn new(
        ctx: Arc<LoopContext>,
        assembler: Arc<SnapshotAssembler>,
        hub: Hub,
        refresh: RefreshHandle,
    ) -> Self {
        Self {
            ctx,
            assembler,
            hub,
            refresh,
        }
    }

    pub fn context(&self) -> &Arc<LoopContext> {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<EngineManager> {
        &self.ctx.manager
    }

    /// Start the loop for `project` under the configured concurrency cap.
    pub fn start_project_loop(&self, project: &str) -> std::result::Result<(), ManagerError> {
        let ctx = self.ctx.clone();
        let name = project.to_string();
        self.ctx.manager.start_project(
            project,
            self.ctx.config.autopilot.max_concurrent,
            move |cancel| ctx.run(name, cancel),
        )
    }

    /// Start the loop for the `_system` queue.
    pub fn start_system(&self) -> std::result::Result<(), ManagerError> {
        self.start_project_loop(SYSTEM_PROJECT)
    }

    /// Stop every loop and runner.
    pub async fn shutdown(&self) {
        self.ctx.manager.stop_all().await;
    }
}

#[async_trait]
impl ControlSurface for Autopilot {
    async fn add_task(&self, project: &str, description: &str, priority: Priority) -> Result<Task> {
        let project = match project.trim() {
            "" => SYSTEM_PROJECT,
            p => p,
        };
        let task = self.ctx.store.add(project, description.trim(), priority)?;
        self.ctx
            .log
            .log(task.id, &task.project, LogLevel::Info, format!("Task added: {}", task.description));
        Ok(task)
    }

    async fn mark_done(&self, id: TaskId) -> Result<Task> {
        self.ctx.manager.stop(id).await;
        let task = self.ctx.store.mark_done(id)?;
        self.ctx.generator.cancel(id);
        Ok(task)
    }

    async fn archive(&self, id: TaskId) -> Result<Task> {
        self.ctx.manager.stop(id).await;
        let task = self.ctx.store.archive(id)?;
        self.ctx.generator.cancel(id);
        Ok(task)
    }

    async fn replan(&self, id: TaskId) -> Result<Task> {
        if self.ctx.generator.is_generating(id) {
            return Err(ControlError::Conflict(format!("task #{id} is being planned")));
        }
        self.ctx.manager.stop(id).await;
        let task = self.ctx.store.reset_plan(id)?;
        if let Err(e) = self.ctx.plans.remove(id) {
            warn!(task_id = id, error = %e, "cannot remove old plan");
        }
        self.ctx.log.log(id, &task.project, LogLevel::Info, "Plan discarded; task will be re-planned");
        Ok(task)
    }

    async fn stop_task(&self, id: TaskId) -> Result<()> {
        self.ctx.store.get(id)?;
        self.ctx.manager.stop(id).await;
        Ok(())
    }

    async fn toggle_autopilot(&self, id: TaskId) -> Result<Task> {
        Ok(self.ctx.store.toggle_autopilot(id)?)
    }

    async fn set_all_autopilot(&self, enabled: bool) -> Result<usize> {
        Ok(self.ctx.store.set_all_autopilot(enabled)?)
    }

    async fn start_project(&self, project: &str) -> Result<()> {
        let project = project.trim();
        if project.is_empty() {
            return Err(ControlError::Invalid("project must not be empty".into()));
        }
        if project != SYSTEM_PROJECT && !self.ctx.config.projects_root().join(project).is_dir() {
            return Err(ControlError::Invalid(format!("no project directory for {project}")));
        }
        self.start_project_loop(project)?;
        info!(project, "autopilot started by request");
        Ok(())
    }

    async fn stop_project(&self, project: &str) -> Result<()> {
        self.ctx.manager.stop_project(project).await;
        Ok(())
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.assembler.latest()
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn request_refresh(&self) {
        self.refresh.request();
    }

    fn task_log(&self, id: TaskId) -> Result<Vec<String>> {
        self.ctx.store.get(id)?;
        self.ctx
            .log
            .read_task_log(id)
            .map_err(|e| ControlError::Internal(e.to_string()))
    }
}
