//! Plan generation: one non-streaming agent call whose final message is a
//! plan document.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{events, EventPayload};
use ap_core::config::Config;
use ap_core::log_ring::LogRing;
use ap_core::plan::{Plan, PlanError};
use ap_core::plan_store::{PlanStore, PlanStoreError};
use ap_core::types::{LogLevel, Task, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::prompts::{plan_prompt, PlanSkeleton};
use crate::spawn_config::{McpConfigFile, SpawnConfig};
use crate::spawner::{project_dir, AgentSpawner, SpawnError, SpawnPurpose, SpawnRequest};

#[derive(Debug, thiserror::Error)]
pub enum PlanGenError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("agent returned an empty plan")]
    EmptyResult,
    #[error("agent reported an error: {0}")]
    AgentFailed(String),
    #[error("plan could not be parsed: {0}")]
    Parse(#[from] PlanError),
    #[error("agent spawn failed: {0}")]
    Spawn(SpawnError),
    #[error("plan store: {0}")]
    Store(#[from] PlanStoreError),
    #[error("plan generation cancelled")]
    Cancelled,
}

impl From<SpawnError> for PlanGenError {
    fn from(e: SpawnError) -> Self {
        match e {
            SpawnError::AgentNotFound(bin) => PlanGenError::AgentNotFound(bin),
            SpawnError::Cancelled => PlanGenError::Cancelled,
            other => PlanGenError::Spawn(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanGenError>;

#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    pub plan: Plan,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Generation tracker
// ---------------------------------------------------------------------------

/// Tasks whose plan is being generated right now, each with a token that
/// cancels only that generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationTracker {
    inner: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` until the guard drops. The guard's token is a child of `parent`.
    pub fn begin(&self, id: TaskId, parent: &CancellationToken) -> GenerationGuard {
        let cancel = parent.child_token();
        self.acquire().insert(id, cancel.clone());
        GenerationGuard {
            tracker: self.clone(),
            id,
            cancel,
        }
    }

    pub fn is_generating(&self, id: TaskId) -> bool {
        self.acquire().contains_key(&id)
    }

    /// Cancel the generation for `id`. Returns `false` when none is running.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.acquire().get(&id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn acquire(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("generation tracker lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

pub struct GenerationGuard {
    tracker: GenerationTracker,
    id: TaskId,
    cancel: CancellationToken,
}

impl GenerationGuard {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.tracker.acquire().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct PlanGenerator {
    spawner: Arc<dyn AgentSpawner>,
    plans: PlanStore,
    log: Arc<LogRing>,
    bus: EventBus,
    config: Arc<Config>,
    tracker: GenerationTracker,
    timeout: Duration,
}

impl PlanGenerator {
    pub fn new(
        spawner: Arc<dyn AgentSpawner>,
        plans: PlanStore,
        log: Arc<LogRing>,
        bus: EventBus,
        config: Arc<Config>,
    ) -> Self {
        let timeout = Duration::from_secs(config.agent.timeout_mins.max(1) * 60);
        Self {
            spawner,
            plans,
            log,
            bus,
            config,
            tracker: GenerationTracker::new(),
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tracker(&self) -> GenerationTracker {
        self.tracker.clone()
    }

    pub fn is_generating(&self, id: TaskId) -> bool {
        self.tracker.is_generating(id)
    }

    /// Abort an in-flight generation for `id`; it returns [`PlanGenError::Cancelled`].
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = self.tracker.cancel(id);
        if cancelled {
            info!(task_id = id, "plan generation cancelled");
        }
        cancelled
    }

    /// Ask the agent for a plan, store it and return the parsed form.
    pub async fn generate(&self, task: &Task, cancel: CancellationToken) -> Result<GeneratedPlan> {
        let generating = self.tracker.begin(task.id, &cancel);
        let workdir = project_dir(&self.config.projects_root(), &task.project);
        let skeleton = PlanSkeleton::from_project(&self.config.project(&task.project));

        info!(task_id = task.id, project = %task.project, "generating plan");
        self.log
            .log(task.id, &task.project, LogLevel::Info, "Generating plan");
        self.bus.emit(EventPayload::for_task(
            events::PLAN_STARTED,
            task,
            "generating plan",
        ));

        let mcp = McpConfigFile::write(&self.config.agent.mcp_servers, &std::env::temp_dir())
            .map_err(SpawnError::Io)?;
        let config = SpawnConfig::for_plan(&self.config.agent)
            .with_mcp_config(mcp.as_ref().and_then(|m| m.path()).map(PathBuf::from));

        let req = SpawnRequest {
            task_id: task.id,
            project: task.project.clone(),
            prompt: plan_prompt(&workdir, &task.description, &skeleton),
            workdir: Some(workdir),
            config,
            purpose: SpawnPurpose::Plan,
            agent: Some("planner".to_string()),
            timeout: Some(self.timeout),
        };
        let outcome = self.spawner.spawn(req, generating.token()).await;
        if let Some(mcp) = mcp {
            mcp.cleanup();
        }
        let result = outcome?;

        if result.is_error {
            return Err(PlanGenError::AgentFailed(result.output.trim().to_string()));
        }
        let markdown = extract_plan_markdown(&result.output);
        if markdown.is_empty() {
            return Err(PlanGenError::EmptyResult);
        }

        let plan = Plan::parse(markdown)?;
        let path = self.plans.save(task.id, markdown)?;

        self.log.log(
            task.id,
            &task.project,
            LogLevel::Success,
            format!("Plan ready: {} ({} steps)", plan.title, plan.steps.len()),
        );
        self.bus.emit(EventPayload::for_task(
            events::PLAN_READY,
            task,
            format!("{} steps", plan.steps.len()),
        ));
        Ok(GeneratedPlan { plan, path })
    }
}

/// Strip code fences and any chatter before the plan's H1 title.
pub fn extract_plan_markdown(output: &str) -> &str {
    let mut text = output.trim();
    if let Some(start) = text.find("```markdown").or_else(|| text.find("```md")) {
        let after = &text[start..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        text = match body.rfind("```") {
            Some(end) => body[..end].trim(),
            None => body.trim(),
        };
    }
    if text.starts_with("# ") {
        return text;
    }
    match text.find("\n# ") {
        Some(idx) => text[idx + 1..].trim(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_plan() {
        let out = "Here is the plan:\n```markdown\n# Title\n\n### Step 1: Go\nDo it\n```\nThanks";
        assert_eq!(extract_plan_markdown(out), "# Title\n\n### Step 1: Go\nDo it");
    }

    #[test]
    fn drops_chatter_before_title() {
        let out = "I read the files.\n# Title\n### Step 1: Go";
        assert_eq!(extract_plan_markdown(out), "# Title\n### Step 1: Go");
        assert_eq!(extract_plan_markdown("   "), "");
    }

    #[test]
    fn tracker_guard_clears_on_drop() {
        let tracker = GenerationTracker::new();
        {
            let _g = tracker.begin(4, &CancellationToken::new());
            assert!(tracker.is_generating(4));
        }
        assert!(!tracker.is_generating(4));
        assert!(!tracker.cancel(4));
    }

    #[test]
    fn cancel_reaches_only_that_generation() {
        let tracker = GenerationTracker::new();
        let parent = CancellationToken::new();
        let first = tracker.begin(1, &parent);
        let second = tracker.begin(2, &parent);

        assert!(tracker.cancel(1));
        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
