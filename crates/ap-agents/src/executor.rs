//! Runs a task's plan step by step.
//!
//! Each step is attempted by a streaming agent call (reflex). A failed
//! attempt gets a diagnosis call whose summary feeds the next attempt
//! (deliberative). When attempts run out the task is blocked (meta).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{events, EventPayload};
use ap_core::config::Config;
use ap_core::log_ring::LogRing;
use ap_core::plan::{Plan, PlanStep};
use ap_core::task_store::{TaskStore, TaskStoreError};
use ap_core::types::{LogLevel, Task, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::prompts::{recovery_prompt, step_prompt, summarize, tail, StepContext, NO_WRITES_NOTE};
use crate::spawn_config::{McpConfigFile, SpawnConfig};
use crate::spawner::{project_dir, AgentSpawner, SpawnError, SpawnPurpose, SpawnRequest, SpawnResult};

/// Tools that count as modifying the project.
pub const WRITE_TOOLS: &[&str] = &["Write", "Edit", "Bash", "NotebookEdit"];

const SUMMARY_CHARS: usize = 300;
const RECOVERY_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Done,
    Blocked(String),
    Failed(String),
    Cancelled,
    /// The task left `planned` before the run began; nothing was recorded.
    Skipped(String),
}

impl ExecOutcome {
    /// State the executor leaves the task in, if it touched it.
    pub fn state(&self) -> Option<TaskState> {
        match self {
            ExecOutcome::Done => Some(TaskState::Done),
            ExecOutcome::Blocked(_) => Some(TaskState::Blocked),
            ExecOutcome::Failed(_) => Some(TaskState::Failed),
            ExecOutcome::Cancelled => Some(TaskState::Planned),
            ExecOutcome::Skipped(_) => None,
        }
    }
}

/// Why a single attempt did not count as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    Exit(i32),
    Denied(Vec<String>),
    AgentError(String),
    NoWrites,
    TimedOut(Duration),
    Io(String),
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Exit(code) => write!(f, "agent exited with code {code}"),
            StepFailure::Denied(tools) => write!(f, "permission denied for {}", tools.join(", ")),
            StepFailure::AgentError(msg) => write!(f, "agent error: {msg}"),
            StepFailure::NoWrites => write!(f, "no file changes were made"),
            StepFailure::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            StepFailure::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

/// Classify one attempt.
pub fn classify(step: &PlanStep, result: &SpawnResult) -> Result<(), StepFailure> {
    if !result.denials.is_empty() {
        return Err(StepFailure::Denied(result.denials.clone()));
    }
    if result.exit_code != 0 {
        return Err(StepFailure::Exit(result.exit_code));
    }
    if result.is_error {
        return Err(StepFailure::AgentError(tail(result.output.trim(), 200).to_string()));
    }
    if !step.read_only && !result.used_any(WRITE_TOOLS) {
        return Err(StepFailure::NoWrites);
    }
    Ok(())
}

enum Attempt {
    Passed(SpawnResult),
    Failed(StepFailure, Option<SpawnResult>),
}

/// Early exit from the step loop.
enum Halt {
    Cancelled,
    Infrastructure(String),
}

pub struct TaskExecutor {
    spawner: Arc<dyn AgentSpawner>,
    store: Arc<TaskStore>,
    log: Arc<LogRing>,
    bus: EventBus,
    config: Arc<Config>,
    step_timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(
        spawner: Arc<dyn AgentSpawner>,
        store: Arc<TaskStore>,
        log: Arc<LogRing>,
        bus: EventBus,
        config: Arc<Config>,
    ) -> Self {
        let step_timeout = Some(Duration::from_secs(config.agent.timeout_mins.max(1) * 60));
        Self {
            spawner,
            store,
            log,
            bus,
            config,
            step_timeout,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn max_attempts(&self) -> u32 {
        self.config.autopilot.max_step_attempts.max(1)
    }

    fn log(&self, task: &Task, level: LogLevel, message: impl Into<String>) {
        self.log.log(task.id, &task.project, level, message);
    }

    /// Run every step of `plan` and record the terminal state on the task.
    pub async fn run(&self, task: &Task, plan: &Plan, cancel: CancellationToken) -> ExecOutcome {
        match self.store.start_run(task.id) {
            Ok(_) => {}
            Err(e @ TaskStoreError::InvalidTransition { .. }) => {
                info!(task_id = task.id, reason = %e, "task changed before start, skipping");
                return ExecOutcome::Skipped(e.to_string());
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "cannot mark task running");
                return ExecOutcome::Failed(e.to_string());
            }
        }
        info!(task_id = task.id, project = %task.project, steps = plan.steps.len(), "executing plan");

        let workdir = project_dir(&self.config.projects_root(), &task.project);
        let mcp = match McpConfigFile::write(&self.config.agent.mcp_servers, &std::env::temp_dir()) {
            Ok(mcp) => mcp,
            Err(e) => return self.finish_failed(task, format!("cannot write MCP config: {e}")),
        };
        let spawn_config = SpawnConfig::for_steps(&self.config.agent)
            .with_add_dirs(dependency_dirs(&workdir, &plan.dependencies))
            .with_mcp_config(mcp.as_ref().and_then(|m| m.path()).map(PathBuf::from));

        let outcome = self.run_steps(task, plan, &workdir, &spawn_config, &cancel).await;
        if let Some(mcp) = mcp {
            mcp.cleanup();
        }
        outcome
    }

    async fn run_steps(
        &self,
        task: &Task,
        plan: &Plan,
        workdir: &Path,
        spawn_config: &SpawnConfig,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        let mut steps: Vec<&PlanStep> = plan.steps.iter().collect();
        steps.sort_by_key(|s| s.number);
        let total = steps.len();
        let max_attempts = self.max_attempts();
        let mut summaries: Vec<String> = Vec::new();

        for step in steps {
            let mut recovery: Option<String> = None;
            let mut attempt = 1;
            loop {
                if cancel.is_cancelled() {
                    return self.finish_cancelled(task);
                }
                self.log(
                    task,
                    LogLevel::Info,
                    format!(
                        "Step {}/{}: {} (attempt {attempt}/{max_attempts})",
                        step.number, total, step.title
                    ),
                );
                self.bus.emit(EventPayload::for_task(
                    events::STEP_STARTED,
                    task,
                    format!("step {} attempt {attempt}", step.number),
                ));

                let prompt = step_prompt(&StepContext {
                    description: &task.description,
                    project_path: workdir,
                    previous: &summaries,
                    step,
                    total_steps: total,
                    recovery: recovery.as_deref(),
                });
                let attempted = match self
                    .attempt(task, step, prompt, workdir, spawn_config, cancel)
                    .await
                {
                    Ok(a) => a,
                    Err(Halt::Cancelled) => return self.finish_cancelled(task),
                    Err(Halt::Infrastructure(reason)) => return self.finish_failed(task, reason),
                };

                let (failure, result) = match attempted {
                    Attempt::Passed(result) => {
                        let summary = summarize(&result.output, SUMMARY_CHARS);
                        self.log(
                            task,
                            LogLevel::Success,
                            format!("Step {} complete: {}", step.number, step.title),
                        );
                        self.bus.emit(EventPayload::for_task(
                            events::STEP_FINISHED,
                            task,
                            format!("step {}", step.number),
                        ));
                        summaries.push(if summary.is_empty() {
                            step.title.clone()
                        } else {
                            format!("{}: {summary}", step.title)
                        });
                        break;
                    }
                    Attempt::Failed(failure, result) => (failure, result),
                };

                self.log(
                    task,
                    LogLevel::Warn,
                    format!("Step {}: {failure} (attempt {attempt}/{max_attempts})", step.number),
                );

                if attempt >= max_attempts {
                    let reason = format!(
                        "Step {} ({}) failed after {max_attempts} attempts: {failure}",
                        step.number, step.title
                    );
                    return self.finish_blocked(task, reason);
                }

                recovery = match self
                    .diagnose(task, step, &failure, result.as_ref(), workdir, spawn_config, cancel)
                    .await
                {
                    Ok(note) => Some(note),
                    Err(Halt::Cancelled) => return self.finish_cancelled(task),
                    Err(Halt::Infrastructure(reason)) => return self.finish_failed(task, reason),
                };
                self.bus.emit(EventPayload::for_task(
                    events::STEP_RETRY,
                    task,
                    format!("step {} retry {}", step.number, attempt + 1),
                ));
                attempt += 1;
            }
        }

        match self.store.update_state(task.id, TaskState::Done) {
            Ok(_) => {
                self.log(task, LogLevel::Success, "All steps complete");
                ExecOutcome::Done
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "cannot mark task done");
                ExecOutcome::Failed(e.to_string())
            }
        }
    }

    async fn attempt(
        &self,
        task: &Task,
        step: &PlanStep,
        prompt: String,
        workdir: &Path,
        spawn_config: &SpawnConfig,
        cancel: &CancellationToken,
    ) -> Result<Attempt, Halt> {
        let req = self.request(task, prompt, workdir, spawn_config, SpawnPurpose::Step(step.number), step);
        match self.spawner.spawn(req, cancel.clone()).await {
            Ok(result) => Ok(match classify(step, &result) {
                Ok(()) => Attempt::Passed(result),
                Err(failure) => Attempt::Failed(failure, Some(result)),
            }),
            Err(SpawnError::Cancelled) => Err(Halt::Cancelled),
            Err(e) if e.is_infrastructure() => Err(Halt::Infrastructure(e.to_string())),
            Err(SpawnError::TimedOut(d)) => Ok(Attempt::Failed(StepFailure::TimedOut(d), None)),
            Err(e) => Ok(Attempt::Failed(StepFailure::Io(e.to_string()), None)),
        }
    }

    /// Build the context handed to the next attempt.
    #[allow(clippy::too_many_arguments)]
    async fn diagnose(
        &self,
        task: &Task,
        step: &PlanStep,
        failure: &StepFailure,
        result: Option<&SpawnResult>,
        workdir: &Path,
        spawn_config: &SpawnConfig,
        cancel: &CancellationToken,
    ) -> Result<String, Halt> {
        if *failure == StepFailure::NoWrites {
            return Ok(NO_WRITES_NOTE.to_string());
        }

        let tail_chars = self.config.autopilot.output_tail_chars;
        let (exit_code, output, denials) = match result {
            Some(r) => (r.exit_code, tail(&r.output, tail_chars).to_string(), r.denials.clone()),
            None => (-1, failure.to_string(), Vec::new()),
        };
        let prompt = recovery_prompt(&task.description, step, exit_code, &output, &denials);
        let mut config = spawn_config.clone();
        config.max_turns = Some(10);
        let req = self.request(task, prompt, workdir, &config, SpawnPurpose::Recovery(step.number), step);

        let diagnosis = match self.spawner.spawn(req, cancel.clone()).await {
            Ok(r) if r.exit_code == 0 && !r.is_error => {
                format!("Diagnosis: {}", summarize(&r.output, RECOVERY_CHARS))
            }
            Ok(r) => format!(
                "Diagnosis unavailable (exit {}): {}",
                r.exit_code,
                summarize(&r.output, RECOVERY_CHARS)
            ),
            Err(SpawnError::Cancelled) => return Err(Halt::Cancelled),
            Err(e) => format!("Diagnosis unavailable: {e}"),
        };

        let mut note = format!("Attempt failed: {failure}.\n{diagnosis}");
        if !denials.is_empty() {
            note.push_str(&format!(
                "\nThese tools were denied: {}. Achieve the step without them.",
                denials.join(", ")
            ));
        }
        Ok(note)
    }

    fn request(
        &self,
        task: &Task,
        prompt: String,
        workdir: &Path,
        config: &SpawnConfig,
        purpose: SpawnPurpose,
        step: &PlanStep,
    ) -> SpawnRequest {
        SpawnRequest {
            task_id: task.id,
            project: task.project.clone(),
            prompt,
            workdir: Some(workdir.to_path_buf()),
            config: config.clone(),
            purpose,
            agent: step.agent.clone(),
            timeout: self.step_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    fn finish_cancelled(&self, task: &Task) -> ExecOutcome {
        info!(task_id = task.id, "execution cancelled");
        if let Err(e) = self.store.update_state(task.id, TaskState::Planned) {
            warn!(task_id = task.id, error = %e, "cannot return cancelled task to planned");
        }
        self.log(task, LogLevel::Info, "Stopped; task returned to planned");
        ExecOutcome::Cancelled
    }

    fn finish_blocked(&self, task: &Task, reason: String) -> ExecOutcome {
        let recorded = self
            .store
            .set_block_reason(task.id, &reason)
            .and_then(|_| self.store.update_state(task.id, TaskState::Blocked));
        if let Err(e) = recorded {
            error!(task_id = task.id, error = %e, "cannot mark task blocked");
        }
        self.log(task, LogLevel::Error, format!("Blocked: {reason}"));
        ExecOutcome::Blocked(reason)
    }

    fn finish_failed(&self, task: &Task, reason: String) -> ExecOutcome {
        let recorded = self
            .store
            .set_fail_reason(task.id, &reason)
            .and_then(|_| self.store.update_state(task.id, TaskState::Failed));
        if let Err(e) = recorded {
            error!(task_id = task.id, error = %e, "cannot mark task failed");
        }
        self.log(task, LogLevel::Error, format!("Failed: {reason}"));
        ExecOutcome::Failed(reason)
    }
}

/// Resolve plan dependencies against the project directory.
fn dependency_dirs(workdir: &Path, deps: &[String]) -> Vec<PathBuf> {
    deps.iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(|d| {
            let path = match d.strip_prefix("~/") {
                Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
                None => PathBuf::from(d),
            };
            if path.is_absolute() {
                path
            } else {
                workdir.join(path)
            }
        })
        .collect()
}
