//! Per-project sequential driver: plan, run, settle, repeat.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ap_agents::executor::ExecOutcome;
use ap_agents::planner::{PlanGenError, PlanGenerator};
use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{events, EventPayload};
use ap_core::config::Config;
use ap_core::log_ring::LogRing;
use ap_core::plan::Plan;
use ap_core::plan_store::PlanStore;
use ap_core::task_store::{TaskStore, TaskStoreError};
use ap_core::types::{LogLevel, Task, TaskState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::guardrail::Guardrail;
use crate::manager::EngineManager;

/// Everything a project loop needs, shared by all loops.
pub struct LoopContext {
    pub store: Arc<TaskStore>,
    pub plans: PlanStore,
    pub generator: Arc<PlanGenerator>,
    pub manager: Arc<EngineManager>,
    pub guardrail: Arc<Guardrail>,
    pub log: Arc<LogRing>,
    pub bus: EventBus,
    pub config: Arc<Config>,
}

/// What the loop does after a task settles.
enum Next {
    Continue,
    Halt,
}

impl LoopContext {
    fn pre_run_delay(&self) -> Duration {
        Duration::from_millis(self.config.autopilot.pre_run_delay_ms)
    }

    fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.config.autopilot.pacing_delay_ms)
    }

    fn note(&self, project: &str, level: LogLevel, message: impl Into<String>) {
        self.log.log(0, project, level, message);
    }

    /// Drive `project` until its queue is empty, a task halts the chain, the
    /// guardrail pauses, or `cancel` fires.
    pub async fn run(self: Arc<Self>, project: String, cancel: CancellationToken) {
        info!(project = %project, "project loop running");
        self.bus.emit(EventPayload::for_project(events::LOOP_STARTED, &project, "autopilot started"));

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(reason) = self.guardrail.pause_reason().await {
                self.note(&project, LogLevel::Warn, format!("Autopilot paused: {reason}"));
                self.bus.emit(EventPayload::for_project(events::GUARDRAIL_PAUSED, &project, reason));
                break;
            }

            let task = match self.store.next_autopilot(&project) {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.note(&project, LogLevel::Info, "No more tasks");
                    break;
                }
                Err(e) => {
                    error!(project = %project, error = %e, "cannot read task queue");
                    self.note(&project, LogLevel::Error, format!("Cannot read task queue: {e}"));
                    break;
                }
            };

            let next = self.process(&task, &cancel).await;
            if matches!(next, Next::Halt) || cancel.is_cancelled() {
                break;
            }
            if !sleep_or_cancel(self.pacing_delay(), &cancel).await {
                break;
            }
        }

        self.note(&project, LogLevel::Info, "Autopilot stopped");
        self.bus.emit(EventPayload::for_project(events::LOOP_STOPPED, &project, "autopilot stopped"));
    }

    async fn process(&self, task: &Task, cancel: &CancellationToken) -> Next {
        let plan = match task.effective_state() {
            TaskState::Pending => match self.generator.generate(task, cancel.child_token()).await {
                Ok(generated) => {
                    match self.store.mark_planned(task.id, &generated.path) {
                        Ok(_) => {}
                        Err(e @ TaskStoreError::InvalidTransition { .. }) => {
                            if let Err(e) = self.plans.remove(task.id) {
                                warn!(task_id = task.id, error = %e, "cannot remove unused plan");
                            }
                            return self.skip(task, &e.to_string());
                        }
                        Err(e) => return self.plan_failed(task, format!("cannot record plan: {e}")),
                    }
                    if !sleep_or_cancel(self.pre_run_delay(), cancel).await {
                        return Next::Halt;
                    }
                    generated.plan
                }
                Err(PlanGenError::Cancelled) if cancel.is_cancelled() => return Next::Halt,
                Err(PlanGenError::Cancelled) => return self.generation_cancelled(task),
                Err(e) => return self.plan_failed(task, format!("Plan generation failed: {e}")),
            },
            TaskState::Planned => match self.plans.parse(Path::new(&task.plan_file)) {
                Ok(plan) => plan,
                Err(e) => return self.plan_failed(task, format!("Plan unreadable: {e}")),
            },
            other => {
                warn!(task_id = task.id, state = %other, "task not runnable");
                return Next::Halt;
            }
        };

        self.execute(task, plan, cancel).await
    }

    async fn execute(&self, task: &Task, plan: Plan, cancel: &CancellationToken) -> Next {
        // the task may have been replanned or settled during the pre-run delay
        let task = match self.store.get(task.id) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = task.id, error = %e, "task vanished before run");
                return Next::Halt;
            }
        };
        if task.effective_state() != TaskState::Planned || task.plan_file.is_empty() {
            return self.skip(&task, &format!("task is {} before start", task.effective_state()));
        }
        let handle = match self.manager.start(task.clone(), plan, cancel) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "cannot start task");
                return Next::Halt;
            }
        };

        match handle.wait().await {
            ExecOutcome::Done | ExecOutcome::Blocked(_) => Next::Continue,
            ExecOutcome::Skipped(reason) => self.skip(&task, &reason),
            ExecOutcome::Cancelled => Next::Halt,
            ExecOutcome::Failed(_) if task.optional => Next::Continue,
            ExecOutcome::Failed(reason) => {
                self.log.log(
                    task.id,
                    &task.project,
                    LogLevel::Warn,
                    format!("Halting autopilot: task #{} failed ({reason})", task.id),
                );
                Next::Halt
            }
        }
    }

    /// A generation cancelled for this task alone. Move on only if the task
    /// really left the queue; otherwise the loop would plan it again.
    fn generation_cancelled(&self, task: &Task) -> Next {
        match self.store.get(task.id) {
            Ok(current) if !(current.auto_pilot && current.effective_state().is_eligible()) => {
                self.skip(&current, "task changed while planning")
            }
            Ok(_) => Next::Halt,
            Err(e) => {
                error!(task_id = task.id, error = %e, "cannot re-read task");
                Next::Halt
            }
        }
    }

    fn skip(&self, task: &Task, reason: &str) -> Next {
        info!(task_id = task.id, %reason, "skipping task");
        self.log.log(
            task.id,
            &task.project,
            LogLevel::Info,
            format!("Skipped task #{}: {reason}", task.id),
        );
        Next::Continue
    }

    fn plan_failed(&self, task: &Task, reason: String) -> Next {
        warn!(task_id = task.id, %reason, "planning failed");
        let recorded = self
            .store
            .set_fail_reason(task.id, &reason)
            .and_then(|_| self.store.update_state(task.id, TaskState::Failed));
        if let Err(e) = recorded {
            error!(task_id = task.id, error = %e, "cannot mark task failed");
        }
        self.log.log(task.id, &task.project, LogLevel::Error, reason);
        if task.optional {
            Next::Continue
        } else {
            Next::Halt
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
