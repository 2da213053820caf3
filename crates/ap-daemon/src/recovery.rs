//! Startup recovery: reset interrupted tasks and optionally restart loops.

use ap_core::task_store::TaskStoreError;
use ap_core::types::{LogLevel, TaskId, SYSTEM_PROJECT};
use tracing::{info, warn};

use crate::autopilot::Autopilot;

pub const RECOVERY_NOTE: &str = "Recovered after restart: the previous run was interrupted";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: Vec<TaskId>,
    pub started: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn recover(autopilot: &Autopilot) -> Result<RecoveryReport, TaskStoreError> {
    let ctx = autopilot.context();
    let mut report = RecoveryReport {
        recovered: ctx.store.recover_interrupted(RECOVERY_NOTE)?,
        ..RecoveryReport::default()
    };
    for id in &report.recovered {
        if let Ok(task) = ctx.store.get(*id) {
            ctx.log.log(
                task.id,
                &task.project,
                LogLevel::Warn,
                format!("{RECOVERY_NOTE}; task is {}", task.effective_state()),
            );
        }
    }

    if !ctx.config.autopilot.autostart {
        info!(recovered = report.recovered.len(), "recovery complete, autostart disabled");
        return Ok(report);
    }

    let root = ctx.config.projects_root();
    for project in ctx.store.projects_with_autopilot_pending()? {
        let started = if project == SYSTEM_PROJECT {
            autopilot.start_system()
        } else if !root.join(&project).is_dir() {
            warn!(project = %project, root = %root.display(), "project directory missing, not autostarting");
            report.skipped.push(project);
            continue;
        } else {
            autopilot.start_project_loop(&project)
        };
        match started {
            Ok(()) => report.started.push(project),
            Err(e) => {
                warn!(project = %project, error = %e, "autostart refused");
                report.skipped.push(project);
            }
        }
    }

    info!(
        recovered = report.recovered.len(),
        started = report.started.len(),
        skipped = report.skipped.len(),
        "recovery complete"
    );
    Ok(report)
}
