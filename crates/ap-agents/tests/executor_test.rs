//! Executor and plan generator driven by a scripted spawner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ap_agents::executor::{ExecOutcome, TaskExecutor};
use ap_agents::planner::{PlanGenError, PlanGenerator};
use ap_agents::spawner::{AgentSpawner, Result, SpawnError, SpawnPurpose, SpawnRequest, SpawnResult};
use ap_bridge::event_bus::EventBus;
use ap_core::config::Config;
use ap_core::log_ring::LogRing;
use ap_core::plan::Plan;
use ap_core::plan_store::PlanStore;
use ap_core::task_store::TaskStore;
use ap_core::types::{LogLevel, Priority, Task, TaskState};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// ===========================================================================
// Helpers
// ===========================================================================

enum Reply {
    Result(SpawnResult),
    Error(fn() -> SpawnError),
    /// Block until cancelled.
    Hang,
}

fn wrote(tools: &[&str]) -> Reply {
    Reply::Result(SpawnResult {
        exit_code: 0,
        output: "Summary: made the change".into(),
        tools_used: tools.iter().map(|t| t.to_string()).collect(),
        ..SpawnResult::default()
    })
}

fn denied(tool: &str) -> Reply {
    Reply::Result(SpawnResult {
        exit_code: 0,
        output: "could not edit".into(),
        denials: vec![tool.to_string()],
        ..SpawnResult::default()
    })
}

fn exited(code: i32) -> Reply {
    Reply::Result(SpawnResult {
        exit_code: code,
        output: "compile error".into(),
        tools_used: vec!["Edit".into()],
        ..SpawnResult::default()
    })
}

/// Step and plan spawns pop scripted replies; diagnosis spawns always succeed.
#[derive(Default)]
struct ScriptedSpawner {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<SpawnPurpose>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSpawner {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    fn calls(&self) -> Vec<SpawnPurpose> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, purpose: SpawnPurpose) -> usize {
        self.calls().iter().filter(|p| **p == purpose).count()
    }
}

#[async_trait]
impl AgentSpawner for ScriptedSpawner {
    async fn spawn(&self, req: SpawnRequest, cancel: CancellationToken) -> Result<SpawnResult> {
        self.calls.lock().unwrap().push(req.purpose);
        self.prompts.lock().unwrap().push(req.prompt.clone());
        if let SpawnPurpose::Recovery(_) = req.purpose {
            return Ok(SpawnResult {
                output: "The edit tool was blocked; use Write instead.".into(),
                ..SpawnResult::default()
            });
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Result(r)) => Ok(r),
            Some(Reply::Error(make)) => Err(make()),
            Some(Reply::Hang) => {
                cancel.cancelled().await;
                Err(SpawnError::Cancelled)
            }
            None => Ok(SpawnResult::default()),
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<TaskStore>,
    plans: PlanStore,
    log: Arc<LogRing>,
    config: Arc<Config>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.autopilot.projects_root = Some(dir.path().join("projects").display().to_string());
    std::fs::create_dir_all(dir.path().join("projects/demo")).unwrap();
    Fixture {
        store: Arc::new(TaskStore::new(dir.path().join("tasks.json"))),
        plans: PlanStore::new(dir.path().join("plans")),
        log: Arc::new(LogRing::in_memory(200)),
        config: Arc::new(config),
        _dir: dir,
    }
}

const TWO_STEPS: &str = "# Greeting\n\n### Step 1: Create file hello.txt\nWrite hello.\n\n### Step 2: Mention it\nEdit README.\n";

impl Fixture {
    fn planned_task(&self, plan: &str) -> (Task, Plan) {
        let task = self.store.add("demo", "hello", Priority::Med).unwrap();
        let path = self.plans.save(task.id, plan).unwrap();
        let task = self.store.mark_planned(task.id, &path).unwrap();
        (task, Plan::parse(plan).unwrap())
    }

    fn executor(&self, spawner: Arc<ScriptedSpawner>) -> TaskExecutor {
        TaskExecutor::new(
            spawner,
            self.store.clone(),
            self.log.clone(),
            EventBus::new(),
            self.config.clone(),
        )
    }

    fn generator(&self, spawner: Arc<ScriptedSpawner>) -> PlanGenerator {
        PlanGenerator::new(
            spawner,
            self.plans.clone(),
            self.log.clone(),
            EventBus::new(),
            self.config.clone(),
        )
    }

    fn logged(&self, level: LogLevel, needle: &str) -> bool {
        self.log
            .snapshot()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}

// ===========================================================================
// Executor
// ===========================================================================

#[tokio::test]
async fn happy_path_completes_every_step() {
    let fx = fixture();
    let (task, plan) = fx.planned_task(TWO_STEPS);
    let spawner = ScriptedSpawner::new(vec![wrote(&["Write"]), wrote(&["Edit"])]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    assert_eq!(outcome, ExecOutcome::Done);
    assert_eq!(spawner.calls(), vec![SpawnPurpose::Step(1), SpawnPurpose::Step(2)]);
    assert_eq!(fx.store.get(task.id).unwrap().effective_state(), TaskState::Done);
    assert!(fx.logged(LogLevel::Success, "All steps complete"));

    // step 2 sees step 1's summary
    let prompts = spawner.prompts.lock().unwrap();
    assert!(prompts[1].contains("made the change"));
}

#[tokio::test]
async fn denial_then_success_retries_once() {
    let fx = fixture();
    let (task, plan) = fx.planned_task("# G\n\n### Step 1: Create file hello.txt\nWrite hello.\n");
    let spawner = ScriptedSpawner::new(vec![denied("Edit"), wrote(&["Write"])]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    assert_eq!(outcome, ExecOutcome::Done);
    assert_eq!(spawner.count(SpawnPurpose::Step(1)), 2);
    assert_eq!(spawner.count(SpawnPurpose::Recovery(1)), 1);
    assert!(fx.logged(LogLevel::Warn, "Edit"));

    let prompts = spawner.prompts.lock().unwrap();
    let retry = prompts.last().unwrap();
    assert!(retry.contains("PREVIOUS ATTEMPT FAILED"));
    assert!(retry.contains("These tools were denied: Edit"));
}

#[tokio::test]
async fn exhausted_retries_block_the_task() {
    let fx = fixture();
    let (task, plan) = fx.planned_task(TWO_STEPS);
    let spawner = ScriptedSpawner::new(vec![exited(1), exited(1), exited(2)]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    let ExecOutcome::Blocked(reason) = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert!(reason.starts_with("Step 1 (Create file hello.txt) failed after 3 attempts"));
    assert_eq!(spawner.count(SpawnPurpose::Step(1)), 3);
    assert_eq!(spawner.count(SpawnPurpose::Step(2)), 0);

    let stored = fx.store.get(task.id).unwrap();
    assert_eq!(stored.effective_state(), TaskState::Blocked);
    assert_eq!(stored.block_reason, reason);
}

#[tokio::test]
async fn read_only_success_without_writes_but_writable_step_retries() {
    let fx = fixture();
    let plan_text = "# G\n\n### Step 1: Inspect\nLook.\nReadOnly: true\n\n### Step 2: Change\nEdit.\n";
    let (task, plan) = fx.planned_task(plan_text);
    let spawner = ScriptedSpawner::new(vec![wrote(&["Read"]), wrote(&["Read"]), wrote(&["Write"])]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    assert_eq!(outcome, ExecOutcome::Done);
    assert_eq!(spawner.count(SpawnPurpose::Step(1)), 1);
    assert_eq!(spawner.count(SpawnPurpose::Step(2)), 2);
    // no-write retries skip the diagnosis call
    assert_eq!(spawner.count(SpawnPurpose::Recovery(2)), 0);
    let prompts = spawner.prompts.lock().unwrap();
    assert!(prompts.last().unwrap().contains("requires actual file changes"));
}

#[tokio::test]
async fn cancellation_returns_task_to_planned() {
    let fx = fixture();
    let (task, plan) = fx.planned_task(TWO_STEPS);
    let spawner = ScriptedSpawner::new(vec![Reply::Hang]);
    let executor = fx.executor(spawner.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), executor.run(&task, &plan, cancel))
        .await
        .unwrap();
    assert_eq!(outcome, ExecOutcome::Cancelled);
    assert_eq!(fx.store.get(task.id).unwrap().effective_state(), TaskState::Planned);
}

#[tokio::test]
async fn missing_agent_fails_without_retry() {
    let fx = fixture();
    let (task, plan) = fx.planned_task(TWO_STEPS);
    let spawner = ScriptedSpawner::new(vec![Reply::Error(|| SpawnError::AgentNotFound("claude".into()))]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    assert!(matches!(outcome, ExecOutcome::Failed(_)));
    assert_eq!(spawner.calls().len(), 1);
    let stored = fx.store.get(task.id).unwrap();
    assert_eq!(stored.effective_state(), TaskState::Failed);
    assert!(stored.fail_reason.contains("not found"));
}

#[tokio::test]
async fn task_replanned_before_start_is_skipped() {
    let fx = fixture();
    let (task, plan) = fx.planned_task(TWO_STEPS);
    fx.store.reset_plan(task.id).unwrap();
    let spawner = ScriptedSpawner::new(vec![wrote(&["Write"])]);

    let outcome = fx.executor(spawner.clone()).run(&task, &plan, CancellationToken::new()).await;

    assert!(matches!(outcome, ExecOutcome::Skipped(_)));
    assert!(spawner.calls().is_empty());
    let stored = fx.store.get(task.id).unwrap();
    assert_eq!(stored.effective_state(), TaskState::Pending);
    assert!(stored.fail_reason.is_empty());
}

// ===========================================================================
// Plan generator
// ===========================================================================

#[tokio::test]
async fn generator_saves_and_parses_the_plan() {
    let fx = fixture();
    let task = fx.store.add("demo", "hello", Priority::Med).unwrap();
    let output = format!("Here you go:\n```markdown\n{TWO_STEPS}```");
    let spawner = ScriptedSpawner::new(vec![Reply::Result(SpawnResult {
        output,
        ..SpawnResult::default()
    })]);

    let generated = fx
        .generator(spawner.clone())
        .generate(&task, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(spawner.calls(), vec![SpawnPurpose::Plan]);
    assert_eq!(generated.plan.steps.len(), 2);
    assert_eq!(generated.path, fx.plans.path(task.id));
    assert_eq!(fx.plans.load(task.id).unwrap(), generated.plan);
    assert!(fx.logged(LogLevel::Success, "Plan ready"));
}

#[tokio::test]
async fn generator_failures_are_classified() {
    let fx = fixture();
    let task = fx.store.add("demo", "hello", Priority::Med).unwrap();

    let empty = ScriptedSpawner::new(vec![Reply::Result(SpawnResult::default())]);
    let err = fx.generator(empty).generate(&task, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PlanGenError::EmptyResult));

    let prose = ScriptedSpawner::new(vec![Reply::Result(SpawnResult {
        output: "# Title\nI could not come up with steps.".into(),
        ..SpawnResult::default()
    })]);
    let err = fx.generator(prose).generate(&task, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PlanGenError::Parse(_)));

    let missing = ScriptedSpawner::new(vec![Reply::Error(|| SpawnError::AgentNotFound("claude".into()))]);
    let generator = fx.generator(missing);
    let err = generator.generate(&task, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PlanGenError::AgentNotFound(_)));
    assert!(!generator.is_generating(task.id));
    assert!(!fx.plans.exists(task.id));
}
