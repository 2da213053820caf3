//! Agent process spawning.
//!
//! [`AgentSpawner`] is the seam the executor and plan generator talk to;
//! [`CliSpawner`] runs the real agent binary and decodes its stdout.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ap_core::log_ring::LogRing;
use ap_core::types::{LogEntry, LogLevel, TaskId, SYSTEM_PROJECT};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::spawn_config::{AgentEnv, SpawnConfig};
use crate::stream::{parse_line, ContentBlock, StreamEvent};

const STDERR_TAIL: usize = 4096;
const KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("agent binary not found: {0}")]
    AgentNotFound(String),
    #[error("failed to start agent: {0}")]
    Start(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("agent run cancelled")]
    Cancelled,
    #[error("agent timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl SpawnError {
    /// Errors that no retry can fix.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SpawnError::AgentNotFound(_) | SpawnError::Start(_))
    }
}

pub type Result<T> = std::result::Result<T, SpawnError>;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPurpose {
    Plan,
    Step(u32),
    Recovery(u32),
}

impl fmt::Display for SpawnPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnPurpose::Plan => write!(f, "plan"),
            SpawnPurpose::Step(n) => write!(f, "step {n}"),
            SpawnPurpose::Recovery(n) => write!(f, "recovery for step {n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    pub project: String,
    pub prompt: String,
    pub workdir: Option<PathBuf>,
    pub config: SpawnConfig,
    pub purpose: SpawnPurpose,
    /// Label attached to log entries, e.g. the step's agent role.
    pub agent: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnResult {
    pub exit_code: i32,
    pub output: String,
    pub denials: Vec<String>,
    pub tools_used: Vec<String>,
    pub is_error: bool,
}

impl SpawnResult {
    pub fn used_any(&self, tools: &[&str]) -> bool {
        self.tools_used.iter().any(|t| tools.contains(&t.as_str()))
    }
}

#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Run the agent to completion. Cancelling `cancel` kills the child.
    async fn spawn(&self, req: SpawnRequest, cancel: CancellationToken) -> Result<SpawnResult>;
}

/// Working directory for `project`: `<root>/<project>`, or the home
/// directory for the system queue.
pub fn project_dir(root: &Path, project: &str) -> PathBuf {
    if project == SYSTEM_PROJECT || project.is_empty() {
        return home_dir();
    }
    root.join(project)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// CLI implementation
// ---------------------------------------------------------------------------

pub struct CliSpawner {
    log: Arc<LogRing>,
    env: AgentEnv,
}

impl CliSpawner {
    pub fn new(log: Arc<LogRing>, env: AgentEnv) -> Self {
        Self { log, env }
    }
}

#[async_trait]
impl AgentSpawner for CliSpawner {
    async fn spawn(&self, req: SpawnRequest, cancel: CancellationToken) -> Result<SpawnResult> {
        let workdir = match &req.workdir {
            Some(dir) if dir.is_dir() => dir.clone(),
            Some(dir) => {
                warn!(task_id = req.task_id, dir = %dir.display(), "workdir missing, using home");
                home_dir()
            }
            None => home_dir(),
        };
        let args = req.config.build_args(&req.prompt);
        debug!(
            task_id = req.task_id,
            purpose = %req.purpose,
            binary = %req.config.binary,
            workdir = %workdir.display(),
            "spawning agent"
        );

        let mut child = Command::new(&req.config.binary)
            .args(&args)
            .current_dir(&workdir)
            .env_clear()
            .envs(self.env.build())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => SpawnError::AgentNotFound(req.config.binary.clone()),
                _ => SpawnError::Start(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Io(io::Error::other("agent stdout not captured")))?;
        let stderr = child.stderr.take();

        let sink = LogSink {
            log: self.log.clone(),
            task_id: req.task_id,
            project: req.project.clone(),
            agent: req.agent.clone(),
        };
        let mut reader = tokio::spawn(async move { read_stream(stdout, &sink).await });
        let stderr_task = stderr.map(|s| tokio::spawn(read_tail(s, STDERR_TAIL)));

        let deadline = async {
            match req.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let joined = tokio::select! {
            joined = &mut reader => joined,
            _ = cancel.cancelled() => {
                info!(task_id = req.task_id, purpose = %req.purpose, "cancelling agent");
                terminate(&mut child).await;
                reader.abort();
                return Err(SpawnError::Cancelled);
            }
            _ = &mut deadline => {
                let limit = req.timeout.unwrap_or_default();
                warn!(task_id = req.task_id, purpose = %req.purpose, secs = limit.as_secs(), "agent timed out");
                terminate(&mut child).await;
                reader.abort();
                return Err(SpawnError::TimedOut(limit));
            }
        };
        let summary = joined.map_err(|e| SpawnError::Io(io::Error::other(e)))??;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(SpawnError::Cancelled);
            }
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_code = status.code().unwrap_or(-1);
        debug!(task_id = req.task_id, purpose = %req.purpose, exit_code, "agent exited");
        Ok(summary.into_result(exit_code, &stderr_tail))
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "agent already exited");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("agent did not exit after kill");
    }
}

/// Drain `reader`, keeping only the last `max` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> String {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(max);
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend(&chunk[..n]);
                let excess = tail.len().saturating_sub(max);
                tail.drain(..excess);
            }
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
    let bytes: Vec<u8> = tail.into();
    // a cut through a multi-byte character decodes as U+FFFD
    String::from_utf8_lossy(&bytes)
        .trim_start_matches('\u{FFFD}')
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

struct LogSink {
    log: Arc<LogRing>,
    task_id: TaskId,
    project: String,
    agent: Option<String>,
}

impl LogSink {
    fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let mut entry = LogEntry::new(self.task_id, &self.project, level, message);
        if let Some(agent) = &self.agent {
            entry = entry.with_agent(agent.clone());
        }
        self.log.add(entry);
    }
}

/// Everything collected from one agent's stdout.
#[derive(Debug, Default)]
struct StreamSummary {
    result: Option<String>,
    error: Option<String>,
    denials: Vec<String>,
    tools_used: Vec<String>,
    is_error: bool,
    unparsed: String,
}

impl StreamSummary {
    fn into_result(mut self, exit_code: i32, stderr_tail: &str) -> SpawnResult {
        if self.result.is_none() {
            self.absorb_unparsed();
        }
        let output = match self.result {
            Some(result) => result,
            None => {
                let mut parts = Vec::new();
                if let Some(err) = self.error {
                    parts.push(err);
                }
                if !stderr_tail.is_empty() {
                    parts.push(stderr_tail.to_string());
                }
                parts.join("\n")
            }
        };
        SpawnResult {
            exit_code,
            output,
            denials: self.denials,
            tools_used: self.tools_used,
            is_error: self.is_error,
        }
    }

    /// Non-streaming mode may print the result object across several lines.
    fn absorb_unparsed(&mut self) {
        let text = self.unparsed.trim();
        if text.is_empty() {
            return;
        }
        if let Ok(StreamEvent::Result(result)) = serde_json::from_str::<StreamEvent>(text) {
            self.apply_result(result);
        }
    }

    fn apply_result(&mut self, result: crate::stream::ResultEvent) {
        self.is_error = result.is_error;
        for denial in result.permission_denials {
            if !self.denials.contains(&denial.tool_name) {
                self.denials.push(denial.tool_name);
            }
        }
        self.result = Some(result.result);
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: R, sink: &LogSink) -> Result<StreamSummary> {
    let mut summary = StreamSummary::default();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Some(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            let text = text.trim();
                            if !text.is_empty() {
                                sink.emit(LogLevel::Info, text);
                            }
                        }
                        ContentBlock::ToolUse { name } => {
                            sink.emit(LogLevel::Debug, format!("tool: {name}"));
                            if !summary.tools_used.contains(&name) {
                                summary.tools_used.push(name);
                            }
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Some(StreamEvent::Result(result)) => summary.apply_result(result),
            Some(event @ StreamEvent::Error { .. }) => {
                let message = event.error_message().unwrap_or_default();
                sink.emit(LogLevel::Error, format!("agent error: {message}"));
                summary.error = Some(message);
            }
            Some(StreamEvent::Other) => {}
            None => {
                if summary.unparsed.len() < 1 << 20 {
                    summary.unparsed.push_str(&line);
                    summary.unparsed.push('\n');
                }
            }
        }
    }
    Ok(summary)
}
