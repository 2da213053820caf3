//! Argument list, MCP config file and environment for agent invocations.

use ap_core::config::{AgentConfig, McpServerConfig};
use serde_json::{json, Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    StreamJson,
    Json,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::StreamJson => "stream-json",
            OutputFormat::Json => "json",
        }
    }
}

/// Flags for one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    pub binary: String,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub max_turns: Option<u32>,
    pub output_format: OutputFormat,
    pub verbose: bool,
    pub no_session_persistence: bool,
    pub skip_permissions: bool,
    pub add_dirs: Vec<PathBuf>,
    pub mcp_config: Option<PathBuf>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            effort: None,
            max_turns: None,
            output_format: OutputFormat::StreamJson,
            verbose: true,
            no_session_persistence: true,
            skip_permissions: false,
            add_dirs: Vec::new(),
            mcp_config: None,
        }
    }
}

impl SpawnConfig {
    /// Streaming configuration used for plan steps and diagnosis.
    pub fn for_steps(agent: &AgentConfig) -> Self {
        Self {
            binary: agent.binary.clone(),
            model: agent.model.clone(),
            effort: agent.effort.clone(),
            max_turns: Some(agent.max_turns),
            skip_permissions: agent.skip_permissions,
            ..Self::default()
        }
    }

    /// Single JSON result with the larger turn budget planning needs.
    pub fn for_plan(agent: &AgentConfig) -> Self {
        Self {
            max_turns: Some(agent.plan_max_turns),
            output_format: OutputFormat::Json,
            verbose: false,
            ..Self::for_steps(agent)
        }
    }

    pub fn with_add_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.add_dirs.extend(dirs);
        self
    }

    pub fn with_mcp_config(mut self, path: Option<PathBuf>) -> Self {
        self.mcp_config = path;
        self
    }

    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            self.output_format.as_str().to_string(),
        ];
        // stream-json requires --verbose in print mode
        if self.verbose || self.output_format == OutputFormat::StreamJson {
            args.push("--verbose".to_string());
        }
        if let Some(turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        if self.no_session_persistence {
            args.push("--no-session-persistence".to_string());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        for dir in &self.add_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.display().to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(effort) = &self.effort {
            args.push("--effort".to_string());
            args.push(effort.clone());
        }
        if let Some(path) = &self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// MCP config file
// ---------------------------------------------------------------------------

/// Temporary `--mcp-config` file. Removed by [`McpConfigFile::cleanup`] or on drop.
#[derive(Debug)]
pub struct McpConfigFile {
    path: Option<PathBuf>,
}

impl McpConfigFile {
    /// Write the enabled servers into `dir`. Returns `None` when none are enabled.
    pub fn write(servers: &[McpServerConfig], dir: &Path) -> io::Result<Option<Self>> {
        let enabled: Vec<&McpServerConfig> = servers.iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            return Ok(None);
        }

        let mut map = Map::new();
        for server in enabled {
            map.insert(
                server.name.clone(),
                json!({
                    "command": server.command,
                    "args": server.args,
                    "env": server.env,
                }),
            );
        }
        let body = serde_json::to_vec_pretty(&json!({ "mcpServers": Value::Object(map) }))
            .map_err(io::Error::other)?;

        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("autopilot-mcp-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, body)?;
        debug!(path = %path.display(), "wrote MCP config");
        Ok(Some(Self { path: Some(path) }))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cleanup(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove MCP config");
                }
            }
        }
    }
}

impl Drop for McpConfigFile {
    fn drop(&mut self) {
        self.remove();
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Environment handed to the child: inherited minus `strip`, plus git identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentEnv {
    pub strip: Vec<String>,
    pub git_name: Option<String>,
    pub git_email: Option<String>,
}

impl AgentEnv {
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self {
            strip: agent.strip_env.clone(),
            git_name: agent.git_name.clone(),
            git_email: agent.git_email.clone(),
        }
    }

    pub fn build(&self) -> Vec<(String, String)> {
        self.filter(std::env::vars())
    }

    pub fn filter(&self, vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
        let identity = [
            ("GIT_AUTHOR_NAME", &self.git_name),
            ("GIT_COMMITTER_NAME", &self.git_name),
            ("GIT_AUTHOR_EMAIL", &self.git_email),
            ("GIT_COMMITTER_EMAIL", &self.git_email),
        ];

        let mut out: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(k, _)| !self.strip.iter().any(|s| s == k))
            .filter(|(k, _)| !identity.iter().any(|(name, v)| v.is_some() && name == k))
            .collect();
        for (name, value) in identity {
            if let Some(value) = value {
                out.push((name.to_string(), value.clone()));
            }
        }
        out
    }
}
