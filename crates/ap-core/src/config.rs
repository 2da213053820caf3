use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration loaded from `<config_dir>/autopilot/config.json`.
///
/// Every section and field has a default, so a missing or partial file is
/// valid. The UI password is the only secret and is never logged.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-project plan skeleton toggles, keyed by project directory name.
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("general", &self.general)
            .field("agent", &self.agent)
            .field("autopilot", &self.autopilot)
            .field("guardrail", &self.guardrail)
            .field("hub", &self.hub)
            .field("logs", &self.logs)
            .field("webhook", &self.webhook)
            .field("server.enabled", &self.server.enabled)
            .field("server.port", &self.server.port)
            .field("server.password", &self.server.password.as_ref().map(|_| "***"))
            .field("projects", &self.projects.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Config {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = DataPaths::new(DataPaths::default_root()).config_file();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path. `.toml` files are parsed as TOML, anything
    /// else as JSON.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logs.ring_capacity < MIN_RING_CAPACITY {
            return Err(ConfigError::Validation(format!(
                "logs.ring_capacity must be at least {MIN_RING_CAPACITY}"
            )));
        }
        if self.hub.refresh_interval_secs < MIN_REFRESH_SECS {
            return Err(ConfigError::Validation(format!(
                "hub.refresh_interval_secs must be at least {MIN_REFRESH_SECS}"
            )));
        }
        if self.hub.mailbox_capacity == 0 {
            return Err(ConfigError::Validation(
                "hub.mailbox_capacity must be greater than zero".into(),
            ));
        }
        if self.autopilot.max_step_attempts == 0 {
            return Err(ConfigError::Validation(
                "autopilot.max_step_attempts must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("guardrail.session_threshold", self.guardrail.session_threshold),
            ("guardrail.weekly_threshold", self.guardrail.weekly_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be in (0, 100], got {value}"
                )));
            }
        }
        if self.agent.binary.trim().is_empty() {
            return Err(ConfigError::Validation("agent.binary must not be empty".into()));
        }
        Ok(())
    }

    /// Skeleton toggles for `project`, or the defaults when unconfigured.
    pub fn project(&self, project: &str) -> ProjectConfig {
        self.projects.get(project).cloned().unwrap_or_default()
    }

    /// Directory holding project checkouts.
    pub fn projects_root(&self) -> PathBuf {
        match &self.autopilot.projects_root {
            Some(root) => expand_home(root),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("projects"),
        }
    }

    /// Data directory holding tasks, plans and logs.
    pub fn data_paths(&self) -> DataPaths {
        match &self.general.data_dir {
            Some(dir) => DataPaths::new(expand_home(dir)),
            None => DataPaths::new(DataPaths::default_root()),
        }
    }
}

const MIN_RING_CAPACITY: usize = 100;
const MIN_REFRESH_SECS: u64 = 5;
const CONFIG_FILE: &str = "config.json";

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// DataPaths
// ---------------------------------------------------------------------------

/// Layout of persisted state under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("autopilot")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn global_log(&self) -> PathBuf {
        self.logs_dir().join("autopilot.log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.plans_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    /// Keeps `debug` entries in the log ring and raises the tracing level.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            debug: false,
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// An MCP server handed to the agent through `--mcp-config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_plan_max_turns")]
    pub plan_max_turns: u32,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Environment variables removed before spawning the agent.
    #[serde(default = "default_strip_env")]
    pub strip_env: Vec<String>,
    #[serde(default)]
    pub git_name: Option<String>,
    #[serde(default)]
    pub git_email: Option<String>,
    #[serde(default = "default_timeout_mins")]
    pub timeout_mins: u64,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Agent state directory (session files, credentials). Defaults to `~/.claude`.
    #[serde(default)]
    pub claude_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: None,
            effort: None,
            max_turns: default_max_turns(),
            plan_max_turns: default_plan_max_turns(),
            skip_permissions: true,
            strip_env: default_strip_env(),
            git_name: None,
            git_email: None,
            timeout_mins: default_timeout_mins(),
            mcp_servers: Vec::new(),
            claude_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn claude_dir(&self) -> PathBuf {
        match &self.claude_dir {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude"),
        }
    }
}

fn default_agent_binary() -> String {
    "claude".into()
}
fn default_max_turns() -> u32 {
    50
}
fn default_plan_max_turns() -> u32 {
    80
}
fn default_strip_env() -> Vec<String> {
    vec!["CLAUDECODE".into(), "CLAUDE_CODE_ENTRYPOINT".into()]
}
fn default_timeout_mins() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub projects_root: Option<String>,
    /// Cap on simultaneously running project loops; 0 means unlimited.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default, alias = "autopilot_autostart")]
    pub autostart: bool,
    #[serde(default = "default_delay_ms")]
    pub pre_run_delay_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
    #[serde(default = "default_output_tail_chars")]
    pub output_tail_chars: usize,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            projects_root: None,
            max_concurrent: default_max_concurrent(),
            autostart: false,
            pre_run_delay_ms: default_delay_ms(),
            pacing_delay_ms: default_delay_ms(),
            max_step_attempts: default_max_step_attempts(),
            output_tail_chars: default_output_tail_chars(),
        }
    }
}

fn default_max_concurrent() -> usize {
    2
}
fn default_delay_ms() -> u64 {
    2000
}
fn default_max_step_attempts() -> u32 {
    3
}
fn default_output_tail_chars() -> usize {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percent utilization of the rolling session window that pauses loops.
    #[serde(default = "default_threshold")]
    pub session_threshold: f64,
    #[serde(default = "default_threshold")]
    pub weekly_threshold: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_usage_url")]
    pub usage_url: String,
    /// Defaults to `<claude_dir>/.credentials.json`.
    #[serde(default)]
    pub credentials_path: Option<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_threshold: default_threshold(),
            weekly_threshold: default_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            usage_url: default_usage_url(),
            credentials_path: None,
        }
    }
}

fn default_threshold() -> f64 {
    90.0
}
fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_poll_interval_secs() -> u64 {
    300
}
fn default_usage_url() -> String {
    "https://api.anthropic.com/api/oauth/usage".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            refresh_interval_secs: default_refresh_interval_secs(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

fn default_mailbox_capacity() -> usize {
    32
}
fn default_refresh_interval_secs() -> u64 {
    5
}
fn default_coalesce_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_ring_capacity() -> usize {
    500
}
fn default_retention_days() -> u32 {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared password for the web UI; `None` leaves the API open.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            password: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7878
}

/// Which skeleton sections the plan prompt enables for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub web_search: bool,
    #[serde(default = "default_true")]
    pub build_verify: bool,
    #[serde(default = "default_true")]
    pub test: bool,
    #[serde(default)]
    pub pre_commit: bool,
    #[serde(default = "default_true")]
    pub commit: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub library_docs: bool,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            web_search: false,
            build_verify: true,
            test: true,
            pre_commit: false,
            commit: true,
            push: false,
            library_docs: false,
            build_command: None,
            test_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.hub.mailbox_capacity, 32);
        assert_eq!(cfg.autopilot.max_step_attempts, 3);
        assert_eq!(cfg.guardrail.cache_ttl_secs, 60);
    }

    #[test]
    fn debug_output_hides_password() {
        let mut cfg = Config::default();
        cfg.server.password = Some("hunter2".into());
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn autostart_accepts_legacy_key() {
        let cfg: Config =
            serde_json::from_str(r#"{"autopilot": {"autopilot_autostart": true}}"#).unwrap();
        assert!(cfg.autopilot.autostart);
    }

    #[test]
    fn unknown_project_gets_default_skeleton() {
        let cfg = Config::default();
        assert_eq!(cfg.project("nope"), ProjectConfig::default());
    }

    #[test]
    fn data_paths_layout() {
        let paths = DataPaths::new("/data");
        assert_eq!(paths.tasks_file(), PathBuf::from("/data/tasks.json"));
        assert_eq!(paths.plans_dir(), PathBuf::from("/data/plans"));
        assert_eq!(paths.global_log(), PathBuf::from("/data/logs/autopilot.log"));
        assert_eq!(paths.config_file(), PathBuf::from("/data/config.json"));
    }
}
