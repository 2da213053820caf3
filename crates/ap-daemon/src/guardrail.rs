//! Usage-quota guardrail that pauses project loops near the agent's limits.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ap_core::config::{AgentConfig, GuardrailConfig};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OAUTH_BETA: &str = "oauth-2025-04-20";

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("usage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("usage endpoint returned HTTP {0}")]
    Status(u16),
}

/// Utilization percentages of the two quota windows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub session_pct: f64,
    pub weekly_pct: f64,
}

#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Usage, UsageError>;
}

// ---------------------------------------------------------------------------
// OAuth usage endpoint
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Credentials {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<OauthToken>,
}

#[derive(Deserialize)]
struct OauthToken {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    five_hour: Option<Window>,
    #[serde(default)]
    seven_day: Option<Window>,
}

#[derive(Debug, Default, Deserialize)]
struct Window {
    #[serde(default)]
    utilization: Option<f64>,
}

impl From<UsageResponse> for Usage {
    fn from(resp: UsageResponse) -> Self {
        let pct = |w: Option<Window>| w.and_then(|w| w.utilization).unwrap_or(0.0);
        Usage {
            session_pct: pct(resp.five_hour),
            weekly_pct: pct(resp.seven_day),
        }
    }
}

/// Reads the agent's stored OAuth token and queries the usage endpoint.
pub struct OAuthUsageFetcher {
    url: String,
    credentials: PathBuf,
    client: reqwest::Client,
}

impl OAuthUsageFetcher {
    pub fn new(url: impl Into<String>, credentials: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            credentials,
            client,
        }
    }

    pub fn from_config(guardrail: &GuardrailConfig, agent: &AgentConfig) -> Self {
        let credentials = match &guardrail.credentials_path {
            Some(path) => PathBuf::from(path),
            None => agent.claude_dir().join(".credentials.json"),
        };
        Self::new(guardrail.usage_url.clone(), credentials)
    }

    fn access_token(&self) -> Result<String, UsageError> {
        let raw = std::fs::read_to_string(&self.credentials)
            .map_err(|e| UsageError::Credentials(format!("{}: {e}", self.credentials.display())))?;
        let creds: Credentials =
            serde_json::from_str(&raw).map_err(|e| UsageError::Credentials(e.to_string()))?;
        creds
            .oauth
            .map(|o| o.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UsageError::Credentials("no OAuth access token".into()))
    }
}

#[async_trait]
impl UsageFetcher for OAuthUsageFetcher {
    async fn fetch(&self) -> Result<Usage, UsageError> {
        let token = self.access_token()?;
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .header("anthropic-beta", OAUTH_BETA)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UsageError::Status(resp.status().as_u16()));
        }
        let body: UsageResponse = resp.json().await?;
        Ok(body.into())
    }
}

// ---------------------------------------------------------------------------
// Guardrail
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Cache {
    usage: Option<Usage>,
    checked_at: Option<Instant>,
}

pub struct Guardrail {
    enabled: bool,
    session_threshold: f64,
    weekly_threshold: f64,
    ttl: Duration,
    fetcher: Arc<dyn UsageFetcher>,
    cache: Mutex<Cache>,
}

impl Guardrail {
    pub fn new(config: &GuardrailConfig, fetcher: Arc<dyn UsageFetcher>) -> Self {
        Self {
            enabled: config.enabled,
            session_threshold: config.session_threshold,
            weekly_threshold: config.weekly_threshold,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            fetcher,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Guardrail that never pauses.
    pub fn disabled() -> Self {
        struct Never;
        #[async_trait]
        impl UsageFetcher for Never {
            async fn fetch(&self) -> Result<Usage, UsageError> {
                Ok(Usage::default())
            }
        }
        Self {
            enabled: false,
            session_threshold: 100.0,
            weekly_threshold: 100.0,
            ttl: Duration::from_secs(60),
            fetcher: Arc::new(Never),
            cache: Mutex::new(Cache::default()),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|poisoned| {
            warn!("guardrail cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Pause reason for the given usage, if any window is over its threshold.
    pub fn evaluate(&self, usage: Usage) -> Option<String> {
        if usage.session_pct >= self.session_threshold {
            return Some(format!(
                "session usage at {:.0}% (limit {:.0}%)",
                usage.session_pct, self.session_threshold
            ));
        }
        if usage.weekly_pct >= self.weekly_threshold {
            return Some(format!(
                "weekly usage at {:.0}% (limit {:.0}%)",
                usage.weekly_pct, self.weekly_threshold
            ));
        }
        None
    }

    /// Pause reason from cached data, refreshing when the cache is stale.
    pub async fn pause_reason(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let stale = self
            .acquire()
            .checked_at
            .is_none_or(|at| at.elapsed() >= self.ttl);
        if stale {
            self.refresh().await;
        }
        self.cached_reason()
    }

    /// Pause reason from cached data only.
    pub fn cached_reason(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let usage = self.acquire().usage?;
        self.evaluate(usage)
    }

    /// Fetch fresh usage. Failures keep the previous value.
    pub async fn refresh(&self) {
        let result = self.fetcher.fetch().await;
        let mut cache = self.acquire();
        cache.checked_at = Some(Instant::now());
        match result {
            Ok(usage) => {
                debug!(session = usage.session_pct, weekly = usage.weekly_pct, "usage refreshed");
                cache.usage = Some(usage);
            }
            Err(e) => debug!(error = %e, "usage fetch failed, keeping cached value"),
        }
    }

    /// Refresh on `interval` until `cancel` fires.
    pub async fn run_poller(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        if !self.enabled {
            return;
        }
        info!(secs = interval.as_secs(), "guardrail poller started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                    if let Some(reason) = self.cached_reason() {
                        warn!(%reason, "usage above guardrail threshold");
                    }
                }
            }
        }
    }
}
