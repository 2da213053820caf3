use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ap_agents::executor::TaskExecutor;
use ap_agents::planner::PlanGenerator;
use ap_agents::spawn_config::AgentEnv;
use ap_agents::spawner::{AgentSpawner, CliSpawner};
use ap_bridge::control::ControlSurface;
use ap_bridge::driver::SnapshotDriver;
use ap_bridge::event_bus::EventBus;
use ap_bridge::git::ProjectScanner;
use ap_bridge::hub::Hub;
use ap_bridge::metrics::MetricsScanner;
use ap_bridge::snapshot::{Labels, SnapshotAssembler};
use ap_bridge::webhook::WebhookNotifier;
use ap_core::config::{Config, DataPaths};
use ap_core::log_ring::LogRing;
use ap_core::plan_store::PlanStore;
use ap_core::task_store::TaskStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::autopilot::{Autopilot, EngineProbe};
use crate::guardrail::{Guardrail, OAuthUsageFetcher};
use crate::manager::EngineManager;
use crate::project_loop::LoopContext;
use crate::recovery;

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The autopilot daemon: owns every long-lived component and the root
/// cancellation token they hang off.
pub struct Daemon {
    config: Arc<Config>,
    paths: DataPaths,
    shutdown: CancellationToken,
    log: Arc<LogRing>,
    guardrail: Arc<Guardrail>,
    autopilot: Arc<Autopilot>,
    driver: SnapshotDriver,
}

impl Daemon {
    /// Build the daemon with the real agent CLI.
    pub fn new(config: Config) -> Result<Self> {
        let paths = config.data_paths();
        paths
            .ensure()
            .with_context(|| format!("failed to create data directory {}", paths.root.display()))?;
        let log = Arc::new(LogRing::new(paths.logs_dir(), config.logs.ring_capacity));
        let spawner = Arc::new(CliSpawner::new(log.clone(), AgentEnv::from_config(&config.agent)));
        Self::with_spawner(config, log, spawner)
    }

    /// Build the daemon around an existing log ring and spawner.
    pub fn with_spawner(config: Config, log: Arc<LogRing>, spawner: Arc<dyn AgentSpawner>) -> Result<Self> {
        let config = Arc::new(config);
        let paths = config.data_paths();
        paths
            .ensure()
            .with_context(|| format!("failed to create data directory {}", paths.root.display()))?;

        log.set_debug(config.general.debug);
        match log.restore(log.capacity()) {
            Ok(n) if n > 0 => info!(entries = n, "restored log history"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not restore log history"),
        }

        let store = Arc::new(TaskStore::new(paths.tasks_file()));
        let plans = PlanStore::new(paths.plans_dir());
        let bus = EventBus::new();
        store.add_observer(Arc::new(bus.clone()));
        if let Some(url) = config.webhook.url.as_deref().filter(|u| !u.trim().is_empty()) {
            info!(url, "webhook notifications enabled");
            store.add_observer(Arc::new(WebhookNotifier::new(url)));
        }

        let generator = Arc::new(PlanGenerator::new(
            spawner.clone(),
            plans.clone(),
            log.clone(),
            bus.clone(),
            config.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            spawner,
            store.clone(),
            log.clone(),
            bus.clone(),
            config.clone(),
        ));

        let shutdown = CancellationToken::new();
        let manager = Arc::new(EngineManager::with_root(executor, shutdown.child_token()));

        let guardrail = Arc::new(if config.guardrail.enabled {
            let fetcher = OAuthUsageFetcher::from_config(&config.guardrail, &config.agent);
            Guardrail::new(&config.guardrail, Arc::new(fetcher))
        } else {
            Guardrail::disabled()
        });

        let probe = Arc::new(EngineProbe::new(
            manager.clone(),
            generator.tracker(),
            guardrail.clone(),
        ));
        let labels = Labels {
            version: env!("CARGO_PKG_VERSION").to_string(),
            agent_binary: config.agent.binary.clone(),
            model: config.agent.model.clone(),
        };
        let assembler = Arc::new(SnapshotAssembler::new(
            store.clone(),
            log.clone(),
            probe,
            ProjectScanner::new(config.projects_root()),
            MetricsScanner::new(config.agent.claude_dir()),
            labels,
        ));

        let hub = Hub::new(config.hub.mailbox_capacity);
        let (driver, refresh) = SnapshotDriver::new(assembler.clone(), hub.clone(), bus.clone());
        let driver = driver
            .with_interval(Duration::from_secs(config.hub.refresh_interval_secs))
            .with_coalesce(Duration::from_millis(config.hub.coalesce_ms));

        let ctx = Arc::new(LoopContext {
            store,
            plans,
            generator,
            manager,
            guardrail: guardrail.clone(),
            log: log.clone(),
            bus,
            config: config.clone(),
        });
        let autopilot = Arc::new(Autopilot::new(ctx, assembler, hub, refresh));

        Ok(Self {
            config,
            paths,
            shutdown,
            log,
            guardrail,
            autopilot,
            driver,
        })
    }

    /// Handle that stops the daemon when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn autopilot(&self) -> &Arc<Autopilot> {
        &self.autopilot
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Recover, start background loops and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let report = recovery::recover(&self.autopilot).context("startup recovery failed")?;
        if !report.recovered.is_empty() {
            info!(tasks = ?report.recovered, "interrupted tasks returned to the queue");
        }

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        workers.push(tokio::spawn(self.driver.run(self.shutdown.clone())));
        workers.push(tokio::spawn(self.guardrail.clone().run_poller(
            Duration::from_secs(self.config.guardrail.poll_interval_secs),
            self.shutdown.clone(),
        )));
        workers.push(tokio::spawn(run_retention(
            self.log.clone(),
            self.config.logs.retention_days,
            self.shutdown.clone(),
        )));

        if self.config.server.enabled {
            let surface: Arc<dyn ControlSurface> = self.autopilot.clone();
            let app = ap_bridge::http::router(surface, self.config.server.password.clone());
            let addr = self.config.server.bind_addr();
            let cancel = self.shutdown.clone();
            workers.push(tokio::spawn(async move {
                if let Err(e) = ap_bridge::http::serve(&addr, app, cancel).await {
                    error!(addr = %addr, error = %e, "HTTP server failed");
                }
            }));
        }

        info!(data_dir = %self.paths.root.display(), "autopilot daemon running");
        self.shutdown.cancelled().await;
        info!("shutdown signal received, stopping autopilot");

        self.autopilot.shutdown().await;
        for worker in workers {
            if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
                warn!("background worker did not stop in time");
            }
        }
        info!("autopilot daemon stopped");
        Ok(())
    }
}

/// Prune old log lines at startup and then once a day.
async fn run_retention(log: Arc<LogRing>, days: u32, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let log = log.clone();
                match tokio::task::spawn_blocking(move || log.prune(days)).await {
                    Ok(Ok(stats)) => info!(
                        lines_dropped = stats.lines_dropped,
                        files_removed = stats.files_removed,
                        "log retention pass complete"
                    ),
                    Ok(Err(e)) => warn!(error = %e, "log retention failed"),
                    Err(e) => warn!(error = %e, "log retention task panicked"),
                }
            }
        }
    }
}
