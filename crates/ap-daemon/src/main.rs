//! autopilot daemon: restores state, runs project loops and serves the
//! control API until ctrl-c.

use anyhow::{Context, Result};
use ap_core::config::Config;
use ap_daemon::daemon::Daemon;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit path must load; the default location falls back to defaults.
    let (config, load_error) = match std::env::args().nth(1) {
        Some(path) => (
            Config::load_from(&path).with_context(|| format!("failed to load config from {path}"))?,
            None,
        ),
        None => match Config::load() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    ap_daemon::logging::init_logging("ap-daemon", &config.general);
    if let Some(e) = load_error {
        warn!(error = %e, "failed to load config, using defaults");
    }
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "autopilot daemon starting");

    let daemon = Daemon::new(config).context("failed to initialise daemon")?;
    if daemon.config().server.enabled {
        info!("API server: http://{}", daemon.config().server.bind_addr());
    }

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.cancel();
    });

    daemon.run().await
}
