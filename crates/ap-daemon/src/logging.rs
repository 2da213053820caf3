use ap_core::config::GeneralConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive from config: `RUST_LOG` wins, then the configured level,
/// raised to `debug` when the debug flag is on.
pub fn filter_for(general: &GeneralConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if general.debug { "debug" } else { general.log_level.as_str() };
        EnvFilter::new(level)
    })
}

/// Initialize the process-wide subscriber. Later calls are no-ops.
pub fn init_logging(service_name: &str, general: &GeneralConfig) {
    let filter = filter_for(general);
    if general.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
        tracing::info!(service = service_name, "logging initialised (json)");
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .try_init()
            .ok();
        tracing::info!(service = service_name, "logging initialised (human-readable)");
    }
}
