use anyhow::{anyhow, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;

/// Initialize logging; RUST_LOG wins over `log_level`
pub fn init_logging_with_options(log_level: Option<&str>, debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let level = log_level.unwrap_or(default_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("Invalid log level '{}': {}", level, e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    info!("Logging initialized with level: {}", level);
    Ok(())
}

/// Log the startup banner
pub fn log_startup_info(config: &AppConfig, config_path: &Path) {
    info!("=== Cinesync v{} Starting ===", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", config_path.display());
    info!("Listen address: {}", config.listen_address);
    info!("HLS playlist: {}", config.hls_playlist_path);
    info!("Segment directory: {}", config.segment_dir);
    match &config.playlist_path {
        Some(path) => info!("Startup playlist: {}", path),
        None => info!("No startup playlist configured"),
    }
    info!("Transcoder: {}", config.transcoder.program);
    match config.transcoder.stop_timeout() {
        Some(timeout) => info!("Encoder is killed {:?} after an ignored interrupt", timeout),
        None => info!("Encoder stop waits for the process to exit"),
    }
    if config.is_open() {
        warn!("Master is \"*\": every viewer has full control");
    }

    info!("CPU cores: {}", num_cpus::get());
    info!("Process ID: {}", std::process::id());
}

/// Log shutdown information
pub fn log_shutdown_info(graceful: bool, uptime: Duration) {
    info!("=== Cinesync Shutting Down ===");

    let shutdown_type = if graceful { "Graceful" } else { "Forced" };
    info!("Shutdown type: {}", shutdown_type);

    let uptime_seconds = uptime.as_secs();
    let uptime_hours = uptime_seconds / 3600;
    let uptime_minutes = (uptime_seconds % 3600) / 60;
    info!("Total uptime: {}h {}m", uptime_hours, uptime_minutes);

    if !graceful {
        warn!("Forced shutdown - the encoder may still be running");
    }

    info!("=== Shutdown Complete ===");
}
