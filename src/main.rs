use anyhow::Context;
use clap::Parser;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use cinesync::{
    config::{
        watcher::{log_config_changes, ConfigWatcher},
        Args, ConfigManager,
    },
    logging,
    playlist::load_playlist_file,
    state::AppState,
    transcoder::{sweeper::run_segment_sweeper, FfmpegEncoder},
    web,
};

/// How long shutdown waits for the encoder to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started = Instant::now();
    let args = Args::parse();

    logging::init_logging_with_options(args.log_level.as_deref(), args.debug)?;

    let config_path = args.config_path();
    let config_manager = Arc::new(
        ConfigManager::open(&config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?,
    );

    let mut config = config_manager.get_config().await;
    args.apply_overrides(&mut config);
    logging::log_startup_info(&config, &config_path);

    let segment_dir = PathBuf::from(&config.segment_dir);
    tokio::fs::create_dir_all(&segment_dir)
        .await
        .with_context(|| format!("Failed to create segment directory: {}", segment_dir.display()))?;
    let hls_playlist = PathBuf::from(&config.hls_playlist_path);
    if let Some(parent) = hls_playlist.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create HLS output directory: {}", parent.display()))?;
    }

    let encoder = Arc::new(
        FfmpegEncoder::new(config.transcoder.program.clone(), hls_playlist)
            .with_stop_timeout(config.transcoder.stop_timeout()),
    );

    let (app_state, changes) = AppState::build(config_manager.clone(), encoder, args.playlist.clone(), segment_dir.clone());
    tokio::spawn(app_state.broadcaster.clone().run(changes));

    if let Some(path) = app_state.playlist_path().await {
        let items = load_playlist_file(&path).context("Failed to load startup playlist")?;
        app_state.engine.replace_items(items).await;
    }

    tokio::spawn(ConfigWatcher::new(config_manager.clone()).run());
    tokio::spawn(log_config_changes(config_manager.subscribe_to_changes()));
    tokio::spawn(run_segment_sweeper(
        segment_dir,
        config.transcoder.segment_max_age(),
        config.transcoder.sweep_interval(),
    ));

    let app = web::create_router(app_state.clone());
    let addr = config.listen_socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Stopping playback");
    let graceful = app_state.engine.shutdown(SHUTDOWN_GRACE).await;
    if !graceful {
        warn!("Encoder did not stop within {:?}", SHUTDOWN_GRACE);
    }

    logging::log_shutdown_info(graceful, started.elapsed());
    Ok(())
}
