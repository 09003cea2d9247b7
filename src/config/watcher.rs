use anyhow::{Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{ConfigChangeEvent, ConfigManager};

/// How often the config file is polled for changes
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hot reload of the config file through a polling `notify` watcher
pub struct ConfigWatcher {
    config_manager: Arc<ConfigManager>,
    interval: Duration,
}

impl ConfigWatcher {
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self::with_interval(config_manager, POLL_INTERVAL)
    }

    pub fn with_interval(config_manager: Arc<ConfigManager>, interval: Duration) -> Self {
        Self {
            config_manager,
            interval,
        }
    }

    /// Start polling; the watcher stops when the returned handle is dropped
    fn setup_file_watcher(&self) -> Result<(PollWatcher, mpsc::Receiver<Event>)> {
        let (tx, rx) = mpsc::channel(100);

        let config = notify::Config::default().with_poll_interval(self.interval);
        let mut watcher = PollWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = tx.try_send(event);
                }
            },
            config,
        )
        .context("Failed to create config file watcher")?;

        let path = self.config_manager.get_config_path();
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", path.display()))?;

        Ok((watcher, rx))
    }

    /// Reload on every change; invalid files are logged and the previous configuration kept
    pub async fn run(self) {
        let path = self.config_manager.get_config_path().to_path_buf();
        let (_watcher, mut events) = match self.setup_file_watcher() {
            Ok(setup) => setup,
            Err(e) => {
                warn!("Configuration hot reload disabled: {:#}", e);
                return;
            }
        };
        info!("Watching {} for configuration changes", path.display());

        while let Some(event) = events.recv().await {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }

            match self.config_manager.reload().await {
                Ok(true) => info!("Configuration reloaded from {}", path.display()),
                Ok(false) => debug!("Configuration file touched without changes"),
                Err(e) => warn!("Invalid configuration file, ignoring changes: {:#}", e),
            }
        }
    }
}

/// Log configuration changes that need operator attention
pub async fn log_config_changes(mut receiver: broadcast::Receiver<ConfigChangeEvent>) {
    loop {
        match receiver.recv().await {
            Ok(ConfigChangeEvent::Reloaded(config)) => {
                debug!(
                    "Now {} mods, {} banned ids, {} banned ips",
                    config.mods.len(),
                    config.bans.len(),
                    config.ip_bans.len()
                );
            }
            Ok(ConfigChangeEvent::ListenAddressChanged { old, new }) => {
                warn!(
                    "Listen address changed from {} to {} - restart required for this change to take effect",
                    old, new
                );
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
