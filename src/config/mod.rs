use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, RwLock};

pub mod validation;
pub mod watcher;

use validation::ConfigValidator;

/// Master id that disables every permission check
pub const OPEN_MASTER: &str = "*";

const CONFIG_DIR_NAME: &str = "cinesync";
const CONFIG_FILE_NAME: &str = "config.json";

fn default_master() -> String {
    OPEN_MASTER.to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_hls_playlist_path() -> String {
    "hls/stream.m3u8".to_string()
}

fn default_segment_dir() -> String {
    "hls".to_string()
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_segment_max_age_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    10
}

/// Main application configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity of the room owner, `"*"` grants everyone master rights
    #[serde(default = "default_master")]
    pub master: String,
    #[serde(default)]
    pub mods: Vec<String>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Plain-text playlist loaded at startup and on reload requests
    #[serde(default)]
    pub playlist_path: Option<String>,
    #[serde(default = "default_hls_playlist_path")]
    pub hls_playlist_path: String,
    #[serde(default = "default_segment_dir")]
    pub segment_dir: String,
    #[serde(default)]
    pub bans: Vec<String>,
    #[serde(default)]
    pub ip_bans: Vec<String>,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
}

/// External encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Kill the encoder if it ignores an interrupt for this long. Unset waits forever.
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
    #[serde(default = "default_segment_max_age_secs")]
    pub segment_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            stop_timeout_secs: None,
            segment_max_age_secs: default_segment_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl TranscoderConfig {
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }

    pub fn segment_max_age(&self) -> Duration {
        Duration::from_secs(self.segment_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            mods: Vec::new(),
            listen_address: default_listen_address(),
            playlist_path: None,
            hls_playlist_path: default_hls_playlist_path(),
            segment_dir: default_segment_dir(),
            bans: Vec::new(),
            ip_bans: Vec::new(),
            transcoder: TranscoderConfig::default(),
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Synchronized group video watching server", long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Plain-text playlist to load at startup, one media path per line
    #[arg(short, long)]
    pub playlist: Option<String>,

    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// Configuration file location, falling back to the platform config directory
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_config_path)
    }

    /// Apply command line overrides on top of the loaded file
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(playlist) = &self.playlist {
            config.playlist_path = Some(playlist.clone());
        }
        if let Some(listen) = &self.listen {
            config.listen_address = listen.clone();
        }
    }
}

impl AppConfig {
    /// `<config dir>/cinesync/config.json`, or `./config.json` without a config dir
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
            None => PathBuf::from(CONFIG_FILE_NAME),
        }
    }

    /// Load configuration from file or create with defaults
    pub fn load_or_create<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        if config_path.exists() {
            Self::load_from_file(config_path)
        } else {
            let default_config = Self::default();
            default_config
                .save_to_file(config_path)
                .with_context(|| format!("Failed to create default configuration file at: {}", config_path.display()))?;

            tracing::info!("Created default configuration file at: {}", config_path.display());
            Ok(default_config)
        }
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let content = std::fs::read_to_string(config_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", config_path.as_ref().display()))?;

        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.as_ref().display()))?;

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, config_path: P) -> Result<()> {
        let config_path = config_path.as_ref();

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_address))
    }

    pub fn is_open(&self) -> bool {
        self.master == OPEN_MASTER
    }
}

/// Configuration change event
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    /// Configuration file was modified and reloaded
    Reloaded(AppConfig),
    /// Takes effect on the next start only
    ListenAddressChanged { old: String, new: String },
}

/// Owns the live configuration and its file
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(config: AppConfig, config_path: P) -> Self {
        let (change_sender, _) = broadcast::channel(100);
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.as_ref().to_path_buf(),
            change_sender,
        }
    }

    /// Load (or create) the file and manage it
    pub fn open<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config = AppConfig::load_or_create(config_path.as_ref())?;
        Ok(Self::new(config, config_path))
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Re-read the file; returns false when nothing changed
    pub async fn reload(&self) -> Result<bool> {
        let new_config = AppConfig::load_from_file(&self.config_path)?;

        let old_config = {
            let mut config_guard = self.config.write().await;
            if *config_guard == new_config {
                return Ok(false);
            }
            std::mem::replace(&mut *config_guard, new_config.clone())
        };

        Self::send_change_notifications(&self.change_sender, &old_config, &new_config);
        Ok(true)
    }

    fn send_change_notifications(
        sender: &broadcast::Sender<ConfigChangeEvent>,
        old_config: &AppConfig,
        new_config: &AppConfig,
    ) {
        let _ = sender.send(ConfigChangeEvent::Reloaded(new_config.clone()));

        if old_config.listen_address != new_config.listen_address {
            let _ = sender.send(ConfigChangeEvent::ListenAddressChanged {
                old: old_config.listen_address.clone(),
                new: new_config.listen_address.clone(),
            });
        }
    }

    pub fn get_config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Shared handle to the live configuration
    pub fn get_config_arc(&self) -> Arc<RwLock<AppConfig>> {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.master, "*");
        assert!(config.is_open());
        assert_eq!(config.transcoder.program, "ffmpeg");
        assert_eq!(config.transcoder.segment_max_age(), Duration::from_secs(60));
        assert!(config.transcoder.stop_timeout().is_none());

        let reloaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"master": "owner-key", "mods": ["m1"], "transcoder": {"stop_timeout_secs": 5}}"#)
            .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.master, "owner-key");
        assert!(!config.is_open());
        assert_eq!(config.mods, vec!["m1".to_string()]);
        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(config.transcoder.stop_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.transcoder.sweep_interval_secs, 10);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, "{not json").unwrap();
        assert!(AppConfig::load_from_file(&path).is_err());

        std::fs::write(&path, r#"{"listen_address": "nowhere"}"#).unwrap();
        assert!(AppConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_args_override_file_values() {
        let args = Args::parse_from(["cinesync", "--playlist", "list.txt", "--listen", "127.0.0.1:9000"]);
        let mut config = AppConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.playlist_path.as_deref(), Some("list.txt"));
        assert_eq!(config.listen_address, "127.0.0.1:9000");
        assert_eq!(config.listen_socket_addr().unwrap().port(), 9000);
    }

    #[tokio::test]
    async fn test_reload_reports_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::open(&path).unwrap();
        let mut changes = manager.subscribe_to_changes();

        assert!(!manager.reload().await.unwrap());

        let mut edited = manager.get_config().await;
        edited.listen_address = "127.0.0.1:9999".to_string();
        edited.save_to_file(&path).unwrap();

        assert!(manager.reload().await.unwrap());
        assert!(matches!(changes.recv().await.unwrap(), ConfigChangeEvent::Reloaded(_)));
        match changes.recv().await.unwrap() {
            ConfigChangeEvent::ListenAddressChanged { old, new } => {
                assert_eq!(old, "0.0.0.0:8080");
                assert_eq!(new, "127.0.0.1:9999");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
