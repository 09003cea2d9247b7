use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;

use super::{AppConfig, TranscoderConfig};

/// Configuration validator for ensuring configuration integrity
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        Self::validate_server_config(config)?;
        Self::validate_output_config(config)?;
        Self::validate_transcoder_config(&config.transcoder)?;
        Self::validate_moderation_config(config)?;
        Ok(())
    }

    fn validate_server_config(config: &AppConfig) -> Result<()> {
        config
            .listen_address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", config.listen_address))?;

        if let Some(playlist) = &config.playlist_path {
            if playlist.trim().is_empty() {
                return Err(anyhow!("Playlist path cannot be empty when set"));
            }
        }

        Ok(())
    }

    /// Validate where the encoder writes its HLS output
    fn validate_output_config(config: &AppConfig) -> Result<()> {
        if config.hls_playlist_path.trim().is_empty() {
            return Err(anyhow!("HLS playlist path cannot be empty"));
        }

        if config.segment_dir.trim().is_empty() {
            return Err(anyhow!("Segment directory cannot be empty"));
        }

        Ok(())
    }

    fn validate_transcoder_config(transcoder: &TranscoderConfig) -> Result<()> {
        if transcoder.program.trim().is_empty() {
            return Err(anyhow!("Transcoder program cannot be empty"));
        }

        if transcoder.segment_max_age_secs == 0 {
            return Err(anyhow!("Segment max age must be greater than 0 seconds"));
        }

        if transcoder.sweep_interval_secs == 0 {
            return Err(anyhow!("Sweep interval must be greater than 0 seconds"));
        }

        if transcoder.stop_timeout_secs == Some(0) {
            return Err(anyhow!("Stop timeout must be greater than 0 seconds, or unset to wait forever"));
        }

        Ok(())
    }

    fn validate_moderation_config(config: &AppConfig) -> Result<()> {
        if config.master.trim().is_empty() {
            return Err(anyhow!("Master cannot be empty, use \"*\" to disable permission checks"));
        }

        if config.mods.iter().any(|m| m.trim().is_empty()) {
            return Err(anyhow!("Mod list contains an empty id"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = AppConfig::default();
        config.listen_address = "localhost".to_string();
        assert!(ConfigValidator::validate(&config).is_err());

        config.listen_address = "[::]:8080".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_empty_paths_rejected() {
        let mut config = AppConfig::default();
        config.hls_playlist_path = "  ".to_string();
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.segment_dir = String::new();
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.playlist_path = Some(String::new());
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_transcoder_limits() {
        let mut config = AppConfig::default();
        config.transcoder.sweep_interval_secs = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.transcoder.segment_max_age_secs = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.transcoder.stop_timeout_secs = Some(0);
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.transcoder.program = String::new();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_empty_master_rejected() {
        let mut config = AppConfig::default();
        config.master = String::new();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Master cannot be empty"));
    }
}
