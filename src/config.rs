use crate::error::UsageError;
use crate::models::ProviderId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seconds between scheduled refreshes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Seconds allowed for one provider pipeline
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_true")]
    pub show_notifications: bool,
    #[serde(default = "default_enabled_providers")]
    pub enabled_providers: Vec<ProviderId>,
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_enabled_providers() -> Vec<ProviderId> {
    ProviderId::ALL.to_vec()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            fetch_timeout: default_fetch_timeout(),
            show_notifications: true,
            enabled_providers: default_enabled_providers(),
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("usagebar")
            .join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Enabled providers in configuration order, duplicates dropped.
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ordered = Vec::new();
        for provider in &self.general.enabled_providers {
            if !ordered.contains(provider) {
                ordered.push(*provider);
            }
        }
        ordered
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.general.refresh_interval)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.general.fetch_timeout.max(1))
    }

    pub fn validate(&self) -> Result<(), UsageError> {
        if self.providers().is_empty() {
            return Err(UsageError::Configuration(
                "no providers enabled; set general.enabled_providers".to_string(),
            ));
        }
        if self.general.refresh_interval < MIN_REFRESH_INTERVAL_SECS {
            return Err(UsageError::Configuration(format!(
                "refresh_interval must be at least {} seconds",
                MIN_REFRESH_INTERVAL_SECS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.refresh_interval, 60);
        assert_eq!(config.providers(), vec![ProviderId::Claude, ProviderId::Codex]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            r#"
            [general]
            enabled_providers = ["codex", "claude", "codex"]
            show_notifications = false
            "#,
        )
        .unwrap();
        assert_eq!(config.general.refresh_interval, 60);
        assert!(!config.general.show_notifications);
        assert_eq!(config.providers(), vec![ProviderId::Codex, ProviderId::Claude]);
    }

    #[test]
    fn test_no_providers_is_configuration_error() {
        let config = Config::parse("[general]\nenabled_providers = []\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tiny_interval_rejected() {
        let config = Config::parse("[general]\nrefresh_interval = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(UsageError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_provider_fails_to_parse() {
        assert!(Config::parse("[general]\nenabled_providers = [\"gemini\"]\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.general.enabled_providers = vec![ProviderId::Codex];
        config.save(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
