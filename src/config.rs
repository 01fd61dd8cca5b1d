//! Sync configuration, loaded from a YAML file with environment
//! variable overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::ScheduleSettings;

/// Sync configuration.
///
/// Priority: env vars > config file > defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Collection endpoint URL (e.g. "https://sync.example.com/alice/notes")
    pub server_url: Option<String>,
    /// User identity stamped into the auth header
    pub user: Option<String>,
    /// Domain the user identity belongs to
    pub domain: Option<String>,
    /// Steady-state polling interval in seconds
    pub poll_period_secs: Option<u64>,
    /// Shortest interval a server directive can request, in seconds
    pub min_period_secs: Option<u64>,
    /// Longest backed-off interval in seconds
    pub max_period_secs: Option<u64>,
    /// Period increase per generic failure, in seconds
    pub failure_increase_secs: Option<u64>,
    /// Delay before an "immediate" sync, in milliseconds
    pub immediate_update_delay_ms: Option<u64>,
}

impl SyncConfig {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = SyncConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        // Apply environment variable overrides
        if let Ok(url) = std::env::var("BUCKETSYNC_SERVER_URL") {
            config.server_url = Some(url);
        }
        if let Ok(user) = std::env::var("BUCKETSYNC_USER") {
            config.user = Some(user);
        }
        if let Ok(domain) = std::env::var("BUCKETSYNC_DOMAIN") {
            config.domain = Some(domain);
        }

        Ok(config)
    }

    /// Returns true if sync is configured (has server_url, user and domain)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.user.is_some() && self.domain.is_some()
    }

    /// Pacing parameters for the scheduler, falling back to the
    /// defaults for anything unset.
    pub fn schedule_settings(&self) -> ScheduleSettings {
        let defaults = ScheduleSettings::default();
        ScheduleSettings {
            normal_period: self
                .poll_period_secs
                .map_or(defaults.normal_period, Duration::from_secs),
            min_period: self
                .min_period_secs
                .map_or(defaults.min_period, Duration::from_secs),
            max_period: self
                .max_period_secs
                .map_or(defaults.max_period, Duration::from_secs),
            failure_increase: self
                .failure_increase_secs
                .map_or(defaults.failure_increase, Duration::from_secs),
            immediate_update_delay: self
                .immediate_update_delay_ms
                .map_or(defaults.immediate_update_delay, Duration::from_millis),
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/bucketsync/
    /// - macOS: ~/Library/Application Support/bucketsync/
    /// - Windows: %APPDATA%/bucketsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bucketsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = SyncConfig::load(Some(config_path)).unwrap();
        assert!(!config.is_configured());
        let settings = config.schedule_settings();
        assert_eq!(settings.normal_period, Duration::from_secs(300));
        assert_eq!(settings.max_period, Duration::from_secs(3600));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: https://sync.example.com/alice/notes").unwrap();
        writeln!(file, "user: alice@example.com").unwrap();
        writeln!(file, "domain: example.com").unwrap();
        writeln!(file, "poll_period_secs: 60").unwrap();

        let config = SyncConfig::load(Some(config_path)).unwrap();
        assert!(config.is_configured());
        assert_eq!(
            config.server_url.as_deref(),
            Some("https://sync.example.com/alice/notes")
        );
        assert_eq!(
            config.schedule_settings().normal_period,
            Duration::from_secs(60)
        );
        // Unset knobs keep their defaults
        assert_eq!(
            config.schedule_settings().min_period,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_partial_file_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: https://sync.example.com/alice/notes").unwrap();

        let config = SyncConfig::load(Some(config_path)).unwrap();
        assert!(!config.is_configured());
        assert_eq!(config.user, None);
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: [unclosed").unwrap();

        let result = SyncConfig::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
