// Configuration management for the meshbeacon CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshbeacon/config.json
// - Linux: ~/.config/meshbeacon/config.json
// - Windows: %APPDATA%\meshbeacon\config.json

use anyhow::{Context, Result};
use meshbeacon_core::bridge::{BridgeConfig, DuplicatePolicy};
use meshbeacon_core::notify::NotifierConfig;
use meshbeacon_core::relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the beacon endpoint is served on
    pub http_port: u16,

    /// Path the beacon list is mounted on
    pub beacon_path: String,

    /// Lifetime of every issued beacon
    pub expiration_ms: u64,

    /// Storage path for the store and identity
    pub storage_path: Option<String>,

    /// Notifier settings
    pub notifier: NotifierSettings,

    /// Bridge settings
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Change batching window in milliseconds
    pub debounce_ms: u64,

    /// First retry delay after a change feed failure
    pub initial_backoff_ms: u64,

    /// Retry delay cap
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Seconds a bridged port waits for its local client
    pub accept_timeout: u64,

    /// "reuse" or "reject" when a bridged peer connects again
    pub duplicate_policy: String,

    /// Maximum simultaneously bridged peers
    pub max_connections: usize,

    /// Relay copy buffer in bytes
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            beacon_path: meshbeacon_core::DEFAULT_BEACON_PATH.to_string(),
            expiration_ms: 15 * 60 * 1000,
            storage_path: None,
            notifier: NotifierSettings::default(),
            bridge: BridgeSettings::default(),
        }
    }
}

impl Default for NotifierSettings {
    fn default() -> Self {
        let defaults = NotifierConfig::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let defaults = BridgeConfig::default();
        Self {
            accept_timeout: defaults.accept_timeout.as_secs(),
            duplicate_policy: "reuse".to_string(),
            max_connections: defaults.max_connections,
            buffer_size: defaults.relay.buffer_size,
        }
    }
}

fn parse_policy(value: &str) -> Result<DuplicatePolicy> {
    match value {
        "reuse" => Ok(DuplicatePolicy::ReuseExisting),
        "reject" => Ok(DuplicatePolicy::RejectDuplicate),
        other => anyhow::bail!("Invalid duplicate policy '{}': expected reuse or reject", other),
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshbeacon");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshbeacon");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the store and key live: `storage_path` if set, else the data dir
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => {
                std::fs::create_dir_all(path).context("Failed to create storage directory")?;
                Ok(PathBuf::from(path))
            }
            None => Self::data_dir(),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller saves.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "http_port" => {
                self.http_port = value.parse().context("Invalid port number")?;
            }
            "beacon_path" => {
                anyhow::ensure!(value.starts_with('/'), "beacon_path must start with '/'");
                self.beacon_path = value.to_string();
            }
            "expiration_ms" => {
                let ms: u64 = value.parse().context("Invalid number")?;
                anyhow::ensure!(ms > 0, "expiration_ms must be positive");
                self.expiration_ms = ms;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "debounce_ms" => {
                self.notifier.debounce_ms = value.parse().context("Invalid number")?;
            }
            "initial_backoff_ms" => {
                self.notifier.initial_backoff_ms = value.parse().context("Invalid number")?;
            }
            "max_backoff_ms" => {
                self.notifier.max_backoff_ms = value.parse().context("Invalid number")?;
            }
            "accept_timeout" => {
                self.bridge.accept_timeout = value.parse().context("Invalid number")?;
            }
            "duplicate_policy" => {
                parse_policy(value)?;
                self.bridge.duplicate_policy = value.to_string();
            }
            "max_connections" => {
                self.bridge.max_connections = value.parse().context("Invalid number")?;
            }
            "buffer_size" => {
                self.bridge.buffer_size = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "http_port" => Some(self.http_port.to_string()),
            "beacon_path" => Some(self.beacon_path.clone()),
            "expiration_ms" => Some(self.expiration_ms.to_string()),
            "storage_path" => self.storage_path.clone(),
            "debounce_ms" => Some(self.notifier.debounce_ms.to_string()),
            "initial_backoff_ms" => Some(self.notifier.initial_backoff_ms.to_string()),
            "max_backoff_ms" => Some(self.notifier.max_backoff_ms.to_string()),
            "accept_timeout" => Some(self.bridge.accept_timeout.to_string()),
            "duplicate_policy" => Some(self.bridge.duplicate_policy.clone()),
            "max_connections" => Some(self.bridge.max_connections.to_string()),
            "buffer_size" => Some(self.bridge.buffer_size.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("http_port".to_string(), self.http_port.to_string()),
            ("beacon_path".to_string(), self.beacon_path.clone()),
            ("expiration_ms".to_string(), self.expiration_ms.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("debounce_ms".to_string(), self.notifier.debounce_ms.to_string()),
            ("initial_backoff_ms".to_string(), self.notifier.initial_backoff_ms.to_string()),
            ("max_backoff_ms".to_string(), self.notifier.max_backoff_ms.to_string()),
            ("accept_timeout".to_string(), format!("{}s", self.bridge.accept_timeout)),
            ("duplicate_policy".to_string(), self.bridge.duplicate_policy.clone()),
            ("max_connections".to_string(), self.bridge.max_connections.to_string()),
            ("buffer_size".to_string(), self.bridge.buffer_size.to_string()),
        ]
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig::default()
            .with_debounce(Duration::from_millis(self.notifier.debounce_ms))
            .with_backoff(
                Duration::from_millis(self.notifier.initial_backoff_ms),
                Duration::from_millis(self.notifier.max_backoff_ms),
            )
    }

    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        Ok(BridgeConfig::default()
            .with_accept_timeout(Duration::from_secs(self.bridge.accept_timeout))
            .with_duplicate_policy(parse_policy(&self.bridge.duplicate_policy)?)
            .with_max_connections(self.bridge.max_connections)
            .with_relay(RelayConfig::default().with_buffer_size(self.bridge.buffer_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.beacon_path, "/NotificationBeacons");
        assert!(config.notifier_config().validate().is_ok());
        assert!(config.bridge_config().unwrap().validate().is_ok());
    }

    #[test]
    fn test_set_validates_values() {
        let mut config = Config::default();
        config.set("duplicate_policy", "reject").unwrap();
        assert_eq!(
            config.bridge_config().unwrap().duplicate_policy,
            DuplicatePolicy::RejectDuplicate
        );
        assert!(config.set("duplicate_policy", "sometimes").is_err());
        assert!(config.set("expiration_ms", "0").is_err());
        assert!(config.set("beacon_path", "beacons").is_err());
        assert!(config.set("nope", "1").is_err());
        assert_eq!(config.get("duplicate_policy"), Some("reject".to_string()));
    }

    #[test]
    fn test_load_creates_default_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        config.set("http_port", "9090").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.http_port, 9090);
    }
}
