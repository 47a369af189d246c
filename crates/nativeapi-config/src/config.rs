//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Length of a decoded API encryption key.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Top-level device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity reported to clients.
    pub device: DeviceConfig,
    /// Native API listener settings.
    pub api: ApiConfig,
    /// Logging settings.
    pub logger: LoggerConfig,
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hostname-style device name, also the Noise server hello name.
    pub name: String,
    /// Human-readable name. Empty means "same as name".
    pub friendly_name: String,
    /// MAC address as `AA:BB:CC:DD:EE:FF`.
    pub mac_address: String,
    /// Board model.
    pub model: String,
    /// Board manufacturer.
    pub manufacturer: String,
    /// Area hint for the client UI.
    pub suggested_area: String,
    /// Optional project name, `author.project`.
    pub project_name: String,
    /// Optional project version.
    pub project_version: String,
}

/// Native API listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the listener to.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
    /// Connection password. Empty disables password checking.
    pub password: String,
    /// Base64 pre-shared key. When set, clients must use the encrypted protocol.
    pub encryption_key: Option<String>,
    /// Idle time before the server pings a client, in milliseconds.
    pub keepalive_ms: u32,
    /// Maximum simultaneous clients.
    pub max_connections: usize,
    /// Main loop period in milliseconds.
    pub loop_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Filter directive, RUST_LOG syntax (e.g. "info,nativeapi_net=debug").
    pub level: String,
    /// Also write JSON logs to a file next to the config.
    pub json_file: bool,
    /// Forward log lines to API clients that subscribed to logs.
    pub forward_to_clients: bool,
    /// Lines buffered for forwarding between two main loop ticks.
    pub tap_capacity: usize,
}

// --- Default implementations ---

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "nativeapi-device".to_string(),
            friendly_name: String::new(),
            mac_address: "00:00:00:00:00:00".to_string(),
            model: "host".to_string(),
            manufacturer: "Host".to_string(),
            suggested_area: String::new(),
            project_name: String::new(),
            project_version: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 6053,
            password: String::new(),
            encryption_key: None,
            keepalive_ms: 60_000,
            max_connections: 8,
            loop_interval_ms: 16,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            forward_to_clients: true,
            tap_capacity: 256,
        }
    }
}

// --- Encryption key ---

impl ApiConfig {
    /// Decode `encryption_key`. `Ok(None)` when no key is configured.
    pub fn decode_psk(&self) -> Result<Option<[u8; ENCRYPTION_KEY_LEN]>, ConfigError> {
        let Some(encoded) = self.encryption_key.as_deref() else {
            return Ok(None);
        };
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Ok(None);
        }
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ConfigError::InvalidEncryptionKey(e.to_string()))?;
        let psk: [u8; ENCRYPTION_KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ConfigError::InvalidEncryptionKey(format!(
                "expected {ENCRYPTION_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Some(psk))
    }

    /// Store `psk` as the base64 `encryption_key`.
    pub fn set_psk(&mut self, psk: &[u8; ENCRYPTION_KEY_LEN]) {
        self.encryption_key = Some(BASE64.encode(psk));
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Friendly name, falling back to the device name.
    pub fn friendly_name(&self) -> &str {
        if self.device.friendly_name.is_empty() {
            &self.device.name
        } else {
            &self.device.friendly_name
        }
    }
}
