use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable naming the YAML settings file.
pub const CONFIG_PATH_VAR: &str = "CURB_BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

const DEFAULT_LOCATIONS_URL: &str = "https://app.energycurb.com/api/v3/locations";
const DEFAULT_LIVE_DATA_URL: &str = "https://app.energycurb.com/api/circuit-data";

/// Static settings, loaded once at startup and read-only afterwards.
#[derive(Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub audience: String,

    pub mqtt_broker_url: String,
    pub mqtt_topic: String,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_locations_url")]
    pub locations_url: Url,
    #[serde(default = "default_live_data_url")]
    pub live_data_url: Url,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_token_refresh_secs")]
    pub token_refresh_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parsing error: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Setting {0} is missing or invalid.")]
    MissingOrInvalid(String),
}

fn default_locations_url() -> Url {
    Url::parse(DEFAULT_LOCATIONS_URL).expect("static URL is valid")
}

fn default_live_data_url() -> Url {
    Url::parse(DEFAULT_LIVE_DATA_URL).expect("static URL is valid")
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_token_refresh_secs() -> u64 {
    12 * 60 * 60
}

impl Config {
    /// Load the settings file named by `CURB_BRIDGE_CONFIG` (or `config.yaml`).
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();

        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Blank optional credentials count as absent.
    fn normalize(&mut self) {
        let blank = |value: &Option<String>| value.as_deref().is_some_and(|v| v.trim().is_empty());
        if blank(&self.mqtt_username) {
            self.mqtt_username = None;
        }
        if blank(&self.mqtt_password) {
            self.mqtt_password = None;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("TOKEN_URL", &self.token_url),
            ("LOCATIONS_URL", &self.locations_url),
            ("LIVE_DATA_URL", &self.live_data_url),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::MissingOrInvalid(format!(
                    "{name} (expected an http(s) URL, got '{url}')"
                )));
            }
        }

        if self.mqtt_topic.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_TOPIC".to_string()));
        }
        if self.mqtt_broker_url.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_BROKER_URL".to_string()));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(ConfigError::MissingOrInvalid(
                "RECONNECT_DELAY_SECS (must be at least 1)".to_string(),
            ));
        }
        if self.token_refresh_secs == 0 {
            return Err(ConfigError::MissingOrInvalid(
                "TOKEN_REFRESH_SECS (must be at least 1)".to_string(),
            ));
        }

        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("mqtt_broker_url", &self.mqtt_broker_url)
            .field("mqtt_topic", &self.mqtt_topic)
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &self.mqtt_password.as_ref().map(|_| "[REDACTED]"))
            .field("debug", &self.debug)
            .field("locations_url", &self.locations_url.as_str())
            .field("live_data_url", &self.live_data_url.as_str())
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("token_refresh_secs", &self.token_refresh_secs)
            .finish()
    }
}
