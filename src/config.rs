//! Configuration system for the smart light service
//!
//! Loaded from a TOML file. Every section has defaults so a minimal (or empty)
//! file is valid; secrets are never stored in the file, only the names of the
//! environment variables that hold them.

use crate::protocol::topics::validate_topic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main service configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LightConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub history: HistorySection,
}

/// MQTT broker connection and topic layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Client identifier prefix; a per-connection suffix is appended
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Topic commands are published on (server -> device)
    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    /// Topic telemetry arrives on (device -> server)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnection delays in milliseconds, applied in order
    #[serde(default = "default_backoff_pattern")]
    pub reconnect_backoff_ms: Vec<u64>,
    /// Delay used once the backoff pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub reconnect_sustained_delay_ms: u64,
    /// Maximum reconnection attempts (0 = unlimited)
    #[serde(default)]
    pub reconnect_max_attempts: u32,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            command_topic: default_command_topic(),
            status_topic: default_status_topic(),
            keep_alive_secs: default_keep_alive(),
            reconnect_backoff_ms: default_backoff_pattern(),
            reconnect_sustained_delay_ms: default_sustained_delay(),
            reconnect_max_attempts: 0,
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "smartlight-server".to_string()
}

fn default_command_topic() -> String {
    "iot/light/command".to_string()
}

fn default_status_topic() -> String {
    "iot/light/status".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_sustained_delay() -> u64 {
    5000
}

/// HTTP listener section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

/// Persistence backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSection {
    /// `sqlite://path.db`, `sqlite::memory:` or `memory` for the in-process store
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSection {
    /// Whether the in-process store was requested instead of SQLite
    pub fn is_in_memory_store(&self) -> bool {
        self.url.eq_ignore_ascii_case("memory")
    }
}

fn default_database_url() -> String {
    "sqlite://smartlight.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Bearer token authentication section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<AuthUser>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            users: Vec::new(),
        }
    }
}

fn default_auth_enabled() -> bool {
    true
}

/// A caller allowed to use the device API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    pub username: String,
    /// Environment variable holding this user's bearer token
    pub token_env: String,
}

/// History query defaults and limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySection {
    #[serde(default = "default_history_hours")]
    pub default_hours: u32,
    #[serde(default = "default_history_limit")]
    pub default_limit: u32,
    #[serde(default = "default_history_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_keep_hours")]
    pub default_keep_hours: u32,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            default_hours: default_history_hours(),
            default_limit: default_history_limit(),
            max_limit: default_history_max_limit(),
            default_keep_hours: default_keep_hours(),
        }
    }
}

fn default_history_hours() -> u32 {
    24
}

fn default_history_limit() -> u32 {
    100
}

fn default_history_max_limit() -> u32 {
    1000
}

fn default_keep_hours() -> u32 {
    168 // one week
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LightConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LightConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.mqtt.broker_url)?;

        validate_topic(&self.mqtt.command_topic)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.command_topic: {e}")))?;
        validate_topic(&self.mqtt.status_topic)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.status_topic: {e}")))?;
        if self.mqtt.command_topic == self.mqtt.status_topic {
            return Err(ConfigError::InvalidConfig(
                "mqtt.command_topic and mqtt.status_topic must differ".to_string(),
            ));
        }

        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }

        if self.http.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "http.port must be non-zero".to_string(),
            ));
        }

        if self.history.default_limit == 0 || self.history.default_limit > self.history.max_limit
        {
            return Err(ConfigError::InvalidConfig(format!(
                "history.default_limit must be within 1..={}",
                self.history.max_limit
            )));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Resolve every configured API token to `(username, token)` pairs
    pub fn resolve_api_tokens(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.auth
            .users
            .iter()
            .map(|user| {
                Self::get_env_var_required(&user.token_env)
                    .map(|token| (user.username.clone(), token))
            })
            .collect()
    }
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.broker_url '{broker_url}': {e}")))?;

    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url scheme '{other}' is not supported"
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url '{broker_url}' has no host"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = LightConfig::from_toml_str("").unwrap();
        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.command_topic, "iot/light/command");
        assert_eq!(config.mqtt.status_topic, "iot/light/status");
        assert_eq!(config.http.port, 8000);
        assert_eq!(config.database.url, "sqlite://smartlight.db");
        assert!(config.auth.enabled);
        assert_eq!(config.history.default_hours, 24);
        assert_eq!(config.history.default_keep_hours, 168);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtts://broker.example.com"
client_id = "lamp-backend"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
command_topic = "home/lamp/cmd"
status_topic = "home/lamp/state"
reconnect_backoff_ms = [100, 200]
reconnect_sustained_delay_ms = 1000
reconnect_max_attempts = 10

[http]
bind_address = "127.0.0.1"
port = 9000

[database]
url = "memory"

[auth]
enabled = true

[[auth.users]]
username = "admin"
token_env = "SMARTLIGHT_ADMIN_TOKEN"

[history]
default_limit = 50
max_limit = 500
"#;

        let config = LightConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.client_id, "lamp-backend");
        assert_eq!(config.mqtt.reconnect_backoff_ms, vec![100, 200]);
        assert_eq!(config.mqtt.reconnect_max_attempts, 10);
        assert_eq!(config.http.port, 9000);
        assert!(config.database.is_in_memory_store());
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].username, "admin");
        assert_eq!(config.history.default_limit, 50);
        assert_eq!(config.history.max_limit, 500);
    }

    #[test]
    fn test_same_topics_rejected() {
        let toml_content = r#"
[mqtt]
command_topic = "iot/light"
status_topic = "iot/light"
"#;
        let result = LightConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let toml_content = r#"
[mqtt]
status_topic = "iot/+/status"
"#;
        let result = LightConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let toml_content = r#"
[mqtt]
broker_url = "not a url"
"#;
        assert!(LightConfig::from_toml_str(toml_content).is_err());

        let toml_content = r#"
[mqtt]
broker_url = "http://localhost:1883"
"#;
        assert!(LightConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_history_limit_bounds() {
        let toml_content = r#"
[history]
default_limit = 2000
max_limit = 1000
"#;
        let result = LightConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_token_env_var() {
        let mut config = LightConfig::default();
        config.auth.users.push(AuthUser {
            username: "ghost".to_string(),
            token_env: "SMARTLIGHT_TEST_TOKEN_THAT_DOES_NOT_EXIST".to_string(),
        });

        let result = config.resolve_api_tokens();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = LightConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = LightConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(config, parsed);
    }
}
