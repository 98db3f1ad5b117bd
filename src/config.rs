//! Environment-backed runtime configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds between produced sequence frames.
    pub sequence_message_interval_ms: u64,
    /// Seconds a session may sit untouched before it tombstones.
    pub session_state_idle_time_expiry_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sequence_message_interval_ms: 1,
            session_state_idle_time_expiry_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub send_last_received_index: bool,
    pub max_reconnect_attempts: u32,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_last_received_index: false,
            max_reconnect_attempts: 100,
            log_level: "info".to_string(),
        }
    }
}

pub fn load() -> Config {
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    config
}

pub fn load_for_client() -> ClientConfig {
    let mut config = ClientConfig::default();
    apply_client_env_overrides(&mut config);
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Some(value) = env_parsed::<u64>("SEQUENCE_MESSAGE_INTERVAL") {
        config.sequence_message_interval_ms = value;
    }
    if let Some(value) = env_parsed::<u64>("SESSION_STATE_IDLE_TIME_EXPIRY") {
        config.session_state_idle_time_expiry_secs = value;
    }
    if let Some(value) = env_trimmed("LOG_LEVEL") {
        config.log_level = value;
    }
}

pub fn apply_client_env_overrides(config: &mut ClientConfig) {
    if let Some(value) = env_parsed::<bool>("SEND_LAST_RECEIVED_INDEX") {
        config.send_last_received_index = value;
    }
    if let Some(value) = env_parsed::<u32>("MAX_RECONNECTION_ATTEMPTS") {
        config.max_reconnect_attempts = value;
    }
    if let Some(value) = env_trimmed("LOG_LEVEL") {
        config.log_level = value;
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env_trimmed(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}
