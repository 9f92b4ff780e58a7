use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Process-level settings. Broker settings are not here: they live in the
/// `mqtt_config` table so every worker process sees the same values.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub lock_file_path: PathBuf,
    pub http_address: String,
    pub http_port: u16,
    pub log_level: String,

    pub heartbeat_interval_secs: u64,
    pub freshness_window_secs: u64,
    pub stop_timeout_secs: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub test_timeout_secs: u64,
    pub config_poll_interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("brewscale.db"),
            lock_file_path: env::temp_dir().join("brewscale_mqtt_worker.lock"),
            http_address: "127.0.0.1".to_string(),
            http_port: 8000,
            log_level: "info".to_string(),
            heartbeat_interval_secs: 30,
            freshness_window_secs: 90,
            stop_timeout_secs: 5,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 60_000,
            test_timeout_secs: 10,
            config_poll_interval_secs: 10,
        }
    }
}

/// Reads `key`, falling back to `default` when unset. A set but unparsable
/// value is an error rather than a silent fallback.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid value", key))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::MissingOrInvalid(key.to_string())),
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_RECONNECT_MS: u64 = 100;
        const MAX_RECONNECT_MS: u64 = 1_000_000;

        if !(MIN_RECONNECT_MS..=MAX_RECONNECT_MS).contains(&self.reconnect_min_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_MIN_MS must be between {} and {} ms",
                MIN_RECONNECT_MS, MAX_RECONNECT_MS
            )));
        }
        if self.reconnect_max_ms < self.reconnect_min_ms || self.reconnect_max_ms > MAX_RECONNECT_MS {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_MAX_MS must be between MQTT_RECONNECT_MIN_MS and {} ms",
                MAX_RECONNECT_MS
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_HEARTBEAT_SECS must be greater than zero".to_string(),
            ));
        }
        if self.freshness_window_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::ParsingError(
                "MQTT_FRESHNESS_SECS must exceed MQTT_HEARTBEAT_SECS".to_string(),
            ));
        }
        if self.stop_timeout_secs == 0 || self.test_timeout_secs == 0 || self.config_poll_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_STOP_TIMEOUT_SECS, MQTT_TEST_TIMEOUT_SECS and MQTT_CONFIG_POLL_SECS must be greater than zero"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let defaults = Self::default();

        let config = Self {
            database_path: env_or("DATABASE_PATH", defaults.database_path)?,
            lock_file_path: env_or("MQTT_LOCK_FILE", defaults.lock_file_path)?,
            http_address: env_or("HTTP_ADDRESS", defaults.http_address)?,
            http_port: env_or("HTTP_PORT", defaults.http_port)?,
            log_level: env_or("LOG_LEVEL", defaults.log_level)?,

            heartbeat_interval_secs: env_or("MQTT_HEARTBEAT_SECS", defaults.heartbeat_interval_secs)?,
            freshness_window_secs: env_or("MQTT_FRESHNESS_SECS", defaults.freshness_window_secs)?,
            stop_timeout_secs: env_or("MQTT_STOP_TIMEOUT_SECS", defaults.stop_timeout_secs)?,
            reconnect_min_ms: env_or("MQTT_RECONNECT_MIN_MS", defaults.reconnect_min_ms)?,
            reconnect_max_ms: env_or("MQTT_RECONNECT_MAX_MS", defaults.reconnect_max_ms)?,
            test_timeout_secs: env_or("MQTT_TEST_TIMEOUT_SECS", defaults.test_timeout_secs)?,
            config_poll_interval_secs: env_or("MQTT_CONFIG_POLL_SECS", defaults.config_poll_interval_secs)?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_interval_secs)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(Config::default().validate_timeouts().is_ok());
    }

    #[test]
    fn freshness_must_exceed_heartbeat() {
        let config = Config {
            heartbeat_interval_secs: 30,
            freshness_window_secs: 30,
            ..Config::default()
        };
        assert!(matches!(
            config.validate_timeouts(),
            Err(ConfigError::ParsingError(_))
        ));
    }

    #[test]
    fn reconnect_bounds_are_ordered() {
        let config = Config {
            reconnect_min_ms: 5_000,
            reconnect_max_ms: 1_000,
            ..Config::default()
        };
        assert!(config.validate_timeouts().is_err());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config {
            log_level: "chatty".to_string(),
            ..Config::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }
}
