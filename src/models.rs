use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "brewery";

/// Latest weight seen on the sensor topic. Only the most recent one matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub weight_kg: f64,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl SensorReading {
    pub fn now(weight_kg: f64) -> Self {
        Self {
            weight_kg,
            observed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Broker settings, edited through the admin surface and persisted in the
/// `mqtt_config` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_BROKER_PORT,
            username: None,
            password: None,
            use_tls: false,
            topic_prefix: default_topic_prefix(),
            enabled: false,
        }
    }
}

impl BrokerConfig {
    pub fn weight_topic(&self) -> String {
        let prefix = self.topic_prefix.trim().trim_end_matches('/');
        let prefix = if prefix.is_empty() { DEFAULT_TOPIC_PREFIX } else { prefix };
        format!("{}/keg/weight", prefix)
    }

    pub fn has_host(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Username only counts when non-empty; the admin form submits "" for "none".
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => Some((user, self.password.as_deref().unwrap_or(""))),
            _ => None,
        }
    }
}

/// What `MqttService::start` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Disabled,
    MissingHost,
}

impl StartOutcome {
    pub fn is_running(self) -> bool {
        matches!(self, StartOutcome::Started | StartOutcome::AlreadyRunning)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
}

impl ConnectionTestResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}
