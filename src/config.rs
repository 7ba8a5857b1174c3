use crate::models::BrokerConfig;
use crate::router::TopicLayout;
use crate::validation;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    Loopback,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "loopback" => Ok(TransportKind::Loopback),
            _ => Err(ConfigError::ParsingError(
                "MQTT_TRANSPORT must be 'mqtt' or 'loopback'".to_string(),
            )),
        }
    }
}

/// Broker seeded into the catalog at startup when `MQTT_HOST` is set.
#[derive(Debug, Deserialize, Clone)]
pub struct SeedBroker {
    pub broker_id: String,
    pub config: BrokerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_path: String,

    pub mqtt_transport: TransportKind,
    pub mqtt_client_id_prefix: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_channel_capacity: usize,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub topic_prefix: String,
    pub topic_telemetry: String,
    pub topic_status: String,
    pub topic_control: String,

    pub event_buffer: usize,
    pub seed_broker: Option<SeedBroker>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(name: &str, default: &str, expected: &str) -> Result<T, ConfigError> {
    var_or(name, default)
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} must be {}", name, expected)))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.mqtt_keep_alive_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be at least 1".to_string(),
            ));
        }
        if self.mqtt_channel_capacity == 0 || self.event_buffer == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_CHANNEL_CAPACITY and EVENT_BUFFER must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Values that have no usable fallback once they are set wrong.
    fn validate_required(&self) -> Result<(), ConfigError> {
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("DATABASE_PATH".to_string()));
        }
        if let Some(seed) = &self.seed_broker {
            validation::broker_id(&seed.broker_id)
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_BROKER_ID".to_string()))?;
            validation::broker_config(&seed.config)
                .map_err(|e| ConfigError::ParsingError(format!("MQTT_HOST: {}", e)))?;
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let seed_broker = match non_empty_var("MQTT_HOST") {
            Some(host) => {
                let port = parse_var::<u16>("MQTT_PORT", "1883", "a valid port number")?;
                Some(SeedBroker {
                    broker_id: var_or("MQTT_BROKER_ID", "default"),
                    config: BrokerConfig {
                        name: format!("{}:{}", host, port),
                        host,
                        port,
                        username: non_empty_var("MQTT_USERNAME"),
                        password: non_empty_var("MQTT_PASSWORD"),
                    },
                })
            }
            None => None,
        };

        let config = Self {
            database_path: var_or("DATABASE_PATH", "broker_flux.db"),

            mqtt_transport: var_or("MQTT_TRANSPORT", "mqtt").parse()?,
            mqtt_client_id_prefix: var_or("MQTT_CLIENT_ID_PREFIX", "broker_flux"),
            mqtt_keep_alive_secs: parse_var("MQTT_KEEP_ALIVE_SECS", "60", "a number of seconds")?,
            mqtt_connect_timeout_ms: parse_var(
                "MQTT_CONNECT_TIMEOUT_MS",
                "10000",
                "a valid number",
            )?,
            mqtt_channel_capacity: parse_var("MQTT_CHANNEL_CAPACITY", "10", "a valid number")?,
            mqtt_max_retries: parse_var("MQTT_MAX_RETRIES", "5", "an integer")?,
            mqtt_retry_interval_ms: parse_var(
                "MQTT_RETRY_INTERVAL_MS",
                "5000",
                "a valid number",
            )?,

            topic_prefix: var_or("MQTT_TOPIC_PREFIX", "iot/devices"),
            topic_telemetry: var_or("MQTT_TOPIC_TELEMETRY", "telemetry"),
            topic_status: var_or("MQTT_TOPIC_STATUS", "status"),
            topic_control: var_or("MQTT_TOPIC_CONTROL", "control"),

            event_buffer: parse_var("EVENT_BUFFER", "256", "a valid number")?,
            seed_broker,
        };

        config.validate_timeouts()?;
        config.validate_required()?;

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }

    /// Startup attempts per broker; non-positive values mean a single attempt.
    pub fn startup_retries(&self) -> usize {
        self.mqtt_max_retries.clamp(0, 100) as usize
    }

    pub fn topic_layout(&self) -> TopicLayout {
        TopicLayout {
            prefix: self.topic_prefix.clone(),
            telemetry: self.topic_telemetry.clone(),
            status: self.topic_status.clone(),
            control: self.topic_control.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            mqtt_transport: TransportKind::Loopback,
            mqtt_client_id_prefix: "test".to_string(),
            mqtt_keep_alive_secs: 60,
            mqtt_connect_timeout_ms: 1000,
            mqtt_channel_capacity: 10,
            mqtt_max_retries: 3,
            mqtt_retry_interval_ms: 500,
            topic_prefix: "plant/".to_string(),
            topic_telemetry: "telemetry".to_string(),
            topic_status: "status".to_string(),
            topic_control: "cmd".to_string(),
            event_buffer: 16,
            seed_broker: None,
        }
    }

    #[test]
    fn transport_kind_parses_case_insensitively() {
        assert_eq!("MQTT".parse::<TransportKind>().unwrap(), TransportKind::Mqtt);
        assert_eq!(" loopback ".parse::<TransportKind>().unwrap(), TransportKind::Loopback);
        assert!("tcp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn timeouts_are_bounded() {
        assert!(config().validate_timeouts().is_ok());

        let mut too_fast = config();
        too_fast.mqtt_retry_interval_ms = 10;
        assert!(too_fast.validate_timeouts().is_err());

        let mut no_timeout = config();
        no_timeout.mqtt_connect_timeout_ms = 0;
        assert!(no_timeout.validate_timeouts().is_err());
    }

    #[test]
    fn required_values_are_checked() {
        assert!(config().validate_required().is_ok());

        let mut no_db = config();
        no_db.database_path = "  ".to_string();
        assert!(matches!(
            no_db.validate_required(),
            Err(ConfigError::MissingOrInvalid(ref name)) if name == "DATABASE_PATH"
        ));

        let mut bad_seed = config();
        bad_seed.seed_broker = Some(SeedBroker {
            broker_id: "main broker".to_string(),
            config: BrokerConfig {
                name: "mqtt:1883".to_string(),
                host: "mqtt".to_string(),
                port: 1883,
                username: None,
                password: None,
            },
        });
        assert!(matches!(
            bad_seed.validate_required(),
            Err(ConfigError::MissingOrInvalid(ref name)) if name == "MQTT_BROKER_ID"
        ));
    }

    #[test]
    fn negative_retries_mean_single_attempt() {
        let mut c = config();
        c.mqtt_max_retries = -1;
        assert_eq!(c.startup_retries(), 0);
        c.mqtt_max_retries = 1000;
        assert_eq!(c.startup_retries(), 100);
    }

    #[test]
    fn topic_layout_uses_configured_segments() {
        let layout = config().topic_layout();
        assert_eq!(layout.control_topic("d1"), "plant/d1/cmd");
    }
}
