use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub type BrokerId = String;

pub const MIN_RELAY_INDEX: u8 = 1;
pub const MAX_RELAY_INDEX: u8 = 4;

/// Connection parameters for one broker. Never mutated on a live connection;
/// reconfiguring tears the connection down and builds a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// A persisted broker row: the config plus what was last recorded about it.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub id: BrokerId,
    pub config: BrokerConfig,
    pub is_active: bool,
    pub is_connected: bool,
    pub last_connected_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Inactive,
    Disconnected,
    Connecting,
    Connected,
}

impl From<ConnectionState> for BrokerState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => BrokerState::Disconnected,
            ConnectionState::Connecting => BrokerState::Connecting,
            ConnectionState::Connected => BrokerState::Connected,
        }
    }
}

/// Derived view joining a broker's config with its live connection, if any.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub broker_id: BrokerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub state: BrokerState,
    pub connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_connected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
    pub device_type: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One telemetry message. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sensor_type: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayActor {
    System,
    User,
    Device,
}

impl RelayActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayActor::System => "system",
            RelayActor::User => "user",
            RelayActor::Device => "device",
        }
    }
}

impl FromStr for RelayActor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(RelayActor::System),
            "user" => Ok(RelayActor::User),
            "device" => Ok(RelayActor::Device),
            other => Err(format!("unknown relay actor '{}'", other)),
        }
    }
}

/// One relay transition. Current state is the newest record per (device, relay).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayState {
    pub device_id: String,
    pub relay_index: u8,
    pub state: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: RelayActor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Received,
    Sent,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Received => "received",
            MessageDirection::Sent => "sent",
        }
    }
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageLogEntry {
    pub broker_id: BrokerId,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub direction: MessageDirection,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A command published to a device's control topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCommand {
    pub command_id: String,
    pub broker_id: BrokerId,
    pub device_id: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Sent,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
        }
    }
}

/// Aggregate over the `value` column of telemetry inside a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryStatistics {
    pub count: u64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub avg_value: Option<f64>,
    pub time_range_hours: u32,
}
