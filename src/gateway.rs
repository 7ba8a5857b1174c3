use crate::error::PersistenceError;
use crate::models::{
    BrokerConfig, BrokerRecord, Device, DeviceCommand, MessageLogEntry, RelayState,
    TelemetryRecord,
};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Storage boundary used by the broker connections and the router.
///
/// Every call is its own atomic unit; callers never manage transactions.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, PersistenceError>;

    async fn touch_device_last_seen(
        &self,
        device_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), PersistenceError>;

    /// Sets the device status and `last_seen_at` together.
    async fn update_device_status(
        &self,
        device_id: &str,
        status: &str,
        at: OffsetDateTime,
    ) -> Result<(), PersistenceError>;

    async fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<(), PersistenceError>;

    async fn append_relay_state(&self, record: &RelayState) -> Result<(), PersistenceError>;

    async fn log_outbound_message(&self, entry: &MessageLogEntry) -> Result<(), PersistenceError>;

    async fn log_inbound_message(&self, entry: &MessageLogEntry) -> Result<(), PersistenceError>;

    async fn update_broker_status(
        &self,
        broker_id: &str,
        connected: bool,
        last_connected_at: Option<OffsetDateTime>,
    ) -> Result<(), PersistenceError>;

    async fn find_broker_config(
        &self,
        broker_id: &str,
    ) -> Result<Option<BrokerConfig>, PersistenceError>;

    async fn list_brokers(&self) -> Result<Vec<BrokerRecord>, PersistenceError>;

    /// Adds or replaces a broker's config, keeping its activity and status.
    async fn save_broker_config(
        &self,
        broker_id: &str,
        config: &BrokerConfig,
    ) -> Result<(), PersistenceError>;

    /// Records whether the broker should be activated on the next startup.
    async fn mark_broker_active(&self, broker_id: &str, active: bool) -> Result<bool, PersistenceError>;

    async fn record_command(&self, command: &DeviceCommand) -> Result<(), PersistenceError>;

    /// Marks a command that never left as failed, unless the device already
    /// answered it.
    async fn fail_command(&self, command_id: &str) -> Result<bool, PersistenceError>;

    /// Marks a previously issued command as acknowledged. Returns `false` when
    /// no command with that id exists.
    async fn acknowledge_command(
        &self,
        command_id: &str,
        response: &serde_json::Value,
        at: OffsetDateTime,
    ) -> Result<bool, PersistenceError>;
}
