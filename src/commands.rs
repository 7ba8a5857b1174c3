//! Outbound device commands.
//!
//! Commands are JSON objects published at QoS 1 to the device's control topic
//! with a `timestamp` added. Each one is recorded as `sent` before it is
//! published and flips to `acknowledged` when the device answers on its
//! control-response topic with the same `command_id`. A command whose publish
//! fails is marked `failed`.

use crate::error::{CommandError, ManagerError};
use crate::gateway::PersistenceGateway;
use crate::models::{
    BrokerId, CommandStatus, DeviceCommand, RelayActor, RelayState, MAX_RELAY_INDEX,
    MIN_RELAY_INDEX,
};
use crate::registry::ConnectionRegistry;
use crate::router::{timestamp_json, TopicLayout};
use rumqttc::QoS;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

pub const RELAY_CONTROL: &str = "relay_control";
pub const STATUS_REQUEST: &str = "status_request";
const GENERIC_COMMAND: &str = "control";

pub struct DeviceCommander {
    registry: Arc<ConnectionRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
    layout: TopicLayout,
}

impl DeviceCommander {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
        layout: TopicLayout,
    ) -> Self {
        Self {
            registry,
            gateway,
            layout,
        }
    }

    /// Publishes `command` to the device. Without an explicit broker the first
    /// active broker (by id) is used.
    pub async fn send_control_command(
        &self,
        broker_id: Option<&str>,
        device_id: &str,
        command: Value,
    ) -> Result<DeviceCommand, CommandError> {
        let Value::Object(mut body) = command else {
            return Err(CommandError::NotAnObject);
        };
        let broker_id = self.pick_broker(broker_id)?;
        if !self.registry.is_registered(&broker_id) {
            return Err(ManagerError::UnknownBroker(broker_id).into());
        }
        if self.gateway.find_device(device_id).await?.is_none() {
            return Err(CommandError::UnknownDevice(device_id.to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let command_id = match body.get("command_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = format!("cmd_{}", Uuid::new_v4());
                body.insert("command_id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let command_type = body
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(GENERIC_COMMAND)
            .to_string();
        body.insert("timestamp".to_string(), timestamp_json(now));

        let payload = Value::Object(body);
        let topic = self.layout.control_topic(device_id);
        let command = DeviceCommand {
            command_id,
            broker_id,
            device_id: device_id.to_string(),
            command_type,
            payload,
            status: CommandStatus::Sent,
            created_at: now,
        };

        // The row has to exist before the device can answer.
        self.gateway.record_command(&command).await?;
        if let Err(e) = self
            .registry
            .publish_to(
                &command.broker_id,
                &topic,
                command.payload.to_string().into_bytes(),
                QoS::AtLeastOnce,
                false,
            )
            .await
        {
            if let Err(store) = self.gateway.fail_command(&command.command_id).await {
                warn!(command = %command.command_id, error = %store, "Failed to mark command as failed");
            }
            return Err(e.into());
        }

        info!(
            broker = %command.broker_id,
            device = %device_id,
            command = %command.command_id,
            kind = %command.command_type,
            "Command sent"
        );
        Ok(command)
    }

    /// Switches one relay and records the change with the `user` actor.
    pub async fn send_relay_command(
        &self,
        broker_id: Option<&str>,
        device_id: &str,
        relay_index: u8,
        state: bool,
    ) -> Result<DeviceCommand, CommandError> {
        if !(MIN_RELAY_INDEX..=MAX_RELAY_INDEX).contains(&relay_index) {
            return Err(CommandError::InvalidRelay(relay_index));
        }

        let issued = OffsetDateTime::now_utc();
        let command = json!({
            "type": RELAY_CONTROL,
            "relay": relay_index,
            "state": state,
            "command_id": format!(
                "relay_{}_{}_{}",
                relay_index,
                u8::from(state),
                issued.unix_timestamp()
            ),
        });
        let sent = self
            .send_control_command(broker_id, device_id, command)
            .await?;

        self.gateway
            .append_relay_state(&RelayState {
                device_id: device_id.to_string(),
                relay_index,
                state,
                timestamp: sent.created_at,
                actor: RelayActor::User,
            })
            .await?;
        Ok(sent)
    }

    pub async fn request_device_status(
        &self,
        broker_id: Option<&str>,
        device_id: &str,
    ) -> Result<DeviceCommand, CommandError> {
        let mut body = Map::new();
        body.insert("type".to_string(), Value::String(STATUS_REQUEST.to_string()));
        self.send_control_command(broker_id, device_id, Value::Object(body))
            .await
    }

    fn pick_broker(&self, broker_id: Option<&str>) -> Result<BrokerId, CommandError> {
        match broker_id {
            Some(id) => Ok(id.to_string()),
            None => self
                .registry
                .broker_ids()
                .into_iter()
                .next()
                .ok_or(CommandError::NoActiveBroker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_connection::ConnectionContext;
    use crate::db::DatabaseService;
    use crate::error::PersistenceError;
    use crate::events::BroadcastEventSink;
    use crate::loopback::LoopbackBroker;
    use crate::models::{
        BrokerConfig, BrokerRecord, Device, MessageLogEntry, TelemetryRecord,
    };
    use crate::router::MessageRouter;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Storage whose command inserts take a while to land.
    struct SlowCommandStore {
        db: DatabaseService,
        delay: Duration,
    }

    #[async_trait]
    impl PersistenceGateway for SlowCommandStore {
        async fn find_device(&self, device_id: &str) -> Result<Option<Device>, PersistenceError> {
            PersistenceGateway::find_device(&self.db, device_id).await
        }

        async fn touch_device_last_seen(
            &self,
            device_id: &str,
            at: OffsetDateTime,
        ) -> Result<(), PersistenceError> {
            self.db.touch_device_last_seen(device_id, at).await
        }

        async fn update_device_status(
            &self,
            device_id: &str,
            status: &str,
            at: OffsetDateTime,
        ) -> Result<(), PersistenceError> {
            self.db.update_device_status(device_id, status, at).await
        }

        async fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<(), PersistenceError> {
            PersistenceGateway::insert_telemetry(&self.db, record).await
        }

        async fn append_relay_state(&self, record: &RelayState) -> Result<(), PersistenceError> {
            PersistenceGateway::append_relay_state(&self.db, record).await
        }

        async fn log_outbound_message(&self, entry: &MessageLogEntry) -> Result<(), PersistenceError> {
            self.db.log_outbound_message(entry).await
        }

        async fn log_inbound_message(&self, entry: &MessageLogEntry) -> Result<(), PersistenceError> {
            self.db.log_inbound_message(entry).await
        }

        async fn update_broker_status(
            &self,
            broker_id: &str,
            connected: bool,
            last_connected_at: Option<OffsetDateTime>,
        ) -> Result<(), PersistenceError> {
            self.db
                .update_broker_status(broker_id, connected, last_connected_at)
                .await
        }

        async fn find_broker_config(
            &self,
            broker_id: &str,
        ) -> Result<Option<BrokerConfig>, PersistenceError> {
            self.db.find_broker_config(broker_id).await
        }

        async fn list_brokers(&self) -> Result<Vec<BrokerRecord>, PersistenceError> {
            self.db.list_brokers().await
        }

        async fn save_broker_config(
            &self,
            broker_id: &str,
            config: &BrokerConfig,
        ) -> Result<(), PersistenceError> {
            self.db.save_broker_config(broker_id, config).await
        }

        async fn mark_broker_active(
            &self,
            broker_id: &str,
            active: bool,
        ) -> Result<bool, PersistenceError> {
            self.db.mark_broker_active(broker_id, active).await
        }

        async fn record_command(&self, command: &DeviceCommand) -> Result<(), PersistenceError> {
            tokio::time::sleep(self.delay).await;
            self.db.record_command(command).await
        }

        async fn fail_command(&self, command_id: &str) -> Result<bool, PersistenceError> {
            PersistenceGateway::fail_command(&self.db, command_id).await
        }

        async fn acknowledge_command(
            &self,
            command_id: &str,
            response: &Value,
            at: OffsetDateTime,
        ) -> Result<bool, PersistenceError> {
            PersistenceGateway::acknowledge_command(&self.db, command_id, response, at).await
        }
    }

    async fn wait_for_status(db: &DatabaseService, command_id: &str, expected: CommandStatus) {
        for _ in 0..100 {
            if db.command_status(command_id).unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "command {} never reached {:?}, last {:?}",
            command_id,
            expected,
            db.command_status(command_id).unwrap()
        );
    }

    struct Fixture {
        bus: LoopbackBroker,
        db: DatabaseService,
        registry: Arc<ConnectionRegistry>,
        commander: DeviceCommander,
    }

    fn fixture() -> Fixture {
        let bus = LoopbackBroker::new();
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(db.clone());
        let layout = TopicLayout::default();
        let router = MessageRouter::new(
            layout.routes().unwrap(),
            gateway.clone(),
            Arc::new(BroadcastEventSink::new(16)),
        );
        let registry = Arc::new(
            ConnectionRegistry::new(ConnectionContext {
                connector: Arc::new(bus.clone()),
                gateway: gateway.clone(),
                router: Arc::new(router),
                subscribe_qos: QoS::AtMostOnce,
            })
            .with_connect_timeout(Duration::from_millis(200)),
        );
        let commander = DeviceCommander::new(registry.clone(), gateway, layout);
        Fixture {
            bus,
            db,
            registry,
            commander,
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            name: "Main".to_string(),
            host: "loopback".to_string(),
            port: 1883,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn relay_command_is_published_and_recorded() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();

        let command = f
            .commander
            .send_relay_command(None, "dev1", 2, true)
            .await
            .unwrap();
        assert!(command.command_id.starts_with("relay_2_1_"));
        assert_eq!(command.command_type, RELAY_CONTROL);

        let published = f.bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "iot/devices/dev1/control");
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["relay"], 2);
        assert_eq!(body["state"], true);
        assert!(body["timestamp"].is_string());

        assert_eq!(
            f.db.command_status(&command.command_id).unwrap(),
            Some(CommandStatus::Sent)
        );
        let relays = f.db.current_relay_states("dev1").unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].actor, RelayActor::User);
    }

    #[tokio::test]
    async fn relay_index_is_bounded() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();
        for index in [0, 5] {
            assert!(matches!(
                f.commander.send_relay_command(Some("b1"), "dev1", index, true).await,
                Err(CommandError::InvalidRelay(i)) if i == index
            ));
        }
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn device_response_acknowledges_command() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();
        let command = f
            .commander
            .request_device_status(Some("b1"), "dev1")
            .await
            .unwrap();
        assert_eq!(command.command_type, STATUS_REQUEST);

        let response = json!({ "command_id": command.command_id, "ok": true }).to_string();
        f.bus
            .inject("b1", "iot/devices/dev1/control/response", response.as_bytes());

        wait_for_status(&f.db, &command.command_id, CommandStatus::Acknowledged).await;
    }

    #[tokio::test]
    async fn reply_racing_a_slow_insert_still_acknowledges() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();
        let commander = DeviceCommander::new(
            f.registry.clone(),
            Arc::new(SlowCommandStore {
                db: f.db.clone(),
                delay: Duration::from_millis(100),
            }),
            TopicLayout::default(),
        );

        // Answer the moment the command hits the wire.
        let device = {
            let bus = f.bus.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(sent) = bus.published().first() {
                        let body: Value = serde_json::from_slice(&sent.payload).unwrap();
                        let reply = json!({ "command_id": body["command_id"] }).to_string();
                        bus.inject("b1", "iot/devices/dev1/control/response", reply.as_bytes());
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        commander
            .send_control_command(Some("b1"), "dev1", json!({ "command_id": "c1" }))
            .await
            .unwrap();
        device.await.unwrap();
        wait_for_status(&f.db, "c1", CommandStatus::Acknowledged).await;
    }

    #[tokio::test]
    async fn command_that_cannot_be_published_is_marked_failed() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();
        f.bus.drop_sessions("b1");
        for _ in 0..100 {
            if !f.registry.live_status("b1").unwrap().connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = f
            .commander
            .send_relay_command(Some("b1"), "dev1", 1, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Manager(ManagerError::NotConnected(_))));

        let err = f
            .commander
            .send_control_command(Some("b1"), "dev1", json!({ "command_id": "c-lost" }))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Manager(ManagerError::NotConnected(_))));
        assert_eq!(f.db.command_status("c-lost").unwrap(), Some(CommandStatus::Failed));
        assert!(f.db.current_relay_states("dev1").unwrap().is_empty());
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn commands_need_a_broker_and_a_known_device() {
        let f = fixture();
        assert!(matches!(
            f.commander.request_device_status(None, "dev1").await,
            Err(CommandError::NoActiveBroker)
        ));
        assert!(matches!(
            f.commander.request_device_status(Some("b9"), "dev1").await,
            Err(CommandError::Manager(ManagerError::UnknownBroker(_)))
        ));

        f.registry.add_broker("b1", config()).await.unwrap();
        assert!(matches!(
            f.commander.request_device_status(None, "ghost").await,
            Err(CommandError::UnknownDevice(_))
        ));
        assert!(matches!(
            f.commander
                .send_control_command(None, "dev1", json!(["not", "an", "object"]))
                .await,
            Err(CommandError::NotAnObject)
        ));
    }

    #[tokio::test]
    async fn caller_supplied_command_id_is_kept() {
        let f = fixture();
        f.registry.add_broker("b1", config()).await.unwrap();
        let command = f
            .commander
            .send_control_command(None, "dev1", json!({ "type": "reboot", "command_id": "c-42" }))
            .await
            .unwrap();
        assert_eq!(command.command_id, "c-42");
        assert_eq!(command.command_type, "reboot");
    }
}
