//! Classification and handling of inbound broker messages.
//!
//! The router is stateless between messages: each `(topic, payload)` is either
//! fully handled or dropped, and nothing it encounters is raised to the caller.

use crate::error::{RouteError, TopicError};
use crate::events::{EventSink, CONTROL_RESPONSE, MQTT_MESSAGE, STATUS_UPDATE, TELEMETRY_UPDATE};
use crate::gateway::PersistenceGateway;
use crate::models::{RelayActor, RelayState, TelemetryRecord, MAX_RELAY_INDEX, MIN_RELAY_INDEX};
use crate::topic::{level_at, TopicFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const MAX_STATUS_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Telemetry,
    Status,
    ControlResponse,
}

#[derive(Debug, Clone)]
pub struct TopicRoute {
    filter: TopicFilter,
    class: MessageClass,
    device_level: usize,
}

impl TopicRoute {
    /// The device id is taken from the level matched by the filter's first `+`.
    pub fn new(filter: &str, class: MessageClass) -> Result<Self, TopicError> {
        let filter = TopicFilter::parse(filter)?;
        let device_level = filter
            .first_single_wildcard()
            .ok_or_else(|| TopicError::MissingDeviceLevel(filter.to_string()))?;
        Ok(Self {
            filter,
            class,
            device_level,
        })
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }
}

/// Topic naming scheme shared by the router and the command publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub prefix: String,
    pub telemetry: String,
    pub status: String,
    pub control: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            prefix: "iot/devices".to_string(),
            telemetry: "telemetry".to_string(),
            status: "status".to_string(),
            control: "control".to_string(),
        }
    }
}

impl TopicLayout {
    pub fn routes(&self) -> Result<Vec<TopicRoute>, TopicError> {
        let prefix = self.prefix.trim_end_matches('/');
        Ok(vec![
            TopicRoute::new("sensors/+/data", MessageClass::Telemetry)?,
            TopicRoute::new(&format!("{}/+/{}", prefix, self.telemetry), MessageClass::Telemetry)?,
            TopicRoute::new("devices/+/status", MessageClass::Status)?,
            TopicRoute::new(&format!("{}/+/{}", prefix, self.status), MessageClass::Status)?,
            TopicRoute::new(
                &format!("{}/+/{}/response", prefix, self.control),
                MessageClass::ControlResponse,
            )?,
        ])
    }

    pub fn control_topic(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.prefix.trim_end_matches('/'), device_id, self.control)
    }
}

#[derive(Debug)]
pub enum RouteOutcome {
    Handled(MessageClass),
    Dropped(RouteError),
    Unrouted,
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    sensor_type: Option<String>,
    value: Option<f64>,
    unit: Option<String>,
    location: Option<String>,
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    metadata: Option<Map<String, Value>>,
    additional: Option<Map<String, Value>>,
}

impl TelemetryPayload {
    fn has_reading(&self) -> bool {
        [
            self.value,
            self.voltage,
            self.current,
            self.power,
            self.temperature,
            self.humidity,
        ]
        .iter()
        .any(Option::is_some)
    }

    fn into_record(self, device_id: &str, timestamp: OffsetDateTime) -> TelemetryRecord {
        let mut metadata = self.metadata.unwrap_or_default();
        if let Some(additional) = self.additional {
            metadata.extend(additional);
        }
        if let Some(location) = self.location {
            metadata.insert("location".to_string(), Value::String(location));
        }

        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp,
            sensor_type: self.sensor_type,
            value: self.value,
            unit: self.unit,
            voltage: self.voltage,
            current: self.current,
            power: self.power,
            temperature: self.temperature,
            humidity: self.humidity,
            metadata: Value::Object(metadata),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: Option<String>,
    #[serde(default)]
    relays: BTreeMap<String, bool>,
}

pub struct MessageRouter {
    routes: Vec<TopicRoute>,
    gateway: Arc<dyn PersistenceGateway>,
    events: Arc<dyn EventSink>,
}

impl MessageRouter {
    pub fn new(
        routes: Vec<TopicRoute>,
        gateway: Arc<dyn PersistenceGateway>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            routes,
            gateway,
            events,
        }
    }

    /// Filters every broker connection subscribes to on connect.
    pub fn subscription_filters(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|r| r.filter.as_str().to_string())
            .collect()
    }

    /// First matching route wins.
    pub fn classify<'t>(&self, topic: &'t str) -> Option<(MessageClass, &'t str)> {
        self.routes.iter().find_map(|route| {
            if !route.filter.matches(topic) {
                return None;
            }
            level_at(topic, route.device_level).map(|device_id| (route.class, device_id))
        })
    }

    pub async fn route(&self, broker_id: &str, topic: &str, payload: &[u8]) -> RouteOutcome {
        let Some((class, device_id)) = self.classify(topic) else {
            debug!(broker = %broker_id, topic, "No route for topic, dropping message");
            return RouteOutcome::Unrouted;
        };

        let now = OffsetDateTime::now_utc();
        let result = match class {
            MessageClass::Telemetry => self.handle_telemetry(topic, device_id, payload, now).await,
            MessageClass::Status => self.handle_status(topic, device_id, payload, now).await,
            MessageClass::ControlResponse => {
                self.handle_control_response(device_id, payload, now).await
            }
        };

        match result {
            Ok(()) => {
                self.events
                    .publish(
                        MQTT_MESSAGE,
                        json!({
                            "broker_id": broker_id,
                            "topic": topic,
                            "payload": payload_json(payload),
                            "timestamp": timestamp_json(now),
                        }),
                    )
                    .await;
                RouteOutcome::Handled(class)
            }
            Err(e) => {
                match &e {
                    RouteError::Persistence(_) => {
                        error!(broker = %broker_id, topic, error = %e, "Failed to store message")
                    }
                    _ => warn!(broker = %broker_id, topic, error = %e, "Dropping message"),
                }
                RouteOutcome::Dropped(e)
            }
        }
    }

    async fn handle_telemetry(
        &self,
        topic: &str,
        device_id: &str,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), RouteError> {
        let parsed: TelemetryPayload = serde_json::from_slice(payload)
            .map_err(|e| RouteError::malformed(topic, e.to_string()))?;
        if !parsed.has_reading() {
            return Err(RouteError::malformed(topic, "no sensor value present"));
        }

        if self.gateway.find_device(device_id).await?.is_none() {
            return Err(RouteError::UnknownDevice(device_id.to_string()));
        }

        let record = parsed.into_record(device_id, now);
        self.gateway.insert_telemetry(&record).await?;
        self.gateway.touch_device_last_seen(device_id, now).await?;

        self.events
            .publish(
                TELEMETRY_UPDATE,
                json!({
                    "device_id": device_id,
                    "data": payload_json(payload),
                    "timestamp": timestamp_json(now),
                }),
            )
            .await;
        info!(device = %device_id, "Stored telemetry");
        Ok(())
    }

    async fn handle_status(
        &self,
        topic: &str,
        device_id: &str,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), RouteError> {
        let parsed: StatusPayload = serde_json::from_slice(payload)
            .map_err(|e| RouteError::malformed(topic, e.to_string()))?;

        let status = parsed.status.unwrap_or_else(|| "online".to_string());
        if status.is_empty() || status.len() > MAX_STATUS_LEN {
            return Err(RouteError::malformed(topic, "status must be 1-20 characters"));
        }

        let mut relays = Vec::with_capacity(parsed.relays.len());
        for (key, state) in &parsed.relays {
            let relay_index = key
                .parse::<u8>()
                .ok()
                .filter(|i| (MIN_RELAY_INDEX..=MAX_RELAY_INDEX).contains(i))
                .ok_or_else(|| {
                    RouteError::malformed(topic, format!("relay index '{}' out of range", key))
                })?;
            relays.push(RelayState {
                device_id: device_id.to_string(),
                relay_index,
                state: *state,
                timestamp: now,
                actor: RelayActor::Device,
            });
        }

        if self.gateway.find_device(device_id).await?.is_none() {
            return Err(RouteError::UnknownDevice(device_id.to_string()));
        }

        self.gateway.update_device_status(device_id, &status, now).await?;
        for relay in &relays {
            self.gateway.append_relay_state(relay).await?;
        }

        self.events
            .publish(
                STATUS_UPDATE,
                json!({
                    "device_id": device_id,
                    "status": payload_json(payload),
                    "timestamp": timestamp_json(now),
                }),
            )
            .await;
        debug!(device = %device_id, status = %status, relays = relays.len(), "Stored device status");
        Ok(())
    }

    async fn handle_control_response(
        &self,
        device_id: &str,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), RouteError> {
        let response = payload_json(payload);
        info!(device = %device_id, response = %response, "Control response received");

        if let Some(command_id) = response.get("command_id").and_then(Value::as_str) {
            if !self.gateway.acknowledge_command(command_id, &response, now).await? {
                debug!(device = %device_id, command_id, "Response matches no issued command");
            }
        }

        self.events
            .publish(
                CONTROL_RESPONSE,
                json!({
                    "device_id": device_id,
                    "response": response,
                    "timestamp": timestamp_json(now),
                }),
            )
            .await;
        Ok(())
    }
}

/// JSON payloads are forwarded as JSON, anything else as a lossy string.
fn payload_json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

pub(crate) fn timestamp_json(at: OffsetDateTime) -> Value {
    at.format(&Rfc3339).map(Value::String).unwrap_or(Value::Null)
}
