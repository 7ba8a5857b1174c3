//! Transport seam between a `BrokerConnection` and the MQTT client library.
//!
//! The client library's I/O loop runs in its own task. It only translates
//! packets into [`TransportEvent`]s and pushes them onto an unbounded channel;
//! it never touches shared state or storage, so a slow database cannot stall
//! the socket.

use crate::error::ManagerError;
use crate::models::BrokerConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// How long a client disconnect waits for the DISCONNECT packet to be written.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientRequested,
    BrokerInitiated,
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ClientRequested => f.write_str("disconnect requested"),
            DisconnectReason::BrokerInitiated => f.write_str("broker closed the session"),
            DisconnectReason::Error(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// What the client library reports through its callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Refused(String),
    Disconnected(DisconnectReason),
    Message(InboundMessage),
}

/// An open session with one broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ManagerError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ManagerError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), ManagerError>;

    async fn disconnect(&self) -> Result<(), ManagerError>;
}

/// Opens transports. Opening starts the I/O loop; the connection
/// acknowledgment arrives later as `TransportEvent::Connected`.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        broker_id: &str,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, ManagerError>;
}

pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Connector backed by `rumqttc`.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            client_id_prefix: "broker_flux".to_string(),
            keep_alive: Duration::from_secs(60),
            channel_capacity: 10,
        }
    }
}

impl Connector for MqttConnector {
    fn open(
        &self,
        broker_id: &str,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, ManagerError> {
        let client_id = format!("{}_{}_{}", self.client_id_prefix, broker_id, Uuid::new_v4());
        debug!(broker = %broker_id, host = %config.host, port = config.port, "Configuring MQTT client");

        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        mqtt_options.set_clean_session(true);
        if let Some((username, password)) = config.credentials() {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, self.channel_capacity.max(1));
        let poller = tokio::spawn(poll_events(broker_id.to_string(), eventloop, events));

        Ok(Arc::new(MqttTransport {
            client,
            poller: Mutex::new(Some(poller)),
        }))
    }
}

struct MqttTransport {
    client: AsyncClient,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    fn take_poller(&self) -> Option<JoinHandle<()>> {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.take_poller() {
            poller.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ManagerError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ManagerError> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), ManagerError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    /// Queues DISCONNECT and waits for the poller to write it. The poller
    /// exits right after the packet goes out.
    async fn disconnect(&self) -> Result<(), ManagerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))?;

        let Some(mut poller) = self.take_poller() else {
            return Ok(());
        };
        if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, &mut poller)
            .await
            .is_err()
        {
            poller.abort();
            return Err(ManagerError::Transport(format!(
                "DISCONNECT not written within {:?}",
                DISCONNECT_FLUSH_TIMEOUT
            )));
        }
        Ok(())
    }
}

/// Drives the rumqttc event loop. Stops at the first connection loss instead
/// of letting rumqttc reconnect on the next poll.
async fn poll_events(broker_id: String, mut eventloop: EventLoop, events: EventSender) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    TransportEvent::Connected
                } else {
                    let _ = events.send(TransportEvent::Refused(format!("{:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                TransportEvent::Message(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos,
                    retain: publish.retain,
                    received_at: OffsetDateTime::now_utc(),
                })
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(TransportEvent::Disconnected(
                    DisconnectReason::BrokerInitiated,
                ));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Disconnected(
                    DisconnectReason::ClientRequested,
                ));
                break;
            }
            Ok(other) => {
                trace!(broker = %broker_id, event = ?other, "MQTT event");
                continue;
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = events.send(TransportEvent::Refused(format!("{:?}", code)));
                break;
            }
            Err(e) => {
                warn!(broker = %broker_id, error = %e, "MQTT event loop stopped");
                let _ = events.send(TransportEvent::Disconnected(DisconnectReason::Error(
                    e.to_string(),
                )));
                break;
            }
        };

        if events.send(event).is_err() {
            debug!(broker = %broker_id, "Event receiver dropped, stopping MQTT poller");
            break;
        }
    }
}
