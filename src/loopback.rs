//! In-process broker implementing the [`Connector`] seam.
//!
//! Every broker id is its own isolated bus. Sessions receive messages whose
//! topic matches one of their filters, retained messages are replayed on
//! subscribe, and the broker can be told to refuse, ignore, or drop
//! connections, or to fail client disconnects. Used for tests and for running
//! the service without a real broker (`MQTT_TRANSPORT=loopback`).

use crate::error::ManagerError;
use crate::models::BrokerConfig;
use crate::topic::TopicFilter;
use crate::transport::{
    Connector, DisconnectReason, EventSender, InboundMessage, Transport, TransportEvent,
};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse(String),
    /// Never acknowledge; the caller's connect timeout has to fire.
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub broker_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

struct Session {
    broker_id: String,
    events: EventSender,
    filters: Vec<TopicFilter>,
}

struct BusState {
    next_session: u64,
    sessions: HashMap<u64, Session>,
    modes: HashMap<String, ConnectMode>,
    failing_disconnects: HashMap<String, String>,
    retained: HashMap<(String, String), (Vec<u8>, QoS)>,
    published: Vec<PublishedMessage>,
    opened: usize,
}

#[derive(Clone)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BusState>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_session: 0,
                sessions: HashMap::new(),
                modes: HashMap::new(),
                failing_disconnects: HashMap::new(),
                retained: HashMap::new(),
                published: Vec::new(),
                opened: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets how future connection attempts to `broker_id` are answered.
    pub fn set_connect_mode(&self, broker_id: &str, mode: ConnectMode) {
        self.lock().modes.insert(broker_id.to_string(), mode);
    }

    /// Makes client disconnects from `broker_id` report `reason`. The session
    /// is still closed.
    pub fn fail_disconnects(&self, broker_id: &str, reason: &str) {
        self.lock()
            .failing_disconnects
            .insert(broker_id.to_string(), reason.to_string());
    }

    /// Publishes as a device would, delivering to matching sessions of `broker_id`.
    pub fn inject(&self, broker_id: &str, topic: &str, payload: &[u8]) {
        let state = self.lock();
        deliver(&state, broker_id, topic, payload, QoS::AtMostOnce, false);
    }

    /// Closes every session of `broker_id` from the broker side.
    pub fn drop_sessions(&self, broker_id: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.broker_id == broker_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(session) = state.sessions.remove(&id) {
                let _ = session.events.send(TransportEvent::Disconnected(
                    DisconnectReason::BrokerInitiated,
                ));
            }
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn session_count(&self, broker_id: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.broker_id == broker_id)
            .count()
    }

    /// Active filters of every session for `broker_id`.
    pub fn subscriptions(&self, broker_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut filters: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.broker_id == broker_id)
            .flat_map(|s| s.filters.iter().map(|f| f.as_str().to_string()))
            .collect();
        filters.sort();
        filters
    }

    /// Number of transports opened so far, across all broker ids.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }
}

fn deliver(state: &BusState, broker_id: &str, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
    for session in state.sessions.values() {
        if session.broker_id != broker_id || !session.filters.iter().any(|f| f.matches(topic)) {
            continue;
        }
        let _ = session.events.send(TransportEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            received_at: OffsetDateTime::now_utc(),
        }));
    }
}

impl Connector for LoopbackBroker {
    fn open(
        &self,
        broker_id: &str,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, ManagerError> {
        let mut state = self.lock();
        state.opened += 1;
        let session_id = state.next_session;
        state.next_session += 1;

        let mode = state
            .modes
            .get(broker_id)
            .cloned()
            .unwrap_or(ConnectMode::Accept);
        debug!(broker = %broker_id, host = %config.host, ?mode, "Loopback session opened");

        match mode {
            ConnectMode::Accept => {
                let _ = events.send(TransportEvent::Connected);
                state.sessions.insert(
                    session_id,
                    Session {
                        broker_id: broker_id.to_string(),
                        events,
                        filters: Vec::new(),
                    },
                );
            }
            ConnectMode::Refuse(reason) => {
                let _ = events.send(TransportEvent::Refused(reason));
            }
            ConnectMode::Ignore => {
                // Keep the sender alive so the receiver does not observe a close.
                state.sessions.insert(
                    session_id,
                    Session {
                        broker_id: format!("{}#pending", broker_id),
                        events,
                        filters: Vec::new(),
                    },
                );
            }
        }

        Ok(Arc::new(LoopbackTransport {
            bus: self.clone(),
            session_id,
            broker_id: broker_id.to_string(),
        }))
    }
}

struct LoopbackTransport {
    bus: LoopbackBroker,
    session_id: u64,
    broker_id: String,
}

impl LoopbackTransport {
    fn closed(&self) -> ManagerError {
        ManagerError::Transport(format!("loopback session {} is closed", self.session_id))
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.bus.lock().sessions.remove(&self.session_id);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ManagerError> {
        let mut state = self.bus.lock();
        if !state.sessions.contains_key(&self.session_id) {
            return Err(self.closed());
        }
        state.published.push(PublishedMessage {
            broker_id: self.broker_id.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        });
        if retain {
            state.retained.insert(
                (self.broker_id.clone(), topic.to_string()),
                (payload.clone(), qos),
            );
        }
        deliver(&state, &self.broker_id, topic, &payload, qos, false);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), ManagerError> {
        let filter = TopicFilter::parse(filter)?;
        let mut state = self.bus.lock();

        let retained: Vec<(String, Vec<u8>, QoS)> = state
            .retained
            .iter()
            .filter(|((broker, topic), _)| *broker == self.broker_id && filter.matches(topic))
            .map(|((_, topic), (payload, qos))| (topic.clone(), payload.clone(), *qos))
            .collect();

        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| self.closed())?;
        if !session.filters.contains(&filter) {
            session.filters.push(filter);
        }
        for (topic, payload, qos) in retained {
            let _ = session.events.send(TransportEvent::Message(InboundMessage {
                topic,
                payload,
                qos,
                retain: true,
                received_at: OffsetDateTime::now_utc(),
            }));
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), ManagerError> {
        let mut state = self.bus.lock();
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| self.closed())?;
        session.filters.retain(|f| f.as_str() != filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ManagerError> {
        let mut state = self.bus.lock();
        if let Some(session) = state.sessions.remove(&self.session_id) {
            let _ = session.events.send(TransportEvent::Disconnected(
                DisconnectReason::ClientRequested,
            ));
        }
        match state.failing_disconnects.get(&self.broker_id) {
            Some(reason) => Err(ManagerError::Transport(reason.clone())),
            None => Ok(()),
        }
    }
}
