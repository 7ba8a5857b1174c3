//! One client connection to one broker.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected`. There is
//! no reconnect loop here; whoever owns the connection decides when to retry.
//!
//! Inbound traffic crosses one boundary: the transport's I/O task pushes
//! [`TransportEvent`]s onto an unbounded channel, and a dispatcher task owned by
//! this connection drains it in arrival order, recording liveness, logging the
//! message and handing it to the [`MessageRouter`].
//!
//! Liveness fields are only written by this module. Each successful connect
//! starts a new session number; a dispatcher whose session is no longer current
//! leaves the fields alone.

use crate::error::ManagerError;
use crate::gateway::PersistenceGateway;
use crate::models::{
    BrokerConfig, BrokerId, ConnectionState, MessageDirection, MessageLogEntry,
};
use crate::router::MessageRouter;
use crate::topic::{validate_topic_name, TopicFilter};
use crate::transport::{
    qos_to_u8, Connector, EventReceiver, InboundMessage, Transport, TransportEvent,
};
use rumqttc::QoS;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Collaborators shared by every connection of a registry.
#[derive(Clone)]
pub struct ConnectionContext {
    pub connector: Arc<dyn Connector>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub router: Arc<MessageRouter>,
    pub subscribe_qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_connected_at: Option<OffsetDateTime>,
    pub last_message_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

struct Link {
    state: ConnectionState,
    session: u64,
    transport: Option<Arc<dyn Transport>>,
    last_connected_at: Option<OffsetDateTime>,
    last_message_at: Option<OffsetDateTime>,
    last_error: Option<String>,
}

struct ConnectionInner {
    broker_id: BrokerId,
    config: BrokerConfig,
    context: ConnectionContext,
    link: RwLock<Link>,
    // Serializes connect/disconnect; never taken by the dispatcher.
    lifecycle: Mutex<()>,
}

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

impl BrokerConnection {
    pub fn new(broker_id: impl Into<BrokerId>, config: BrokerConfig, context: ConnectionContext) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                broker_id: broker_id.into(),
                config,
                context,
                link: RwLock::new(Link {
                    state: ConnectionState::Disconnected,
                    session: 0,
                    transport: None,
                    last_connected_at: None,
                    last_message_at: None,
                    last_error: None,
                }),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn broker_id(&self) -> &str {
        &self.inner.broker_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Non-blocking snapshot of what the lifecycle last recorded.
    pub fn status(&self) -> ConnectionSnapshot {
        let link = self.inner.read_link();
        ConnectionSnapshot {
            state: link.state,
            last_connected_at: link.last_connected_at,
            last_message_at: link.last_message_at,
            last_error: link.last_error.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read_link().state == ConnectionState::Connected
    }

    /// Opens the transport and waits up to `timeout` for the broker to
    /// acknowledge and accept the default subscriptions. Already connected is
    /// a no-op.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let session = {
            let mut link = inner.write_link();
            if link.state == ConnectionState::Connected {
                return Ok(());
            }
            link.session += 1;
            link.state = ConnectionState::Connecting;
            link.last_error = None;
            link.session
        };

        info!(
            broker = %inner.broker_id,
            host = %inner.config.host,
            port = inner.config.port,
            "Connecting to MQTT broker"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = match inner
            .context
            .connector
            .open(&inner.broker_id, &inner.config, events_tx)
        {
            Ok(transport) => transport,
            Err(e) => return Err(inner.fail_connect(session, e).await),
        };

        let filters = inner.context.router.subscription_filters();
        let handshake = async {
            await_acknowledgment(&mut events_rx).await?;
            for filter in &filters {
                transport.subscribe(filter, inner.context.subscribe_qos).await?;
            }
            Ok::<(), ManagerError>(())
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                drop(transport);
                return Err(inner.fail_connect(session, e).await);
            }
            Err(_) => {
                drop(transport);
                let e = ManagerError::ConnectTimeout {
                    broker_id: inner.broker_id.clone(),
                    timeout,
                };
                return Err(inner.fail_connect(session, e).await);
            }
        }

        let now = OffsetDateTime::now_utc();
        {
            let mut link = inner.write_link();
            link.state = ConnectionState::Connected;
            link.transport = Some(transport);
            link.last_connected_at = Some(now);
        }
        tokio::spawn(run_dispatcher(inner.clone(), session, events_rx));

        inner.persist_status(true, Some(now)).await;
        info!(broker = %inner.broker_id, subscriptions = filters.len(), "Connected to MQTT broker");
        Ok(())
    }

    /// Closes the transport. Disconnecting a disconnected broker succeeds.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let transport = {
            let mut link = inner.write_link();
            let transport = link.transport.take();
            if transport.is_none() && link.state == ConnectionState::Disconnected {
                return Ok(());
            }
            link.session += 1;
            link.state = ConnectionState::Disconnected;
            transport
        };

        let result = match transport {
            Some(transport) => transport.disconnect().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(broker = %inner.broker_id, error = %e, "Error while closing MQTT transport");
        }

        inner.persist_status(false, None).await;
        info!(broker = %inner.broker_id, "Disconnected from MQTT broker");
        result
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ManagerError> {
        let (session, transport) = self.inner.live_transport()?;
        validate_topic_name(topic)?;

        let entry = MessageLogEntry {
            broker_id: self.inner.broker_id.clone(),
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            qos: qos_to_u8(qos),
            retain,
            direction: MessageDirection::Sent,
            timestamp: OffsetDateTime::now_utc(),
        };

        if let Err(e) = transport.publish(topic, payload, qos, retain).await {
            self.inner.connection_lost(session, e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self.inner.context.gateway.log_outbound_message(&entry).await {
            warn!(broker = %self.inner.broker_id, topic, error = %e, "Failed to log outbound message");
        }
        debug!(broker = %self.inner.broker_id, topic, "Message published");
        Ok(())
    }

    pub async fn subscribe(&self, filter: &str) -> Result<(), ManagerError> {
        let (session, transport) = self.inner.live_transport()?;
        let filter = TopicFilter::parse(filter)?;

        if let Err(e) = transport
            .subscribe(filter.as_str(), self.inner.context.subscribe_qos)
            .await
        {
            self.inner.connection_lost(session, e.to_string()).await;
            return Err(e);
        }
        info!(broker = %self.inner.broker_id, filter = %filter, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), ManagerError> {
        let (session, transport) = self.inner.live_transport()?;
        let filter = TopicFilter::parse(filter)?;

        if let Err(e) = transport.unsubscribe(filter.as_str()).await {
            self.inner.connection_lost(session, e.to_string()).await;
            return Err(e);
        }
        info!(broker = %self.inner.broker_id, filter = %filter, "Unsubscribed");
        Ok(())
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("broker_id", &self.inner.broker_id)
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("state", &self.inner.read_link().state)
            .finish()
    }
}

impl ConnectionInner {
    fn read_link(&self) -> RwLockReadGuard<'_, Link> {
        self.link.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_link(&self) -> RwLockWriteGuard<'_, Link> {
        self.link.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_transport(&self) -> Result<(u64, Arc<dyn Transport>), ManagerError> {
        let link = self.read_link();
        match (&link.state, &link.transport) {
            (ConnectionState::Connected, Some(transport)) => Ok((link.session, transport.clone())),
            _ => Err(ManagerError::NotConnected(self.broker_id.clone())),
        }
    }

    async fn fail_connect(&self, session: u64, error: ManagerError) -> ManagerError {
        {
            let mut link = self.write_link();
            if link.session == session {
                link.state = ConnectionState::Disconnected;
                link.transport = None;
                link.last_error = Some(error.to_string());
            }
        }
        warn!(broker = %self.broker_id, error = %error, "Connection attempt failed");
        self.persist_status(false, None).await;
        error
    }

    /// Degrades a live session to `Disconnected`. Stale sessions are ignored.
    async fn connection_lost(&self, session: u64, reason: String) {
        let transport = {
            let mut link = self.write_link();
            if link.session != session || link.state != ConnectionState::Connected {
                return;
            }
            link.state = ConnectionState::Disconnected;
            link.last_error = Some(reason.clone());
            link.transport.take()
        };
        drop(transport);

        warn!(broker = %self.broker_id, reason = %reason, "Lost connection to MQTT broker");
        self.persist_status(false, None).await;
    }

    /// Returns `false` when the session is stale and the message must be dropped.
    fn record_message(&self, session: u64, at: OffsetDateTime) -> bool {
        let mut link = self.write_link();
        if link.session != session || link.state != ConnectionState::Connected {
            return false;
        }
        link.last_message_at = Some(at);
        true
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        let entry = MessageLogEntry {
            broker_id: self.broker_id.clone(),
            topic: message.topic.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            qos: qos_to_u8(message.qos),
            retain: message.retain,
            direction: MessageDirection::Received,
            timestamp: message.received_at,
        };
        if let Err(e) = self.context.gateway.log_inbound_message(&entry).await {
            warn!(broker = %self.broker_id, topic = %message.topic, error = %e, "Failed to log inbound message");
        }

        let outcome = self
            .context
            .router
            .route(&self.broker_id, &message.topic, &message.payload)
            .await;
        debug!(broker = %self.broker_id, topic = %message.topic, ?outcome, "Inbound message routed");
    }

    async fn persist_status(&self, connected: bool, last_connected_at: Option<OffsetDateTime>) {
        if let Err(e) = self
            .context
            .gateway
            .update_broker_status(&self.broker_id, connected, last_connected_at)
            .await
        {
            warn!(broker = %self.broker_id, error = %e, "Failed to persist broker status");
        }
    }
}

async fn await_acknowledgment(events: &mut EventReceiver) -> Result<(), ManagerError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => return Ok(()),
            TransportEvent::Refused(reason) => {
                return Err(ManagerError::Transport(format!("connection refused: {}", reason)))
            }
            TransportEvent::Disconnected(reason) => {
                return Err(ManagerError::Transport(reason.to_string()))
            }
            TransportEvent::Message(message) => {
                debug!(topic = %message.topic, "Message before acknowledgment ignored");
            }
        }
    }
    Err(ManagerError::Transport(
        "transport closed before acknowledgment".to_string(),
    ))
}

async fn run_dispatcher(inner: Arc<ConnectionInner>, session: u64, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => {
                if inner.record_message(session, message.received_at) {
                    inner.handle_inbound(message).await;
                }
            }
            TransportEvent::Disconnected(reason) => {
                inner.connection_lost(session, reason.to_string()).await;
                return;
            }
            TransportEvent::Refused(reason) => {
                inner
                    .connection_lost(session, format!("connection refused: {}", reason))
                    .await;
                return;
            }
            TransportEvent::Connected => {
                debug!(broker = %inner.broker_id, "Duplicate acknowledgment ignored");
            }
        }
    }
    inner
        .connection_lost(session, "transport closed".to_string())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use crate::events::BroadcastEventSink;
    use crate::loopback::{ConnectMode, LoopbackBroker};
    use crate::router::TopicLayout;

    const TIMEOUT: Duration = Duration::from_millis(500);

    struct Fixture {
        bus: LoopbackBroker,
        db: DatabaseService,
        connection: BrokerConnection,
    }

    fn fixture() -> Fixture {
        let bus = LoopbackBroker::new();
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        let config = BrokerConfig {
            name: "Main".to_string(),
            host: "loopback".to_string(),
            port: 1883,
            username: None,
            password: None,
        };
        db.upsert_broker("b1", &config).unwrap();
        db.register_device("dev1", "Greenhouse", None, "IoT Device").unwrap();

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(db.clone());
        let router = MessageRouter::new(
            TopicLayout::default().routes().unwrap(),
            gateway.clone(),
            Arc::new(BroadcastEventSink::new(16)),
        );
        let context = ConnectionContext {
            connector: Arc::new(bus.clone()),
            gateway,
            router: Arc::new(router),
            subscribe_qos: QoS::AtMostOnce,
        };
        let connection = BrokerConnection::new("b1", config, context);
        Fixture { bus, db, connection }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let f = fixture();
        let status = f.connection.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_connected_at.is_none());
    }

    #[tokio::test]
    async fn connect_subscribes_defaults_and_persists_status() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();

        let status = f.connection.status();
        assert!(status.connected());
        assert!(status.last_connected_at.is_some());
        assert!(f
            .bus
            .subscriptions("b1")
            .contains(&"sensors/+/data".to_string()));
        assert!(f.db.broker("b1").unwrap().unwrap().is_connected);
    }

    #[tokio::test]
    async fn refused_connect_stays_disconnected() {
        let f = fixture();
        f.bus
            .set_connect_mode("b1", ConnectMode::Refuse("not authorized".to_string()));

        let err = f.connection.connect(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ManagerError::Transport(_)));
        let status = f.connection.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.unwrap().contains("not authorized"));
        assert!(!f.db.broker("b1").unwrap().unwrap().is_connected);
    }

    #[tokio::test]
    async fn silent_broker_hits_connect_timeout() {
        let f = fixture();
        f.bus.set_connect_mode("b1", ConnectMode::Ignore);

        let started = std::time::Instant::now();
        let err = f
            .connection
            .connect(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ConnectTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!f.connection.is_connected());
    }

    #[tokio::test]
    async fn publish_requires_connection_and_logs_nothing_when_refused() {
        let f = fixture();
        let err = f
            .connection
            .publish("a/b", b"x".to_vec(), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotConnected(_)));
        assert!(f.db.recent_messages(None, 10).unwrap().is_empty());

        assert!(matches!(
            f.connection.subscribe("a/#").await,
            Err(ManagerError::NotConnected(_))
        ));
        assert!(matches!(
            f.connection.unsubscribe("a/#").await,
            Err(ManagerError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn publish_logs_outbound_message() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();
        f.connection
            .publish("iot/devices/dev1/control", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        let published = f.bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "iot/devices/dev1/control");

        let log = f.db.recent_messages(Some("b1"), 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].direction, MessageDirection::Sent);
        assert_eq!(log[0].qos, 1);
    }

    #[tokio::test]
    async fn publish_rejects_wildcard_topics() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();
        let err = f
            .connection
            .publish("sensors/+/data", vec![], QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidTopic(_)));
    }

    #[tokio::test]
    async fn inbound_messages_are_routed_in_order() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();

        for value in 1..=5 {
            let payload = format!(r#"{{"value":{}}}"#, value);
            f.bus.inject("b1", "sensors/dev1/data", payload.as_bytes());
        }

        let db = f.db.clone();
        wait_until(|| db.recent_telemetry("dev1", 10).unwrap().len() == 5).await;

        let values: Vec<f64> = f
            .db
            .recent_telemetry("dev1", 10)
            .unwrap()
            .iter()
            .rev()
            .filter_map(|r| r.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(f.connection.status().last_message_at.is_some());
        assert_eq!(
            f.db.recent_messages(Some("b1"), 10)
                .unwrap()
                .iter()
                .filter(|m| m.direction == MessageDirection::Received)
                .count(),
            5
        );
    }

    #[tokio::test]
    async fn broker_initiated_disconnect_degrades_connection() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();

        f.bus.drop_sessions("b1");
        let connection = f.connection.clone();
        wait_until(|| !connection.is_connected()).await;

        assert!(f.connection.status().last_error.is_some());
        let db = f.db.clone();
        wait_until(|| !db.broker("b1").unwrap().unwrap().is_connected).await;
        assert!(matches!(
            f.connection
                .publish("a/b", vec![], QoS::AtMostOnce, false)
                .await,
            Err(ManagerError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_reconnect_works() {
        let f = fixture();
        f.connection.disconnect().await.unwrap();

        f.connection.connect(TIMEOUT).await.unwrap();
        f.connection.disconnect().await.unwrap();
        f.connection.disconnect().await.unwrap();
        assert!(!f.connection.is_connected());
        assert_eq!(f.bus.session_count("b1"), 0);

        f.connection.connect(TIMEOUT).await.unwrap();
        assert!(f.connection.is_connected());
        assert_eq!(f.bus.session_count("b1"), 1);
    }

    #[tokio::test]
    async fn messages_after_disconnect_are_not_routed() {
        let f = fixture();
        f.connection.connect(TIMEOUT).await.unwrap();
        f.connection.disconnect().await.unwrap();

        f.bus.inject("b1", "sensors/dev1/data", br#"{"value":1}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.db.recent_telemetry("dev1", 10).unwrap().is_empty());
    }
}
