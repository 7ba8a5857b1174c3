//! The set of active broker connections.
//!
//! A broker id has an entry here exactly while the broker is active: an
//! explicit connect succeeded and no disconnect or removal happened since.
//! Mutations of one id are serialized by a per-id async lock; the map itself
//! is only held for lookups and inserts, never across network I/O.

use crate::broker_connection::{BrokerConnection, ConnectionContext};
use crate::error::ManagerError;
use crate::models::{BrokerConfig, BrokerId, BrokerRecord, BrokerState, BrokerStatus};
use futures::future::join_all;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConnectionRegistry {
    context: ConnectionContext,
    connect_timeout: Duration,
    connections: RwLock<HashMap<BrokerId, BrokerConnection>>,
    id_locks: Mutex<HashMap<BrokerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connections: RwLock::new(HashMap::new()),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Builds a connection and registers it only if it connects.
    pub async fn add_broker(&self, broker_id: &str, config: BrokerConfig) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;
        self.activate(broker_id, config).await
    }

    /// Writes `config` to the catalog and activates it, both under the id's
    /// lock. A registered id is left untouched in storage and in memory. A
    /// broker that fails to connect stays in the catalog as inactive.
    pub async fn create_broker(
        &self,
        broker_id: &str,
        config: BrokerConfig,
    ) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;
        if self.is_registered(broker_id) {
            return Err(ManagerError::AlreadyExists(broker_id.to_string()));
        }

        self.context.gateway.save_broker_config(broker_id, &config).await?;
        let result = self.activate(broker_id, config).await;
        if result.is_err() {
            self.mark_active(broker_id, false).await;
        }
        result
    }

    /// Replaces the stored config of a known broker. A registered broker is
    /// rebuilt on the new config.
    pub async fn update_broker(
        &self,
        broker_id: &str,
        config: BrokerConfig,
    ) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;
        let registered = self.is_registered(broker_id);
        if !registered
            && self
                .context
                .gateway
                .find_broker_config(broker_id)
                .await?
                .is_none()
        {
            return Err(ManagerError::UnknownBroker(broker_id.to_string()));
        }

        self.context.gateway.save_broker_config(broker_id, &config).await?;
        if registered {
            self.replace(broker_id, config).await?;
        }
        Ok(())
    }

    /// Disconnects and unregisters. Returns `false` if nothing was registered.
    pub async fn remove_broker(&self, broker_id: &str) -> Result<bool, ManagerError> {
        let _lease = self.lock_id(broker_id).await;

        match self.deactivate(broker_id, true).await {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => {
                warn!(broker = %broker_id, error = %e, "Broker removed with unclean disconnect");
                Ok(true)
            }
        }
    }

    /// Tears the existing connection down and activates `config` in its place.
    /// If the new connection fails the broker ends up inactive.
    pub async fn reconfigure_broker(
        &self,
        broker_id: &str,
        config: BrokerConfig,
    ) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;
        self.replace(broker_id, config).await
    }

    /// Reconnects a registered connection, or activates the broker from its
    /// persisted configuration.
    pub async fn connect_broker(&self, broker_id: &str) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;

        if let Some(connection) = self.connection(broker_id) {
            return connection.connect(self.connect_timeout).await;
        }

        let config = self
            .context
            .gateway
            .find_broker_config(broker_id)
            .await?
            .ok_or_else(|| ManagerError::UnknownBroker(broker_id.to_string()))?;
        self.activate(broker_id, config).await
    }

    /// Deactivates a registered broker.
    pub async fn disconnect_broker(&self, broker_id: &str) -> Result<(), ManagerError> {
        let _lease = self.lock_id(broker_id).await;

        self.deactivate(broker_id, true)
            .await
            .unwrap_or_else(|| Err(ManagerError::UnknownBroker(broker_id.to_string())))
    }

    pub async fn publish_to(
        &self,
        broker_id: &str,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ManagerError> {
        self.require(broker_id)?
            .publish(topic, payload, qos, retain)
            .await
    }

    pub async fn subscribe_on(&self, broker_id: &str, filter: &str) -> Result<(), ManagerError> {
        self.require(broker_id)?.subscribe(filter).await
    }

    pub async fn unsubscribe_on(&self, broker_id: &str, filter: &str) -> Result<(), ManagerError> {
        self.require(broker_id)?.unsubscribe(filter).await
    }

    /// Status of a registered connection without touching storage.
    pub fn live_status(&self, broker_id: &str) -> Option<BrokerStatus> {
        self.connection(broker_id)
            .map(|connection| connection_status(&connection))
    }

    /// Live status if registered, else the persisted broker as `inactive`.
    pub async fn get_status(&self, broker_id: &str) -> Result<BrokerStatus, ManagerError> {
        if let Some(status) = self.live_status(broker_id) {
            return Ok(status);
        }
        self.context
            .gateway
            .list_brokers()
            .await?
            .into_iter()
            .find(|record| record.id == broker_id)
            .map(|record| inactive_status(&record))
            .ok_or_else(|| ManagerError::UnknownBroker(broker_id.to_string()))
    }

    /// Every persisted broker plus any registered one missing from storage,
    /// ordered by id.
    pub async fn get_all_statuses(&self) -> Result<Vec<BrokerStatus>, ManagerError> {
        let mut statuses: HashMap<BrokerId, BrokerStatus> = self
            .context
            .gateway
            .list_brokers()
            .await?
            .iter()
            .map(|record| (record.id.clone(), inactive_status(record)))
            .collect();

        for connection in self.connections() {
            statuses.insert(connection.broker_id().to_string(), connection_status(&connection));
        }

        let mut statuses: Vec<BrokerStatus> = statuses.into_values().collect();
        statuses.sort_by(|a, b| a.broker_id.cmp(&b.broker_id));
        Ok(statuses)
    }

    pub fn broker_ids(&self) -> Vec<BrokerId> {
        let mut ids: Vec<BrokerId> = self.read_map().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_registered(&self, broker_id: &str) -> bool {
        self.read_map().contains_key(broker_id)
    }

    /// Disconnects every registered connection. Every failure is collected;
    /// one bad broker never stops the sweep. Activation flags are left alone
    /// so the same brokers come back on the next startup.
    pub async fn shutdown_all(&self) -> Result<(), ManagerError> {
        let drained: Vec<BrokerConnection> = {
            let mut map = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, connection)| connection).collect()
        };
        info!(count = drained.len(), "Shutting down broker connections");

        let results = join_all(drained.iter().map(|connection| async move {
            (connection.broker_id().to_string(), connection.disconnect().await)
        }))
        .await;

        let failures: Vec<(BrokerId, String)> = results
            .into_iter()
            .filter_map(|(broker_id, result)| result.err().map(|e| (broker_id, e.to_string())))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for (broker_id, error) in &failures {
                warn!(broker = %broker_id, error = %error, "Broker failed to shut down cleanly");
            }
            Err(ManagerError::ShutdownIncomplete { failures })
        }
    }

    pub fn connection(&self, broker_id: &str) -> Option<BrokerConnection> {
        self.read_map().get(broker_id).cloned()
    }

    fn connections(&self) -> Vec<BrokerConnection> {
        self.read_map().values().cloned().collect()
    }

    fn require(&self, broker_id: &str) -> Result<BrokerConnection, ManagerError> {
        self.connection(broker_id)
            .ok_or_else(|| ManagerError::UnknownBroker(broker_id.to_string()))
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<BrokerId, BrokerConnection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for exclusive use of `broker_id`. The lock entry is dropped from
    /// the map again once nobody holds or waits for it.
    async fn lock_id(&self, broker_id: &str) -> IdLease<'_> {
        let lock = self
            .id_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(broker_id.to_string())
            .or_default()
            .clone();
        let mut lease = IdLease {
            registry: self,
            broker_id: broker_id.to_string(),
            lock,
            guard: None,
        };
        lease.guard = Some(lease.lock.clone().lock_owned().await);
        lease
    }

    // Caller holds the id lock.
    async fn replace(&self, broker_id: &str, config: BrokerConfig) -> Result<(), ManagerError> {
        if let Some(Err(e)) = self.deactivate(broker_id, false).await {
            warn!(broker = %broker_id, error = %e, "Old connection closed uncleanly during reconfigure");
        }
        let result = self.activate(broker_id, config).await;
        if result.is_err() {
            self.mark_active(broker_id, false).await;
        }
        result
    }

    // Caller holds the id lock.
    async fn activate(&self, broker_id: &str, config: BrokerConfig) -> Result<(), ManagerError> {
        if self.is_registered(broker_id) {
            return Err(ManagerError::AlreadyExists(broker_id.to_string()));
        }

        let connection = BrokerConnection::new(broker_id, config, self.context.clone());
        connection.connect(self.connect_timeout).await?;

        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker_id.to_string(), connection);
        self.mark_active(broker_id, true).await;
        info!(broker = %broker_id, "Broker activated");
        Ok(())
    }

    // Caller holds the id lock. `None` when the id was not registered.
    async fn deactivate(
        &self,
        broker_id: &str,
        persist_inactive: bool,
    ) -> Option<Result<(), ManagerError>> {
        let connection = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(broker_id)?;

        let result = connection.disconnect().await;
        if persist_inactive {
            self.mark_active(broker_id, false).await;
        }
        info!(broker = %broker_id, "Broker deactivated");
        Some(result)
    }

    async fn mark_active(&self, broker_id: &str, active: bool) {
        if let Err(e) = self.context.gateway.mark_broker_active(broker_id, active).await {
            warn!(broker = %broker_id, error = %e, "Failed to persist broker activation flag");
        }
    }
}

struct IdLease<'a> {
    registry: &'a ConnectionRegistry,
    broker_id: BrokerId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .registry
            .id_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.broker_id);
        }
    }
}

fn connection_status(connection: &BrokerConnection) -> BrokerStatus {
    let snapshot = connection.status();
    let config = connection.config();
    BrokerStatus {
        broker_id: connection.broker_id().to_string(),
        name: config.name.clone(),
        host: config.host.clone(),
        port: config.port,
        state: snapshot.state.into(),
        connected: snapshot.connected(),
        last_connected_at: snapshot.last_connected_at,
        last_message_at: snapshot.last_message_at,
        last_error: snapshot.last_error,
    }
}

fn inactive_status(record: &BrokerRecord) -> BrokerStatus {
    BrokerStatus {
        broker_id: record.id.clone(),
        name: record.config.name.clone(),
        host: record.config.host.clone(),
        port: record.config.port,
        state: BrokerState::Inactive,
        connected: false,
        last_connected_at: record.last_connected_at,
        last_message_at: None,
        last_error: None,
    }
}
