use crate::error::PersistenceError;
use crate::gateway::PersistenceGateway;
use crate::models::{
    BrokerConfig, BrokerRecord, CommandStatus, Device, DeviceCommand, MessageDirection,
    MessageLogEntry, RelayActor, RelayState, TelemetryRecord, TelemetryStatistics,
};
use async_trait::async_trait;
use log::{debug, error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use time::{Duration, OffsetDateTime};

type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Clone)]
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` backed by a pooled SQLite file.
    pub fn new(db_path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool })
    }

    /// Creates a private in-memory database. A single pooled connection keeps
    /// every caller on the same database.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS brokers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            is_active BOOLEAN NOT NULL DEFAULT 1,
            is_connected BOOLEAN NOT NULL DEFAULT 0,
            last_connected_at TEXT
        );

        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT,
            device_type TEXT NOT NULL DEFAULT 'IoT Device',
            status TEXT NOT NULL DEFAULT 'offline',
            last_seen_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS telemetry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            sensor_type TEXT,
            value REAL,
            unit TEXT,
            voltage REAL,
            current REAL,
            power REAL,
            temperature REAL,
            humidity REAL,
            metadata TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (device_id) REFERENCES devices(device_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_telemetry_device ON telemetry(device_id, id);

        CREATE TABLE IF NOT EXISTS relay_states (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            relay_index INTEGER NOT NULL CHECK (relay_index BETWEEN 1 AND 4),
            state BOOLEAN NOT NULL,
            timestamp TEXT NOT NULL,
            actor TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(device_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_relay_device ON relay_states(device_id, relay_index, id);

        CREATE TABLE IF NOT EXISTS mqtt_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broker_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            qos INTEGER NOT NULL,
            retain BOOLEAN NOT NULL,
            direction TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS device_commands (
            command_id TEXT PRIMARY KEY,
            broker_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            command_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            acknowledged_at TEXT,
            response TEXT
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    // Brokers

    /// Inserts the broker if no row with this id exists yet. Existing rows are
    /// left alone so edits made through the API survive restarts.
    pub fn validate_or_add_broker(&self, broker_id: &str, config: &BrokerConfig) -> Result<bool> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO brokers (id, name, host, port, username, password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                broker_id,
                config.name,
                config.host,
                config.port,
                config.username,
                config.password
            ],
        )?;
        if inserted > 0 {
            info!("Seeded broker '{}' at {}:{}", broker_id, config.host, config.port);
        }
        Ok(inserted > 0)
    }

    /// Adds or replaces a broker's config. Activity and status columns are kept.
    pub fn upsert_broker(&self, broker_id: &str, config: &BrokerConfig) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO brokers (id, name, host, port, username, password)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                password = excluded.password
            "#,
            params![
                broker_id,
                config.name,
                config.host,
                config.port,
                config.username,
                config.password
            ],
        )?;
        Ok(())
    }

    pub fn delete_broker(&self, broker_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM brokers WHERE id = ?1", params![broker_id])?;
        Ok(removed > 0)
    }

    pub fn set_broker_active(&self, broker_id: &str, active: bool) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE brokers SET is_active = ?2 WHERE id = ?1",
            params![broker_id, active],
        )?;
        Ok(updated > 0)
    }

    pub fn broker(&self, broker_id: &str) -> Result<Option<BrokerRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT id, name, host, port, username, password, is_active, is_connected,
                        last_connected_at
                 FROM brokers WHERE id = ?1",
                params![broker_id],
                broker_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn brokers(&self) -> Result<Vec<BrokerRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, host, port, username, password, is_active, is_connected,
                    last_connected_at
             FROM brokers ORDER BY id",
        )?;
        let rows = stmt.query_map([], broker_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// `last_connected_at` is only overwritten when a new value is given.
    pub fn set_broker_status(
        &self,
        broker_id: &str,
        connected: bool,
        last_connected_at: Option<OffsetDateTime>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE brokers
             SET is_connected = ?2, last_connected_at = COALESCE(?3, last_connected_at)
             WHERE id = ?1",
            params![broker_id, connected, last_connected_at],
        )?;
        if updated == 0 {
            debug!("Status update for broker '{}' matched no catalog row", broker_id);
        }
        Ok(())
    }

    // Devices

    pub fn register_device(
        &self,
        device_id: &str,
        name: &str,
        location: Option<&str>,
        device_type: &str,
    ) -> Result<Device> {
        let conn = self.pool.get()?;
        let created_at = OffsetDateTime::now_utc();
        conn.execute(
            r#"
            INSERT INTO devices (device_id, name, location, device_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(device_id) DO UPDATE SET
                name = excluded.name,
                location = excluded.location,
                device_type = excluded.device_type
            "#,
            params![device_id, name, location, device_type, created_at],
        )?;
        let device = conn.query_row(
            "SELECT device_id, name, location, device_type, status, last_seen_at, created_at
             FROM devices WHERE device_id = ?1",
            params![device_id],
            device_from_row,
        )?;
        Ok(device)
    }

    pub fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self.pool.get()?;
        let device = conn
            .query_row(
                "SELECT device_id, name, location, device_type, status, last_seen_at, created_at
                 FROM devices WHERE device_id = ?1",
                params![device_id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        self.find_devices(&DeviceFilter::default())
    }

    /// Devices matching every given criterion, ordered by id. `search` is a
    /// case-insensitive substring of the id, name or location.
    pub fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, name, location, device_type, status, last_seen_at, created_at
             FROM devices
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL
                    OR instr(lower(device_id), lower(?2)) > 0
                    OR instr(lower(name), lower(?2)) > 0
                    OR instr(lower(COALESCE(location, '')), lower(?2)) > 0)
             ORDER BY device_id
             LIMIT ?3",
        )?;
        let limit = filter.limit.map_or(-1, |l| l as i64);
        let rows = stmt.query_map(
            params![filter.status, filter.search, limit],
            device_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Removes the device with its telemetry and relay history.
    pub fn delete_device(&self, device_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM devices WHERE device_id = ?1", params![device_id])?;
        if removed > 0 {
            info!("Deleted device '{}'", device_id);
        }
        Ok(removed > 0)
    }

    pub fn touch_device(&self, device_id: &str, at: OffsetDateTime) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE devices SET last_seen_at = ?2 WHERE device_id = ?1",
            params![device_id, at],
        )?;
        Ok(())
    }

    pub fn set_device_status(&self, device_id: &str, status: &str, at: OffsetDateTime) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE devices SET status = ?2, last_seen_at = ?3 WHERE device_id = ?1",
            params![device_id, status, at],
        )?;
        Ok(())
    }

    // Telemetry

    pub fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO telemetry (device_id, timestamp, sensor_type, value, unit, voltage,
                                    current, power, temperature, humidity, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.device_id,
                record.timestamp,
                record.sensor_type,
                record.value,
                record.unit,
                record.voltage,
                record.current,
                record.power,
                record.temperature,
                record.humidity,
                record.metadata
            ],
        )?;
        Ok(())
    }

    /// Retrieves the newest `limit` telemetry records of a device, newest first.
    pub fn recent_telemetry(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, timestamp, sensor_type, value, unit, voltage, current, power,
                    temperature, humidity, metadata
             FROM telemetry
             WHERE device_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit as i64], |row| {
            Ok(TelemetryRecord {
                device_id: row.get(0)?,
                timestamp: row.get(1)?,
                sensor_type: row.get(2)?,
                value: row.get(3)?,
                unit: row.get(4)?,
                voltage: row.get(5)?,
                current: row.get(6)?,
                power: row.get(7)?,
                temperature: row.get(8)?,
                humidity: row.get(9)?,
                metadata: row.get(10)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Count, min, max and average of `value` over the last `hours`.
    pub fn telemetry_statistics(
        &self,
        device_id: Option<&str>,
        sensor_type: Option<&str>,
        hours: u32,
    ) -> Result<TelemetryStatistics> {
        let conn = self.pool.get()?;
        let since = OffsetDateTime::now_utc() - Duration::hours(i64::from(hours));
        let (count, min_value, max_value, avg_value) = conn.query_row(
            "SELECT COUNT(*), MIN(value), MAX(value), AVG(value)
             FROM telemetry
             WHERE timestamp >= ?1
               AND (?2 IS NULL OR device_id = ?2)
               AND (?3 IS NULL OR sensor_type = ?3)",
            params![since, device_id, sensor_type],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;
        Ok(TelemetryStatistics {
            count: count.max(0) as u64,
            min_value,
            max_value,
            avg_value,
            time_range_hours: hours,
        })
    }

    /// Deletes telemetry, optionally only for one device or sensor type.
    pub fn delete_telemetry(&self, device_id: Option<&str>, sensor_type: Option<&str>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM telemetry
             WHERE (?1 IS NULL OR device_id = ?1)
               AND (?2 IS NULL OR sensor_type = ?2)",
            params![device_id, sensor_type],
        )?;
        info!("Deleted {} telemetry records", removed);
        Ok(removed)
    }

    // Relays

    pub fn append_relay_state(&self, record: &RelayState) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO relay_states (device_id, relay_index, state, timestamp, actor)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.device_id,
                record.relay_index,
                record.state,
                record.timestamp,
                record.actor.as_str()
            ],
        )?;
        Ok(())
    }

    /// Newest record per relay of a device, ordered by relay index.
    pub fn current_relay_states(&self, device_id: &str) -> Result<Vec<RelayState>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, relay_index, state, timestamp, actor
             FROM relay_states
             WHERE id IN (
                 SELECT MAX(id) FROM relay_states WHERE device_id = ?1 GROUP BY relay_index
             )
             ORDER BY relay_index",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, OffsetDateTime>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (device_id, relay_index, state, timestamp, actor) = row?;
            let actor = actor
                .parse::<RelayActor>()
                .map_err(|detail| PersistenceError::Corrupt {
                    table: "relay_states",
                    detail,
                })?;
            results.push(RelayState {
                device_id,
                relay_index,
                state,
                timestamp,
                actor,
            });
        }
        Ok(results)
    }

    // Message log

    pub fn log_message(&self, entry: &MessageLogEntry) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO mqtt_messages (broker_id, topic, payload, qos, retain, direction, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.broker_id,
                entry.topic,
                entry.payload,
                entry.qos,
                entry.retain,
                entry.direction.as_str(),
                entry.timestamp
            ],
        )?;
        Ok(())
    }

    /// Retrieves the last `limit` logged messages, optionally for one broker.
    pub fn recent_messages(
        &self,
        broker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT broker_id, topic, payload, qos, retain, direction, timestamp
             FROM mqtt_messages
             WHERE ?1 IS NULL OR broker_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![broker_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u8>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, OffsetDateTime>(6)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (broker_id, topic, payload, qos, retain, direction, timestamp) = row?;
            let direction = match direction.as_str() {
                "received" => MessageDirection::Received,
                "sent" => MessageDirection::Sent,
                other => {
                    return Err(PersistenceError::Corrupt {
                        table: "mqtt_messages",
                        detail: format!("unknown direction '{}'", other),
                    })
                }
            };
            results.push(MessageLogEntry {
                broker_id,
                topic,
                payload,
                qos,
                retain,
                direction,
                timestamp,
            });
        }
        Ok(results)
    }

    pub fn clear_messages(&self, broker_id: Option<&str>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM mqtt_messages WHERE ?1 IS NULL OR broker_id = ?1",
            params![broker_id],
        )?;
        info!("Cleared {} logged MQTT messages", removed);
        Ok(removed)
    }

    // Commands

    /// Re-issuing a command id replaces the earlier row.
    pub fn insert_command(&self, command: &DeviceCommand) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO device_commands
                (command_id, broker_id, device_id, command_type, payload, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                command.command_id,
                command.broker_id,
                command.device_id,
                command.command_type,
                command.payload,
                command.status.as_str(),
                command.created_at
            ],
        )?;
        Ok(())
    }

    pub fn acknowledge_command(
        &self,
        command_id: &str,
        response: &serde_json::Value,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE device_commands
             SET status = ?2, acknowledged_at = ?3, response = ?4
             WHERE command_id = ?1",
            params![command_id, CommandStatus::Acknowledged.as_str(), at, response],
        )?;
        Ok(updated > 0)
    }

    pub fn fail_command(&self, command_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE device_commands SET status = ?2 WHERE command_id = ?1 AND status = ?3",
            params![
                command_id,
                CommandStatus::Failed.as_str(),
                CommandStatus::Sent.as_str()
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn command_status(&self, command_id: &str) -> Result<Option<CommandStatus>> {
        let conn = self.pool.get()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM device_commands WHERE command_id = ?1",
                params![command_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => Ok(None),
            Some("sent") => Ok(Some(CommandStatus::Sent)),
            Some("acknowledged") => Ok(Some(CommandStatus::Acknowledged)),
            Some("failed") => Ok(Some(CommandStatus::Failed)),
            Some(other) => Err(PersistenceError::Corrupt {
                table: "device_commands",
                detail: format!("unknown status '{}'", other),
            }),
        }
    }

    /// Runs a storage call on the blocking pool so the scheduler never waits on SQLite.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DatabaseService) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

/// Criteria for [`DatabaseService::find_devices`]. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

fn broker_from_row(row: &Row<'_>) -> rusqlite::Result<BrokerRecord> {
    Ok(BrokerRecord {
        id: row.get(0)?,
        config: BrokerConfig {
            name: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            username: row.get(4)?,
            password: row.get(5)?,
        },
        is_active: row.get(6)?,
        is_connected: row.get(7)?,
        last_connected_at: row.get(8)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        device_type: row.get(3)?,
        status: row.get(4)?,
        last_seen_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl PersistenceGateway for DatabaseService {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let device_id = device_id.to_string();
        self.blocking(move |db| db.device(&device_id)).await
    }

    async fn touch_device_last_seen(&self, device_id: &str, at: OffsetDateTime) -> Result<()> {
        let device_id = device_id.to_string();
        self.blocking(move |db| db.touch_device(&device_id, at)).await
    }

    async fn update_device_status(
        &self,
        device_id: &str,
        status: &str,
        at: OffsetDateTime,
    ) -> Result<()> {
        let device_id = device_id.to_string();
        let status = status.to_string();
        self.blocking(move |db| db.set_device_status(&device_id, &status, at))
            .await
    }

    async fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |db| db.insert_telemetry(&record)).await
    }

    async fn append_relay_state(&self, record: &RelayState) -> Result<()> {
        let record = record.clone();
        self.blocking(move |db| db.append_relay_state(&record)).await
    }

    async fn log_outbound_message(&self, entry: &MessageLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking(move |db| db.log_message(&entry)).await
    }

    async fn log_inbound_message(&self, entry: &MessageLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking(move |db| db.log_message(&entry)).await
    }

    async fn update_broker_status(
        &self,
        broker_id: &str,
        connected: bool,
        last_connected_at: Option<OffsetDateTime>,
    ) -> Result<()> {
        let broker_id = broker_id.to_string();
        self.blocking(move |db| db.set_broker_status(&broker_id, connected, last_connected_at))
            .await
    }

    async fn find_broker_config(&self, broker_id: &str) -> Result<Option<BrokerConfig>> {
        let broker_id = broker_id.to_string();
        self.blocking(move |db| Ok(db.broker(&broker_id)?.map(|record| record.config)))
            .await
    }

    async fn list_brokers(&self) -> Result<Vec<BrokerRecord>> {
        self.blocking(|db| db.brokers()).await
    }

    async fn save_broker_config(&self, broker_id: &str, config: &BrokerConfig) -> Result<()> {
        let broker_id = broker_id.to_string();
        let config = config.clone();
        self.blocking(move |db| db.upsert_broker(&broker_id, &config))
            .await
    }

    async fn mark_broker_active(&self, broker_id: &str, active: bool) -> Result<bool> {
        let broker_id = broker_id.to_string();
        self.blocking(move |db| db.set_broker_active(&broker_id, active))
            .await
    }

    async fn record_command(&self, command: &DeviceCommand) -> Result<()> {
        let command = command.clone();
        self.blocking(move |db| db.insert_command(&command)).await
    }

    async fn fail_command(&self, command_id: &str) -> Result<bool> {
        let command_id = command_id.to_string();
        self.blocking(move |db| db.fail_command(&command_id)).await
    }

    async fn acknowledge_command(
        &self,
        command_id: &str,
        response: &serde_json::Value,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let command_id = command_id.to_string();
        let response = response.clone();
        self.blocking(move |db| db.acknowledge_command(&command_id, &response, at))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> DatabaseService {
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db
    }

    fn broker_config(host: &str) -> BrokerConfig {
        BrokerConfig {
            name: "Main".to_string(),
            host: host.to_string(),
            port: 1883,
            username: None,
            password: None,
        }
    }

    fn relay(device_id: &str, relay_index: u8, state: bool) -> RelayState {
        RelayState {
            device_id: device_id.to_string(),
            relay_index,
            state,
            timestamp: OffsetDateTime::now_utc(),
            actor: RelayActor::Device,
        }
    }

    #[test]
    fn seeding_does_not_overwrite_existing_broker() {
        let db = db();
        assert!(db.validate_or_add_broker("b1", &broker_config("first")).unwrap());
        assert!(!db.validate_or_add_broker("b1", &broker_config("second")).unwrap());
        assert_eq!(db.broker("b1").unwrap().unwrap().config.host, "first");

        db.upsert_broker("b1", &broker_config("third")).unwrap();
        assert_eq!(db.broker("b1").unwrap().unwrap().config.host, "third");
    }

    #[test]
    fn broker_status_keeps_last_connected_on_disconnect() {
        let db = db();
        db.upsert_broker("b1", &broker_config("localhost")).unwrap();
        let at = OffsetDateTime::now_utc();

        db.set_broker_status("b1", true, Some(at)).unwrap();
        db.set_broker_status("b1", false, None).unwrap();

        let record = db.broker("b1").unwrap().unwrap();
        assert!(!record.is_connected);
        assert!(record.last_connected_at.is_some());
    }

    #[test]
    fn current_relay_state_is_newest_record_per_relay() {
        let db = db();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();

        db.append_relay_state(&relay("dev1", 1, true)).unwrap();
        db.append_relay_state(&relay("dev1", 2, true)).unwrap();
        db.append_relay_state(&relay("dev1", 1, false)).unwrap();

        let current = db.current_relay_states("dev1").unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!((current[0].relay_index, current[0].state), (1, false));
        assert_eq!((current[1].relay_index, current[1].state), (2, true));
    }

    #[test]
    fn relay_index_outside_bounds_is_rejected() {
        let db = db();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();
        assert!(db.append_relay_state(&relay("dev1", 5, true)).is_err());
    }

    #[test]
    fn telemetry_for_unknown_device_violates_foreign_key() {
        let db = db();
        let record = TelemetryRecord {
            device_id: "ghost".to_string(),
            timestamp: OffsetDateTime::now_utc(),
            sensor_type: Some("temperature".to_string()),
            value: Some(1.0),
            unit: None,
            voltage: None,
            current: None,
            power: None,
            temperature: None,
            humidity: None,
            metadata: json!({}),
        };
        assert!(db.insert_telemetry(&record).is_err());
    }

    #[test]
    fn message_log_filters_by_broker() {
        let db = db();
        for (broker, direction) in [("b1", MessageDirection::Sent), ("b2", MessageDirection::Received)] {
            db.log_message(&MessageLogEntry {
                broker_id: broker.to_string(),
                topic: "t".to_string(),
                payload: "p".to_string(),
                qos: 1,
                retain: false,
                direction,
                timestamp: OffsetDateTime::now_utc(),
            })
            .unwrap();
        }

        assert_eq!(db.recent_messages(None, 10).unwrap().len(), 2);
        let only_b2 = db.recent_messages(Some("b2"), 10).unwrap();
        assert_eq!(only_b2.len(), 1);
        assert_eq!(only_b2[0].direction, MessageDirection::Received);
    }

    fn reading(device_id: &str, sensor_type: &str, value: f64, age: Duration) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: OffsetDateTime::now_utc() - age,
            sensor_type: Some(sensor_type.to_string()),
            value: Some(value),
            unit: None,
            voltage: None,
            current: None,
            power: None,
            temperature: None,
            humidity: None,
            metadata: json!({}),
        }
    }

    #[test]
    fn statistics_cover_the_window_and_filters() {
        let db = db();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();
        db.register_device("dev2", "Fan", None, "IoT Device").unwrap();
        db.insert_telemetry(&reading("dev1", "temperature", 10.0, Duration::minutes(5))).unwrap();
        db.insert_telemetry(&reading("dev1", "temperature", 20.0, Duration::minutes(1))).unwrap();
        db.insert_telemetry(&reading("dev1", "humidity", 55.0, Duration::minutes(1))).unwrap();
        db.insert_telemetry(&reading("dev2", "temperature", 99.0, Duration::hours(30))).unwrap();

        let stats = db.telemetry_statistics(Some("dev1"), Some("temperature"), 24).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min_value, Some(10.0));
        assert_eq!(stats.max_value, Some(20.0));
        assert_eq!(stats.avg_value, Some(15.0));

        // The dev2 reading is outside the window.
        let stats = db.telemetry_statistics(None, Some("temperature"), 24).unwrap();
        assert_eq!(stats.count, 2);
        let stats = db.telemetry_statistics(Some("dev2"), None, 24).unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg_value, None);
        assert_eq!(db.telemetry_statistics(Some("dev2"), None, 48).unwrap().count, 1);

        assert_eq!(db.delete_telemetry(Some("dev1"), Some("humidity")).unwrap(), 1);
        assert_eq!(db.delete_telemetry(None, None).unwrap(), 3);
    }

    #[test]
    fn devices_filter_by_status_and_search() {
        let db = db();
        db.register_device("pump-1", "Garden pump", Some("Garden"), "IoT Device").unwrap();
        db.register_device("fan-1", "Attic fan", None, "IoT Device").unwrap();
        db.set_device_status("fan-1", "online", OffsetDateTime::now_utc()).unwrap();

        let online = db
            .find_devices(&DeviceFilter {
                status: Some("online".to_string()),
                ..DeviceFilter::default()
            })
            .unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].device_id, "fan-1");

        let garden = db
            .find_devices(&DeviceFilter {
                search: Some("GARDEN".to_string()),
                ..DeviceFilter::default()
            })
            .unwrap();
        assert_eq!(garden.len(), 1);
        assert_eq!(garden[0].device_id, "pump-1");

        let limited = db
            .find_devices(&DeviceFilter {
                limit: Some(1),
                ..DeviceFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(db.devices().unwrap().len(), 2);
    }

    #[test]
    fn deleting_a_device_drops_its_history() {
        let db = db();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();
        db.insert_telemetry(&reading("dev1", "temperature", 1.0, Duration::ZERO)).unwrap();
        db.append_relay_state(&relay("dev1", 1, true)).unwrap();

        assert!(db.delete_device("dev1").unwrap());
        assert!(!db.delete_device("dev1").unwrap());
        assert!(db.recent_telemetry("dev1", 10).unwrap().is_empty());
        assert!(db.current_relay_states("dev1").unwrap().is_empty());
    }

    #[test]
    fn clearing_messages_can_target_one_broker() {
        let db = db();
        for broker in ["b1", "b1", "b2"] {
            db.log_message(&MessageLogEntry {
                broker_id: broker.to_string(),
                topic: "t".to_string(),
                payload: "p".to_string(),
                qos: 0,
                retain: false,
                direction: MessageDirection::Received,
                timestamp: OffsetDateTime::now_utc(),
            })
            .unwrap();
        }
        assert_eq!(db.clear_messages(Some("b1")).unwrap(), 2);
        assert_eq!(db.clear_messages(None).unwrap(), 1);
        assert!(db.recent_messages(None, 10).unwrap().is_empty());
    }

    #[test]
    fn acknowledged_commands_are_never_marked_failed() {
        let db = db();
        let command = DeviceCommand {
            command_id: "c1".to_string(),
            broker_id: "b1".to_string(),
            device_id: "dev1".to_string(),
            command_type: "control".to_string(),
            payload: json!({}),
            status: CommandStatus::Sent,
            created_at: OffsetDateTime::now_utc(),
        };
        db.insert_command(&command).unwrap();
        db.acknowledge_command("c1", &json!({"ok": true}), OffsetDateTime::now_utc())
            .unwrap();
        assert!(!db.fail_command("c1").unwrap());
        assert_eq!(db.command_status("c1").unwrap(), Some(CommandStatus::Acknowledged));

        db.insert_command(&DeviceCommand {
            command_id: "c2".to_string(),
            ..command
        })
        .unwrap();
        assert!(db.fail_command("c2").unwrap());
        assert_eq!(db.command_status("c2").unwrap(), Some(CommandStatus::Failed));
    }

    #[tokio::test]
    async fn gateway_calls_run_off_the_scheduler() {
        let db = db();
        db.register_device("dev1", "Pump", None, "IoT Device").unwrap();

        let found = db.find_device("dev1").await.unwrap();
        assert_eq!(found.unwrap().name, "Pump");

        let acked = PersistenceGateway::acknowledge_command(
            &db,
            "missing",
            &json!({"ok": true}),
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
        assert!(!acked);
    }
}
