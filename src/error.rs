//! Error types for the broker manager.
//!
//! Management-API failures (`ManagerError`) are returned to the caller and map to
//! distinct HTTP statuses. Routing failures (`RouteError`) never leave the router.

use crate::models::BrokerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Blocking storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Broker '{0}' is not connected")]
    NotConnected(BrokerId),
    #[error("Broker '{0}' is already registered")]
    AlreadyExists(BrokerId),
    #[error("Broker '{0}' is unknown")]
    UnknownBroker(BrokerId),
    #[error("Broker '{broker_id}' did not acknowledge the connection within {timeout:?}")]
    ConnectTimeout { broker_id: BrokerId, timeout: Duration },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("{} broker(s) failed to shut down cleanly", failures.len())]
    ShutdownIncomplete { failures: Vec<(BrokerId, String)> },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl RouteError {
    pub(crate) fn malformed(topic: &str, reason: impl Into<String>) -> Self {
        RouteError::MalformedPayload {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Relay index {0} is outside 1..=4")]
    InvalidRelay(u8),
    #[error("Command payload must be a JSON object")]
    NotAnObject,
    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),
    #[error("No broker is active")]
    NoActiveBroker,
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl From<PersistenceError> for CommandError {
    fn from(e: PersistenceError) -> Self {
        CommandError::Manager(ManagerError::Persistence(e))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic must not be empty")]
    Empty,
    #[error("Topic exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Wildcards are not allowed in topic names: '{0}'")]
    WildcardInName(String),
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidWildcard(String),
    #[error("Route filter '{0}' has no '+' level to carry the device id")]
    MissingDeviceLevel(String),
}
