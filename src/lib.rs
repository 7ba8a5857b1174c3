pub mod broker_connection;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod loopback;
pub mod models;
pub mod registry;
pub mod rest_server;
pub mod router;
pub mod service_utils;
pub mod topic;
pub mod transport;
pub mod validation;

pub use broker_connection::{BrokerConnection, ConnectionContext, ConnectionSnapshot};
pub use error::{CommandError, ManagerError, PersistenceError, RouteError, TopicError};
pub use registry::ConnectionRegistry;
pub use router::{MessageRouter, RouteOutcome, TopicLayout};
