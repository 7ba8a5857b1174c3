use crate::config::{Config, SeedBroker};
use crate::db::DatabaseService;
use crate::error::{ManagerError, PersistenceError};
use crate::gateway::PersistenceGateway;
use crate::registry::ConnectionRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Outcome of the startup sweep over the broker catalog.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Put the environment-provided broker into the catalog unless it already exists.
pub fn seed_broker(db: &DatabaseService, seed: &SeedBroker) -> Result<(), PersistenceError> {
    if db.validate_or_add_broker(&seed.broker_id, &seed.config)? {
        info!(broker = %seed.broker_id, host = %seed.config.host, "Seed broker added to catalog");
    }
    Ok(())
}

/// Backoff doubling from `interval`, capped at a minute, `retries` extra attempts.
pub fn retry_strategy(interval: Duration, retries: usize) -> impl Iterator<Item = Duration> + Clone {
    let factor = (interval.as_millis() / 2).max(1) as u64;
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(MAX_RETRY_DELAY)
        .take(retries)
}

fn is_transient(error: &ManagerError) -> bool {
    matches!(
        error,
        ManagerError::ConnectTimeout { .. } | ManagerError::Transport(_)
    )
}

/// Connects every broker marked active in the catalog. Brokers are tried
/// concurrently; each one gets its own retry budget.
pub async fn activate_configured_brokers(
    registry: &ConnectionRegistry,
    gateway: &dyn PersistenceGateway,
    config: &Config,
) -> Result<ActivationReport, ManagerError> {
    let active: Vec<String> = gateway
        .list_brokers()
        .await?
        .into_iter()
        .filter(|record| record.is_active)
        .map(|record| record.id)
        .collect();

    if active.is_empty() {
        info!("No active brokers in catalog");
        return Ok(ActivationReport::default());
    }
    info!(count = active.len(), "Activating brokers from catalog");

    let strategy = retry_strategy(config.retry_interval(), config.startup_retries());
    let attempts = active.iter().map(|broker_id| {
        let strategy = strategy.clone();
        async move {
            let result = RetryIf::start(
                strategy,
                || async move {
                    let result = registry.connect_broker(broker_id).await;
                    if let Err(e) = &result {
                        warn!(broker = %broker_id, error = %e, "Broker activation attempt failed");
                    }
                    result
                },
                is_transient,
            )
            .await;
            (broker_id.clone(), result)
        }
    });

    let mut report = ActivationReport::default();
    for (broker_id, result) in join_all(attempts).await {
        match result {
            Ok(()) => report.connected.push(broker_id),
            Err(e) => {
                error!(broker = %broker_id, error = %e, "Giving up on broker");
                report.failed.push((broker_id, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Waits for Ctrl-C, then disconnects every broker.
pub async fn handle_shutdown(registry: Arc<ConnectionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Termination signal received, shutting down...");
    }

    match registry.shutdown_all().await {
        Ok(()) => info!("All broker connections closed."),
        Err(e) => error!(error = %e, "Shutdown finished with errors"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_connection::ConnectionContext;
    use crate::config::TransportKind;
    use crate::events::BroadcastEventSink;
    use crate::loopback::{ConnectMode, LoopbackBroker};
    use crate::models::BrokerConfig;
    use crate::router::{MessageRouter, TopicLayout};
    use rumqttc::QoS;

    fn config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            mqtt_transport: TransportKind::Loopback,
            mqtt_client_id_prefix: "test".to_string(),
            mqtt_keep_alive_secs: 60,
            mqtt_connect_timeout_ms: 100,
            mqtt_channel_capacity: 10,
            mqtt_max_retries: 2,
            mqtt_retry_interval_ms: 100,
            topic_prefix: "iot/devices".to_string(),
            topic_telemetry: "telemetry".to_string(),
            topic_status: "status".to_string(),
            topic_control: "control".to_string(),
            event_buffer: 16,
            seed_broker: None,
        }
    }

    fn broker(host: &str) -> BrokerConfig {
        BrokerConfig {
            name: host.to_string(),
            host: host.to_string(),
            port: 1883,
            username: None,
            password: None,
        }
    }

    #[test]
    fn retry_delays_double_and_are_capped() {
        let delays: Vec<Duration> = retry_strategy(Duration::from_secs(20), 4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(20),
                Duration::from_secs(40),
                MAX_RETRY_DELAY,
                MAX_RETRY_DELAY,
            ]
        );
        assert_eq!(retry_strategy(Duration::from_secs(1), 0).count(), 0);
    }

    #[tokio::test]
    async fn activates_active_brokers_and_reports_failures() {
        let bus = LoopbackBroker::new();
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db.upsert_broker("good", &broker("good")).unwrap();
        db.upsert_broker("refused", &broker("refused")).unwrap();
        db.upsert_broker("parked", &broker("parked")).unwrap();
        db.set_broker_active("parked", false).unwrap();
        bus.set_connect_mode("refused", ConnectMode::Refuse("not authorized".to_string()));

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(db.clone());
        let router = MessageRouter::new(
            TopicLayout::default().routes().unwrap(),
            gateway.clone(),
            Arc::new(BroadcastEventSink::new(8)),
        );
        let registry = ConnectionRegistry::new(ConnectionContext {
            connector: Arc::new(bus.clone()),
            gateway: gateway.clone(),
            router: Arc::new(router),
            subscribe_qos: QoS::AtMostOnce,
        })
        .with_connect_timeout(Duration::from_millis(100));

        let report = activate_configured_brokers(&registry, gateway.as_ref(), &config())
            .await
            .unwrap();

        assert_eq!(report.connected, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "refused");
        assert_eq!(registry.broker_ids(), vec!["good".to_string()]);
        // Initial attempt plus two retries.
        assert_eq!(bus.opened(), 1 + 3);
    }

    #[test]
    fn seed_broker_does_not_overwrite_catalog() {
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db.upsert_broker("default", &broker("edited")).unwrap();

        let seed = SeedBroker {
            broker_id: "default".to_string(),
            config: broker("from-env"),
        };
        seed_broker(&db, &seed).unwrap();
        assert_eq!(db.broker("default").unwrap().unwrap().config.host, "edited");
    }
}
