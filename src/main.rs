use broker_flux::broker_connection::ConnectionContext;
use broker_flux::commands::DeviceCommander;
use broker_flux::config::{Config, TransportKind};
use broker_flux::db::DatabaseService;
use broker_flux::events::BroadcastEventSink;
use broker_flux::gateway::PersistenceGateway;
use broker_flux::loopback::LoopbackBroker;
use broker_flux::registry::ConnectionRegistry;
use broker_flux::rest_server::{build_rocket, ApiState};
use broker_flux::router::MessageRouter;
use broker_flux::service_utils::{activate_configured_brokers, handle_shutdown, seed_broker};
use broker_flux::transport::{Connector, MqttConnector};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!(path = %config.database_path, "Database initialized successfully.");

    if let Some(seed) = &config.seed_broker {
        if let Err(e) = seed_broker(&db_service, seed) {
            error!("Failed to seed broker from environment: {:?}", e);
            return;
        }
    }

    let connector: Arc<dyn Connector> = match config.mqtt_transport {
        TransportKind::Mqtt => Arc::new(MqttConnector {
            client_id_prefix: config.mqtt_client_id_prefix.clone(),
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            channel_capacity: config.mqtt_channel_capacity,
        }),
        TransportKind::Loopback => {
            warn!("Using the in-process loopback broker; no real devices will be reached");
            Arc::new(LoopbackBroker::new())
        }
    };

    let layout = config.topic_layout();
    let routes = match layout.routes() {
        Ok(routes) => routes,
        Err(e) => {
            error!("Invalid topic layout: {}", e);
            return;
        }
    };

    let events = BroadcastEventSink::new(config.event_buffer);
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(db_service.clone());
    let router = Arc::new(MessageRouter::new(
        routes,
        gateway.clone(),
        Arc::new(events.clone()),
    ));
    let registry = Arc::new(
        ConnectionRegistry::new(ConnectionContext {
            connector,
            gateway: gateway.clone(),
            router,
            subscribe_qos: QoS::AtLeastOnce,
        })
        .with_connect_timeout(config.connect_timeout()),
    );

    // Brokers left active by the last run
    match activate_configured_brokers(&registry, gateway.as_ref(), &config).await {
        Ok(report) => info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Broker activation finished"
        ),
        Err(e) => error!(error = %e, "Could not read broker catalog"),
    }

    let commander = Arc::new(DeviceCommander::new(registry.clone(), gateway, layout));
    let rocket = match build_rocket(ApiState {
        registry: registry.clone(),
        db: db_service,
        commander,
        events,
    })
    .ignite()
    .await
    {
        Ok(rocket) => rocket,
        Err(e) => {
            error!("Failed to configure REST server: {}", e);
            let _ = registry.shutdown_all().await;
            return;
        }
    };

    // Start REST API server
    let rest_shutdown = rocket.shutdown();
    let rest_api_task = tokio::spawn(async move {
        if let Err(e) = rocket.launch().await {
            error!("REST server stopped with error: {}", e);
        }
    });

    handle_shutdown(registry).await;
    rest_shutdown.notify();

    let _ = tokio::join!(rest_api_task);
    info!("All services shut down successfully.");
}
