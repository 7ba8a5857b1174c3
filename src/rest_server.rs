use crate::commands::DeviceCommander;
use crate::db::{DatabaseService, DeviceFilter};
use crate::error::{CommandError, ManagerError, PersistenceError};
use crate::events::BroadcastEventSink;
use crate::models::{
    BrokerConfig, BrokerStatus, CommandStatus, Device, DeviceCommand, MessageLogEntry,
    RelayState, TelemetryRecord, TelemetryStatistics,
};
use crate::registry::ConnectionRegistry;
use crate::validation::{self, ValidationError};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::response::status::Custom;
use rocket::response::stream::{Event, EventStream};
use rocket::response::{self, Responder};
use rocket::serde::json::{Json, Value};
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::select;
use rocket::tokio::sync::broadcast::error::RecvError;
use rocket::{catch, catchers, delete, get, post, put, routes, Build, Request, Rocket, Shutdown, State};
use std::sync::Arc;
use tracing::error;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_DEVICE_TYPE: &str = "IoT Device";
const DEFAULT_TELEMETRY_LIMIT: usize = 100;
const MAX_TELEMETRY_LIMIT: usize = 1000;
const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;
const MAX_DEVICE_LIMIT: usize = 1000;
const DEFAULT_STATISTICS_HOURS: u32 = 24;
const MAX_STATISTICS_HOURS: u32 = 24 * 365;

/// Everything the handlers need, managed as one piece of Rocket state.
pub struct ApiState {
    pub registry: Arc<ConnectionRegistry>,
    pub db: DatabaseService,
    pub commander: Arc<DeviceCommander>,
    pub events: BroadcastEventSink,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: Status,
    message: String,
}

impl ApiError {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str, id: &str) -> Self {
        Self::new(Status::NotFound, format!("{} '{}' not found", what, id))
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        Custom(self.status, Json(ErrorBody { error: self.message })).respond_to(req)
    }
}

impl From<PersistenceError> for ApiError {
    fn from(e: PersistenceError) -> Self {
        error!(error = %e, "Storage failure while serving request");
        ApiError::new(Status::InternalServerError, "storage error")
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::new(Status::UnprocessableEntity, e.to_string())
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        let status = match &e {
            ManagerError::NotConnected(_) | ManagerError::AlreadyExists(_) => Status::Conflict,
            ManagerError::UnknownBroker(_) => Status::NotFound,
            ManagerError::ConnectTimeout { .. } => Status::GatewayTimeout,
            ManagerError::Transport(_) => Status::BadGateway,
            ManagerError::InvalidTopic(_) => Status::UnprocessableEntity,
            ManagerError::Persistence(_) | ManagerError::ShutdownIncomplete { .. } => {
                error!(error = %e, "Broker manager failure while serving request");
                return ApiError::new(Status::InternalServerError, "internal error");
            }
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Manager(inner) => inner.into(),
            CommandError::UnknownDevice(_) => ApiError::new(Status::NotFound, e.to_string()),
            CommandError::NoActiveBroker => ApiError::new(Status::Conflict, e.to_string()),
            CommandError::InvalidRelay(_) | CommandError::NotAnObject => {
                ApiError::new(Status::UnprocessableEntity, e.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct BrokerRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerRequest {
    fn into_config(self) -> Result<BrokerConfig, ValidationError> {
        let port = self.port.unwrap_or(DEFAULT_MQTT_PORT);
        let config = BrokerConfig {
            name: self
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{}:{}", self.host, port)),
            host: self.host,
            port,
            username: self.username.filter(|u| !u.is_empty()),
            password: self.password.filter(|p| !p.is_empty()),
        };
        validation::broker_config(&config)?;
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct SubscriptionRequest {
    pub topic: String,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct DeviceRequest {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
    pub device_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct RelayRequest {
    pub state: bool,
    pub broker_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct CommandRequest {
    pub broker_id: Option<String>,
    pub command: Value,
}

#[derive(Default, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct StatusRequest {
    pub broker_id: Option<String>,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct CommandStatusResponse {
    command_id: String,
    status: CommandStatus,
}

fn ok(message: impl Into<String>) -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: message.into(),
    })
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE",
        ));
        res.set_header(Header::new("Access-Control-Allow-Headers", "Content-Type"));
    }
}

#[get("/")]
fn root_handler(state: &State<ApiState>) -> Json<Value> {
    Json(rocket::serde::json::json!({
        "status": "ok",
        "active_brokers": state.registry.broker_ids(),
    }))
}

// Brokers

#[get("/brokers")]
async fn list_brokers(state: &State<ApiState>) -> ApiResult<Json<Vec<BrokerStatus>>> {
    Ok(Json(state.registry.get_all_statuses().await?))
}

#[get("/brokers/<broker_id>")]
async fn broker_status(broker_id: &str, state: &State<ApiState>) -> ApiResult<Json<BrokerStatus>> {
    Ok(Json(state.registry.get_status(broker_id).await?))
}

/// Stores the broker and activates it. A broker that cannot be reached stays
/// in the catalog as inactive.
#[post("/brokers", data = "<request>")]
async fn add_broker(
    request: Json<BrokerRequest>,
    state: &State<ApiState>,
) -> ApiResult<Custom<Json<BrokerStatus>>> {
    let request = request.into_inner();
    let broker_id = request.id.clone().ok_or(ValidationError::Missing("id"))?;
    validation::broker_id(&broker_id)?;
    let config = request.into_config()?;

    state.registry.create_broker(&broker_id, config).await?;
    let status = state.registry.get_status(&broker_id).await?;
    Ok(Custom(Status::Created, Json(status)))
}

/// Replaces the stored config. A live connection is torn down and rebuilt.
#[put("/brokers/<broker_id>", data = "<request>")]
async fn update_broker(
    broker_id: &str,
    request: Json<BrokerRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<BrokerStatus>> {
    validation::broker_id(broker_id)?;
    let config = request.into_inner().into_config()?;
    state.registry.update_broker(broker_id, config).await?;
    Ok(Json(state.registry.get_status(broker_id).await?))
}

#[delete("/brokers/<broker_id>")]
async fn delete_broker(broker_id: &str, state: &State<ApiState>) -> ApiResult<Status> {
    validation::broker_id(broker_id)?;
    let was_registered = state.registry.remove_broker(broker_id).await?;
    let id = broker_id.to_string();
    let was_stored = state.db.blocking(move |db| db.delete_broker(&id)).await?;
    if !was_registered && !was_stored {
        return Err(ManagerError::UnknownBroker(broker_id.to_string()).into());
    }
    Ok(Status::NoContent)
}

#[post("/brokers/<broker_id>/connect")]
async fn connect_broker(broker_id: &str, state: &State<ApiState>) -> ApiResult<Json<BrokerStatus>> {
    validation::broker_id(broker_id)?;
    state.registry.connect_broker(broker_id).await?;
    Ok(Json(state.registry.get_status(broker_id).await?))
}

#[post("/brokers/<broker_id>/disconnect")]
async fn disconnect_broker(
    broker_id: &str,
    state: &State<ApiState>,
) -> ApiResult<Json<BrokerStatus>> {
    validation::broker_id(broker_id)?;
    state.registry.disconnect_broker(broker_id).await?;
    Ok(Json(state.registry.get_status(broker_id).await?))
}

#[post("/brokers/<broker_id>/publish", data = "<request>")]
async fn publish(
    broker_id: &str,
    request: Json<PublishRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<ApiResponse>> {
    let request = request.into_inner();
    let payload = match request.payload {
        Value::String(text) => text,
        other => other.to_string(),
    };
    validation::publish_request(&request.topic, &payload)?;
    let qos = validation::qos(request.qos.unwrap_or(0))?;

    state
        .registry
        .publish_to(
            broker_id,
            &request.topic,
            payload.into_bytes(),
            qos,
            request.retain.unwrap_or(false),
        )
        .await?;
    Ok(ok(format!("Published to '{}'", request.topic)))
}

#[post("/brokers/<broker_id>/subscribe", data = "<request>")]
async fn subscribe(
    broker_id: &str,
    request: Json<SubscriptionRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<ApiResponse>> {
    validation::subscription_filter(&request.topic)?;
    state.registry.subscribe_on(broker_id, &request.topic).await?;
    Ok(ok(format!("Subscribed to '{}'", request.topic)))
}

#[post("/brokers/<broker_id>/unsubscribe", data = "<request>")]
async fn unsubscribe(
    broker_id: &str,
    request: Json<SubscriptionRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<ApiResponse>> {
    validation::subscription_filter(&request.topic)?;
    state.registry.unsubscribe_on(broker_id, &request.topic).await?;
    Ok(ok(format!("Unsubscribed from '{}'", request.topic)))
}

// Devices

/// Lists devices, optionally narrowed to one `status` and to those whose id,
/// name or location contains `q`.
#[get("/devices?<status>&<q>&<limit>")]
async fn list_devices(
    status: Option<&str>,
    q: Option<&str>,
    limit: Option<usize>,
    state: &State<ApiState>,
) -> ApiResult<Json<Vec<Device>>> {
    if let Some(status) = status {
        validation::name("status", status)?;
    }
    if let Some(q) = q {
        validation::name("q", q)?;
    }
    let filter = DeviceFilter {
        status: status.map(str::to_string),
        search: q.map(str::to_string),
        limit: limit.map(|l| l.clamp(1, MAX_DEVICE_LIMIT)),
    };
    Ok(Json(state.db.blocking(move |db| db.find_devices(&filter)).await?))
}

#[post("/devices", data = "<request>")]
async fn register_device(
    request: Json<DeviceRequest>,
    state: &State<ApiState>,
) -> ApiResult<Custom<Json<Device>>> {
    let request = request.into_inner();
    validation::device_id(&request.device_id)?;
    validation::name("name", &request.name)?;
    if let Some(location) = &request.location {
        validation::name("location", location)?;
    }
    let device_type = request
        .device_type
        .unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string());
    validation::name("device_type", &device_type)?;

    let device = state
        .db
        .blocking(move |db| {
            db.register_device(
                &request.device_id,
                &request.name,
                request.location.as_deref(),
                &device_type,
            )
        })
        .await?;
    Ok(Custom(Status::Created, Json(device)))
}

#[get("/devices/<device_id>")]
async fn device(device_id: &str, state: &State<ApiState>) -> ApiResult<Json<Device>> {
    let id = device_id.to_string();
    state
        .db
        .blocking(move |db| db.device(&id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("device", device_id))
}

/// Removes the device together with its telemetry and relay history.
#[delete("/devices/<device_id>")]
async fn delete_device(device_id: &str, state: &State<ApiState>) -> ApiResult<Status> {
    validation::device_id(device_id)?;
    let id = device_id.to_string();
    if state.db.blocking(move |db| db.delete_device(&id)).await? {
        Ok(Status::NoContent)
    } else {
        Err(ApiError::not_found("device", device_id))
    }
}

#[get("/devices/<device_id>/telemetry?<limit>")]
async fn telemetry(
    device_id: &str,
    limit: Option<usize>,
    state: &State<ApiState>,
) -> ApiResult<Json<Vec<TelemetryRecord>>> {
    let limit = limit
        .unwrap_or(DEFAULT_TELEMETRY_LIMIT)
        .clamp(1, MAX_TELEMETRY_LIMIT);
    let id = device_id.to_string();
    Ok(Json(
        state
            .db
            .blocking(move |db| db.recent_telemetry(&id, limit))
            .await?,
    ))
}

#[get("/devices/<device_id>/relays")]
async fn relays(device_id: &str, state: &State<ApiState>) -> ApiResult<Json<Vec<RelayState>>> {
    let id = device_id.to_string();
    Ok(Json(
        state
            .db
            .blocking(move |db| db.current_relay_states(&id))
            .await?,
    ))
}

// Telemetry

#[get("/telemetry/statistics?<device_id>&<sensor_type>&<hours>")]
async fn telemetry_statistics(
    device_id: Option<&str>,
    sensor_type: Option<&str>,
    hours: Option<u32>,
    state: &State<ApiState>,
) -> ApiResult<Json<TelemetryStatistics>> {
    let hours = hours
        .unwrap_or(DEFAULT_STATISTICS_HOURS)
        .clamp(1, MAX_STATISTICS_HOURS);
    let device_id = device_id.map(str::to_string);
    let sensor_type = sensor_type.map(str::to_string);
    let statistics = state
        .db
        .blocking(move |db| {
            db.telemetry_statistics(device_id.as_deref(), sensor_type.as_deref(), hours)
        })
        .await?;
    Ok(Json(statistics))
}

/// Deletes stored readings. Without filters every reading goes.
#[delete("/telemetry?<device_id>&<sensor_type>")]
async fn delete_telemetry(
    device_id: Option<&str>,
    sensor_type: Option<&str>,
    state: &State<ApiState>,
) -> ApiResult<Json<ApiResponse>> {
    let device = device_id.map(str::to_string);
    let sensor = sensor_type.map(str::to_string);
    let removed = state
        .db
        .blocking(move |db| db.delete_telemetry(device.as_deref(), sensor.as_deref()))
        .await?;
    Ok(ok(format!("Deleted {} telemetry records", removed)))
}

#[post("/devices/<device_id>/relay/<relay>", data = "<request>")]
async fn control_relay(
    device_id: &str,
    relay: u8,
    request: Json<RelayRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<DeviceCommand>> {
    let relay = validation::relay_index(relay)?;
    let command = state
        .commander
        .send_relay_command(request.broker_id.as_deref(), device_id, relay, request.state)
        .await?;
    Ok(Json(command))
}

#[post("/devices/<device_id>/commands", data = "<request>")]
async fn send_command(
    device_id: &str,
    request: Json<CommandRequest>,
    state: &State<ApiState>,
) -> ApiResult<Json<DeviceCommand>> {
    let request = request.into_inner();
    let command = state
        .commander
        .send_control_command(request.broker_id.as_deref(), device_id, request.command)
        .await?;
    Ok(Json(command))
}

#[post("/devices/<device_id>/status-request", data = "<request>")]
async fn request_status(
    device_id: &str,
    request: Option<Json<StatusRequest>>,
    state: &State<ApiState>,
) -> ApiResult<Json<DeviceCommand>> {
    let request = request.map(Json::into_inner).unwrap_or_default();
    let command = state
        .commander
        .request_device_status(request.broker_id.as_deref(), device_id)
        .await?;
    Ok(Json(command))
}

#[get("/commands/<command_id>")]
async fn command_status(
    command_id: &str,
    state: &State<ApiState>,
) -> ApiResult<Json<CommandStatusResponse>> {
    let id = command_id.to_string();
    let status = state
        .db
        .blocking(move |db| db.command_status(&id))
        .await?
        .ok_or_else(|| ApiError::not_found("command", command_id))?;
    Ok(Json(CommandStatusResponse {
        command_id: command_id.to_string(),
        status,
    }))
}

#[get("/messages?<broker_id>&<limit>")]
async fn messages(
    broker_id: Option<&str>,
    limit: Option<usize>,
    state: &State<ApiState>,
) -> ApiResult<Json<Vec<MessageLogEntry>>> {
    let limit = limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).clamp(1, MAX_MESSAGE_LIMIT);
    let broker_id = broker_id.map(str::to_string);
    Ok(Json(
        state
            .db
            .blocking(move |db| db.recent_messages(broker_id.as_deref(), limit))
            .await?,
    ))
}

#[delete("/messages?<broker_id>")]
async fn clear_messages(
    broker_id: Option<&str>,
    state: &State<ApiState>,
) -> ApiResult<Json<ApiResponse>> {
    let broker_id = broker_id.map(str::to_string);
    let removed = state
        .db
        .blocking(move |db| db.clear_messages(broker_id.as_deref()))
        .await?;
    Ok(ok(format!("Deleted {} logged messages", removed)))
}

/// Live updates as server-sent events, one event per published update.
#[get("/events")]
fn events(state: &State<ApiState>, mut shutdown: Shutdown) -> EventStream![] {
    let mut rx = state.events.subscribe();
    EventStream! {
        loop {
            let live = select! {
                received = rx.recv() => match received {
                    Ok(live) => live,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&live.payload).event(live.event);
        }
    }
}

#[catch(default)]
fn default_catcher(status: Status, _req: &Request<'_>) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: status.reason_lossy().to_string(),
    })
}

pub fn build_rocket(state: ApiState) -> Rocket<Build> {
    rocket::build()
        .manage(state)
        .mount("/", routes![root_handler, events])
        .mount(
            "/api",
            routes![
                list_brokers,
                broker_status,
                add_broker,
                update_broker,
                delete_broker,
                connect_broker,
                disconnect_broker,
                publish,
                subscribe,
                unsubscribe,
                list_devices,
                register_device,
                device,
                delete_device,
                telemetry,
                relays,
                telemetry_statistics,
                delete_telemetry,
                control_relay,
                send_command,
                request_status,
                command_status,
                messages,
                clear_messages,
            ],
        )
        .register("/", catchers![default_catcher])
        .attach(Cors)
}
