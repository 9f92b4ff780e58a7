use crate::connection_test::test_connection;
use crate::db::DatabaseService;
use crate::models::{BrokerConfig, ConnectionTestResult, SensorReading, StartOutcome, DEFAULT_BROKER_PORT};
use crate::worker::WorkerRuntime;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Deserialize, Serialize};
use rocket::{get, post, put, routes, Build, Rocket, State};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

const PASSWORD_MASK: &str = "********";

/// Everything the handlers need, shared by all requests of this worker.
pub struct AppState {
    pub runtime: Arc<WorkerRuntime>,
    pub db: Arc<DatabaseService>,
    pub test_timeout: Duration,
}

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct StatusResponse {
    enabled: bool,
    connected: bool,
    owner: bool,
    weight: Option<SensorReading>,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct TestRequest {
    host: String,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default)]
    use_tls: bool,
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

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "BrewScale weight sensor service".to_string(),
    })
}

/// Link state and latest weight, answered from the shared store so every
/// worker gives the same answer.
#[get("/mqtt/status")]
async fn mqtt_status(state: &State<AppState>) -> Json<StatusResponse> {
    let enabled = match state.db.load_broker_config() {
        Ok(config) => config.map(|c| c.enabled).unwrap_or(false),
        Err(e) => {
            error!("Failed to read MQTT config: {}", e);
            false
        }
    };
    let service = state.runtime.service();

    Json(StatusResponse {
        enabled,
        connected: service.is_connected().await,
        owner: state.runtime.is_owner(),
        weight: service.latest_weight(),
    })
}

#[get("/mqtt/weight")]
fn latest_weight(state: &State<AppState>) -> Result<Json<SensorReading>, Status> {
    match state.runtime.service().latest_weight() {
        Some(reading) => Ok(Json(reading)),
        None => Err(Status::NotFound),
    }
}

#[get("/mqtt/config")]
fn get_config(state: &State<AppState>) -> Result<Json<BrokerConfig>, Status> {
    match state.db.load_broker_config() {
        Ok(config) => {
            let mut config = config.unwrap_or_default();
            if config.password.as_deref().is_some_and(|p| !p.is_empty()) {
                config.password = Some(PASSWORD_MASK.to_string());
            }
            Ok(Json(config))
        }
        Err(e) => {
            error!("Failed to read MQTT config: {}", e);
            Err(Status::InternalServerError)
        }
    }
}

/// Saves broker settings. A masked password keeps the stored one.
#[put("/mqtt/config", data = "<payload>")]
async fn put_config(payload: Json<BrokerConfig>, state: &State<AppState>) -> Result<Json<ApiResponse>, Status> {
    let mut config = payload.into_inner();
    if config.password.as_deref() == Some(PASSWORD_MASK) {
        config.password = match state.db.load_broker_config() {
            Ok(stored) => stored.and_then(|stored| stored.password),
            Err(e) => {
                error!("Failed to read MQTT config: {}", e);
                return Err(Status::InternalServerError);
            }
        };
    }

    match state.runtime.apply_config(config).await {
        Ok(Some(outcome)) => Ok(Json(ApiResponse {
            status: if outcome == StartOutcome::MissingHost { "error" } else { "success" }.to_string(),
            message: format!("MQTT settings saved ({:?})", outcome),
        })),
        Ok(None) => Ok(Json(ApiResponse {
            status: "success".to_string(),
            message: "MQTT settings saved; the owning worker applies them shortly".to_string(),
        })),
        Err(e) => {
            error!("Failed to save MQTT config: {}", e);
            Err(Status::InternalServerError)
        }
    }
}

#[post("/mqtt/test", data = "<payload>")]
async fn test_broker(payload: Json<TestRequest>, state: &State<AppState>) -> Json<ConnectionTestResult> {
    let request = payload.into_inner();
    Json(
        test_connection(
            &request.host,
            request.port.unwrap_or(DEFAULT_BROKER_PORT),
            request.username.as_deref(),
            request.password.as_deref(),
            request.use_tls,
            state.test_timeout,
        )
        .await,
    )
}

pub fn build_rocket(state: AppState, figment: rocket::figment::Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![root_handler, mqtt_status, latest_weight, get_config, put_config, test_broker],
        )
        .attach(Cors)
}

/// Run the Rocket server for this worker.
pub async fn run_rest_server(state: AppState, address: &str, port: u16) -> Result<(), rocket::Error> {
    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port));
    build_rocket(state, figment).launch().await?;
    Ok(())
}
