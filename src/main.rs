use brew_scale::config::Config;
use brew_scale::db::DatabaseService;
use brew_scale::mqtt_service::MqttService;
use brew_scale::rest_server::{run_rest_server, AppState};
use brew_scale::service_utils::{handle_shutdown, init_tracing};
use brew_scale::worker::WorkerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(tracing::Level::INFO);
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    // Initialize logging
    init_tracing(config.tracing_level());

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    // Every worker builds the service; only the lock holder starts a session.
    let mqtt_service = MqttService::new(db_service.clone(), config.clone());
    let runtime = WorkerRuntime::bootstrap(&config, db_service.clone(), mqtt_service).await;
    let reconciler = runtime.spawn_reconciler(config.config_poll_interval());

    // Start REST API server
    let state = AppState {
        runtime: runtime.clone(),
        db: db_service.clone(),
        test_timeout: config.test_timeout(),
    };
    let address = config.http_address.clone();
    let port = config.http_port;
    let mut rest_api_task = tokio::spawn(async move {
        if let Err(e) = run_rest_server(state, &address, port).await {
            error!("REST server failed: {}", e);
        }
    });

    handle_shutdown(runtime, &mut rest_api_task).await;

    if let Some(reconciler) = reconciler {
        reconciler.abort();
    }

    // Rocket stops on the same signals; don't hang if it already finished
    if !rest_api_task.is_finished()
        && tokio::time::timeout(Duration::from_secs(10), &mut rest_api_task).await.is_err()
    {
        warn!("REST server did not stop in time, aborting it");
        rest_api_task.abort();
    }
    info!("All services shut down successfully.");
}
