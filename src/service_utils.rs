use crate::worker::WorkerRuntime;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Initialize logging. `log` records from the db layer are forwarded too.
pub fn init_tracing(level: tracing::Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Wait for ctrl-c, SIGTERM or the REST server ending on its own, then stop
/// MQTT and release the owner lock.
///
/// Rocket reacts to SIGTERM itself, so the server finishing is treated as a
/// shutdown request too; so is a launch failure.
pub async fn handle_shutdown<F>(runtime: Arc<WorkerRuntime>, server: F)
where
    F: Future,
{
    let pid = std::process::id();
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => match interrupted {
            Ok(()) => info!("Worker {} received ctrl-c, shutting down...", pid),
            Err(e) => error!("Failed to handle termination signal: {:?}", e),
        },
        _ = terminate_signal() => info!("Worker {} received SIGTERM, shutting down...", pid),
        _ = server => warn!("Worker {}: REST server stopped, shutting down...", pid),
    }

    runtime.shutdown().await;
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            terminate.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::tests::temp_db;
    use crate::election::OwnerLock;
    use crate::models::SensorReading;
    use crate::mqtt_service::MqttService;

    #[tokio::test]
    async fn server_exit_releases_ownership() {
        let (dir, db) = temp_db();
        let db = Arc::new(db);
        let config = Config {
            lock_file_path: dir.path().join("owner.lock"),
            stop_timeout_secs: 2,
            ..Config::default()
        };
        let runtime = WorkerRuntime::bootstrap(&config, db.clone(), MqttService::new(db.clone(), config.clone())).await;
        assert!(runtime.is_owner());
        db.upsert_reading(&SensorReading::now(7.5)).unwrap();

        // a server task that already ended, as after SIGTERM or a bind failure
        let server = tokio::spawn(async {});
        tokio::time::timeout(std::time::Duration::from_secs(5), handle_shutdown(runtime, server))
            .await
            .unwrap();

        assert!(OwnerLock::try_acquire(&config.lock_file_path).unwrap().is_some());
        assert!(db.read_live_weight().unwrap().is_none());
    }
}
