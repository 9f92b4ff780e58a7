use crate::config::Config;
use crate::db::{DatabaseService, DbError};
use crate::election::OwnerLock;
use crate::models::{BrokerConfig, StartOutcome};
use crate::mqtt_service::MqttService;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Per-process lifecycle: election at startup, config changes while
/// running, release at shutdown.
pub struct WorkerRuntime {
    service: Arc<MqttService>,
    db: Arc<DatabaseService>,
    lock: Mutex<Option<OwnerLock>>,
    // last stored settings `start` refused, so polling does not retry them
    rejected: Mutex<Option<BrokerConfig>>,
    owner: bool,
}

impl WorkerRuntime {
    /// Tries to become the MQTT owner and, if that works, starts the session
    /// with whatever broker settings are stored.
    pub async fn bootstrap(config: &Config, db: Arc<DatabaseService>, service: Arc<MqttService>) -> Arc<Self> {
        let pid = std::process::id();
        let lock = match OwnerLock::try_acquire(&config.lock_file_path) {
            Ok(Some(lock)) => {
                info!("Worker {} acquired MQTT lock and is starting MQTT", pid);
                Some(lock)
            }
            Ok(None) => {
                info!("Worker {}: MQTT handled by another worker", pid);
                None
            }
            Err(e) => {
                error!(
                    "Worker {} could not open MQTT lock file {}: {}",
                    pid,
                    config.lock_file_path.display(),
                    e
                );
                None
            }
        };

        let runtime = Arc::new(Self {
            owner: lock.is_some(),
            lock: Mutex::new(lock),
            rejected: Mutex::new(None),
            service,
            db,
        });

        if runtime.owner {
            match runtime.db.load_broker_config() {
                Ok(stored) => {
                    let outcome = runtime.reconfigure(stored.unwrap_or_default()).await;
                    info!("MQTT start on bootstrap: {:?}", outcome);
                }
                Err(e) => error!("Failed to load MQTT config: {}", e),
            }
        }
        runtime
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn service(&self) -> &Arc<MqttService> {
        &self.service
    }

    /// Persists new broker settings; the owner applies them at once, other
    /// workers leave it to the owner's reconciler.
    pub async fn apply_config(&self, broker: BrokerConfig) -> Result<Option<StartOutcome>, DbError> {
        self.db.save_broker_config(&broker)?;

        let lock = self.lock.lock().await;
        if lock.is_none() {
            info!("MQTT config saved; the owning worker will pick it up");
            return Ok(None);
        }
        Ok(Some(self.reconfigure(broker).await))
    }

    /// Owner only: restart the session when the stored settings differ from
    /// the ones it runs with. Returns whether anything changed. A worker that
    /// already shut down does nothing.
    pub async fn reconcile(&self) -> Result<bool, DbError> {
        // held throughout so a concurrent shutdown cannot be undone
        let lock = self.lock.lock().await;
        if lock.is_none() {
            return Ok(false);
        }

        let stored = self.db.load_broker_config()?.unwrap_or_default();
        let active = self.service.active_config().await;
        let running = self.service.is_running().await;

        let unchanged = match &active {
            Some(active) => running && *active == stored,
            // nothing running and nothing wanted, or already refused
            None => !stored.enabled || self.rejected.lock().await.as_ref() == Some(&stored),
        };
        if unchanged {
            return Ok(false);
        }

        debug!("Stored MQTT config differs from the active one, reconfiguring");
        let outcome = self.reconfigure(stored).await;
        info!("MQTT reconfigured from stored settings: {:?}", outcome);
        Ok(true)
    }

    async fn reconfigure(&self, broker: BrokerConfig) -> StartOutcome {
        let outcome = self.service.reconfigure(broker.clone()).await;
        *self.rejected.lock().await = (outcome == StartOutcome::MissingHost).then_some(broker);
        outcome
    }

    pub fn spawn_reconciler(self: &Arc<Self>, every: std::time::Duration) -> Option<JoinHandle<()>> {
        if !self.owner {
            return None;
        }

        let runtime = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = runtime.reconcile().await {
                    debug!("MQTT config reconcile failed: {}", e);
                }
            }
        }))
    }

    /// Owner: stop MQTT (which clears the shared cache) before letting go of
    /// the lock. Calling it twice is harmless.
    pub async fn shutdown(&self) {
        let lock = self.lock.lock().await.take();
        if let Some(lock) = lock {
            info!("Worker {} stopping MQTT before exit...", std::process::id());
            self.service.stop().await;
            lock.release();
            info!("Worker {} released MQTT lock", std::process::id());
        }
    }
}
