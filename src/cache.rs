use crate::db::{DatabaseService, DbError};
use crate::models::SensorReading;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Two-tier last-value cache. The shared tier (the `mqtt_live_weight` row)
/// is what every worker process reads; the local slot only helps the process
/// that owns the broker session when the database is unavailable.
pub struct WeightCache {
    local: Mutex<Option<SensorReading>>,
    db: Arc<DatabaseService>,
}

impl WeightCache {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self {
            local: Mutex::new(None),
            db,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<SensorReading>> {
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a new reading. A failed shared write is logged; the local slot
    /// still holds the value.
    pub fn record(&self, reading: SensorReading) {
        *self.slot() = Some(reading.clone());

        if let Err(e) = self.db.upsert_reading(&reading) {
            error!("DB cache update failed: {}", e);
        }
    }

    /// Shared tier first; the local slot only when the shared read errors.
    pub fn latest(&self) -> Option<SensorReading> {
        match self.shared() {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Shared weight read failed, using local cache: {}", e);
                self.local()
            }
        }
    }

    pub fn shared(&self) -> Result<Option<SensorReading>, DbError> {
        self.db.read_live_weight()
    }

    pub fn local(&self) -> Option<SensorReading> {
        self.slot().clone()
    }

    pub fn clear(&self) {
        *self.slot() = None;

        match self.db.clear_live_weight() {
            Ok(()) => debug!("Cleared weight cache from database"),
            Err(e) => debug!("DB cache clear failed (non-critical): {}", e),
        }
    }
}
