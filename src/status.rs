use crate::db::{DatabaseService, DbError};
use crate::models::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Answers "is the sensor link alive" for any worker process by looking at
/// how old the shared row is. Nothing here is cached: the enabled flag and
/// the stamp are read fresh on every call.
#[derive(Clone)]
pub struct StatusReader {
    db: Arc<DatabaseService>,
    freshness_window: Duration,
}

impl StatusReader {
    pub fn new(db: Arc<DatabaseService>, freshness_window: Duration) -> Self {
        Self { db, freshness_window }
    }

    pub fn is_connected(&self) -> Result<bool, DbError> {
        self.is_connected_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn is_connected_at(&self, now: OffsetDateTime) -> Result<bool, DbError> {
        let enabled = self
            .db
            .load_broker_config()?
            .map(|config| config.enabled)
            .unwrap_or(false);
        if !enabled {
            return Ok(false);
        }

        let updated_at = match self.db.live_weight_updated_at()? {
            Some(updated_at) => updated_at,
            None => return Ok(false),
        };
        let age = now.unix_timestamp() - updated_at;
        Ok(age < self.freshness_window.as_secs() as i64)
    }

    pub fn latest_weight(&self) -> Result<Option<SensorReading>, DbError> {
        self.db.read_live_weight()
    }
}
