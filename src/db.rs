use crate::models::{BrokerConfig, SensorReading};
use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Both tables are singletons keyed by this id.
const SINGLETON_ID: i64 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored timestamp '{0}' is not RFC 3339")]
    BadTimestamp(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Shared store for broker settings and the live weight row. Several worker
/// processes open the same file; WAL plus a busy timeout keeps them from
/// tripping over each other.
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path.as_ref()).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn()?;

        // Log the start of database initialization
        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS mqtt_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            broker_host TEXT NOT NULL DEFAULT '',
            broker_port INTEGER NOT NULL DEFAULT 1883,
            username TEXT,
            password TEXT,
            use_tls BOOLEAN NOT NULL DEFAULT 0,
            topic_prefix TEXT NOT NULL DEFAULT 'brewery',
            enabled BOOLEAN NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS mqtt_live_weight (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            weight_kg REAL,
            observed_at TEXT,
            updated_at INTEGER NOT NULL
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Reads the broker settings, `None` until an admin has saved them once.
    pub fn load_broker_config(&self) -> Result<Option<BrokerConfig>> {
        let conn = self.conn()?;

        let config = conn
            .query_row(
                "SELECT broker_host, broker_port, username, password, use_tls, topic_prefix, enabled
                 FROM mqtt_config WHERE id = ?1",
                params![SINGLETON_ID],
                |row| {
                    Ok(BrokerConfig {
                        host: row.get(0)?,
                        port: row.get(1)?,
                        username: row.get(2)?,
                        password: row.get(3)?,
                        use_tls: row.get(4)?,
                        topic_prefix: row.get(5)?,
                        enabled: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    pub fn save_broker_config(&self, config: &BrokerConfig) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO mqtt_config (id, broker_host, broker_port, username, password, use_tls, topic_prefix, enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                broker_host = excluded.broker_host,
                broker_port = excluded.broker_port,
                username = excluded.username,
                password = excluded.password,
                use_tls = excluded.use_tls,
                topic_prefix = excluded.topic_prefix,
                enabled = excluded.enabled
            "#,
            params![
                SINGLETON_ID,
                config.host,
                config.port,
                config.username,
                config.password,
                config.use_tls,
                config.topic_prefix,
                config.enabled
            ],
        )?;
        Ok(())
    }

    /// Stores `reading` as the one live row and refreshes its liveness stamp.
    pub fn upsert_reading(&self, reading: &SensorReading) -> Result<()> {
        self.upsert_reading_at(reading, OffsetDateTime::now_utc())
    }

    pub(crate) fn upsert_reading_at(&self, reading: &SensorReading, updated_at: OffsetDateTime) -> Result<()> {
        let conn = self.conn()?;
        let observed_at = reading
            .observed_at
            .format(&Rfc3339)
            .map_err(|_| DbError::BadTimestamp(reading.observed_at.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO mqtt_live_weight (id, weight_kg, observed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                weight_kg = excluded.weight_kg,
                observed_at = excluded.observed_at,
                updated_at = excluded.updated_at
            "#,
            params![SINGLETON_ID, reading.weight_kg, observed_at, updated_at.unix_timestamp()],
        )?;
        Ok(())
    }

    /// Refreshes the liveness stamp, creating a weightless row if needed.
    pub fn touch_liveness(&self) -> Result<()> {
        self.touch_liveness_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn touch_liveness_at(&self, updated_at: OffsetDateTime) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO mqtt_live_weight (id, weight_kg, observed_at, updated_at)
            VALUES (?1, NULL, NULL, ?2)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
            params![SINGLETON_ID, updated_at.unix_timestamp()],
        )?;
        Ok(())
    }

    pub fn clear_live_weight(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM mqtt_live_weight", [])?;
        Ok(())
    }

    /// The cached reading, `None` when there is no row or it carries only a
    /// liveness stamp.
    pub fn read_live_weight(&self) -> Result<Option<SensorReading>> {
        let conn = self.conn()?;

        let row: Option<(Option<f64>, Option<String>)> = conn
            .query_row(
                "SELECT weight_kg, observed_at FROM mqtt_live_weight WHERE id = ?1",
                params![SINGLETON_ID],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((Some(weight_kg), Some(observed_at))) => {
                let observed_at = OffsetDateTime::parse(&observed_at, &Rfc3339)
                    .map_err(|_| DbError::BadTimestamp(observed_at))?;
                Ok(Some(SensorReading { weight_kg, observed_at }))
            }
            _ => Ok(None),
        }
    }

    /// Unix seconds of the last write to the live row.
    pub fn live_weight_updated_at(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;

        let updated_at = conn
            .query_row(
                "SELECT updated_at FROM mqtt_live_weight WHERE id = ?1",
                params![SINGLETON_ID],
                |row| row.get(0),
            )
            .optional()?;
        Ok(updated_at)
    }

    #[cfg(test)]
    pub(crate) fn live_row_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM mqtt_live_weight", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fresh schema in a temp directory; keep the `TempDir` alive for the test.
    pub(crate) fn temp_db() -> (TempDir, DatabaseService) {
        let dir = TempDir::new().unwrap();
        let db = DatabaseService::new(dir.path().join("brewscale.db")).unwrap();
        db.initialize_db().unwrap();
        (dir, db)
    }

    #[test]
    fn initialize_is_repeatable() {
        let (_dir, db) = temp_db();
        db.initialize_db().unwrap();
        assert_eq!(db.live_row_count().unwrap(), 0);
    }

    #[test]
    fn broker_config_roundtrips_and_overwrites() {
        let (_dir, db) = temp_db();
        assert!(db.load_broker_config().unwrap().is_none());

        let mut config = BrokerConfig {
            host: "test-broker".to_string(),
            username: Some("brewer".to_string()),
            password: Some("hops".to_string()),
            enabled: true,
            ..BrokerConfig::default()
        };
        db.save_broker_config(&config).unwrap();
        assert_eq!(db.load_broker_config().unwrap(), Some(config.clone()));

        config.enabled = false;
        config.port = 8883;
        db.save_broker_config(&config).unwrap();
        assert_eq!(db.load_broker_config().unwrap(), Some(config));
    }

    #[test]
    fn successive_readings_keep_a_single_row() {
        let (_dir, db) = temp_db();

        db.upsert_reading(&SensorReading::now(1.2)).unwrap();
        db.upsert_reading(&SensorReading::now(1.3)).unwrap();

        assert_eq!(db.live_row_count().unwrap(), 1);
        assert_eq!(db.read_live_weight().unwrap().map(|r| r.weight_kg), Some(1.3));
    }

    #[test]
    fn liveness_touch_keeps_existing_weight() {
        let (_dir, db) = temp_db();
        let start = OffsetDateTime::now_utc() - time::Duration::seconds(60);

        db.upsert_reading_at(&SensorReading::now(4.5), start).unwrap();
        db.touch_liveness().unwrap();

        assert_eq!(db.read_live_weight().unwrap().map(|r| r.weight_kg), Some(4.5));
        assert!(db.live_weight_updated_at().unwrap().unwrap() > start.unix_timestamp());
    }

    #[test]
    fn liveness_row_without_weight_reads_as_none() {
        let (_dir, db) = temp_db();
        db.touch_liveness().unwrap();

        assert!(db.read_live_weight().unwrap().is_none());
        assert!(db.live_weight_updated_at().unwrap().is_some());
    }

    #[test]
    fn clear_removes_the_row() {
        let (_dir, db) = temp_db();
        db.upsert_reading(&SensorReading::now(2.0)).unwrap();
        db.clear_live_weight().unwrap();
        db.clear_live_weight().unwrap();

        assert!(db.read_live_weight().unwrap().is_none());
        assert!(db.live_weight_updated_at().unwrap().is_none());
    }

    #[test]
    fn two_handles_on_one_file_see_the_same_row() {
        let (dir, writer) = temp_db();
        let reader = DatabaseService::new(dir.path().join("brewscale.db")).unwrap();

        writer.upsert_reading(&SensorReading::now(7.7)).unwrap();
        assert_eq!(reader.read_live_weight().unwrap().map(|r| r.weight_kg), Some(7.7));
    }
}
