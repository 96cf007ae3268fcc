use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::point::{RoutePoint, StoredRoutePoint};
use crate::store::RoutePointStore;

/// Route points in one SQLite table. The store timestamp is kept as microseconds since the
/// epoch, the row key is the SQLite rowid.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteStore {
    pub fn open(settings: &StoreSettings) -> Result<Self> {
        Self::open_path(&settings.path, &settings.table)
    }

    pub fn open_path(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Config(format!("invalid table name {table:?}")));
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                row_key INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_us INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                measurement_time TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_timestamp ON {table} (timestamp_us);"
        ))?;
        info!(path = %path.as_ref().display(), table, "Opened route point store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock(), &table)).await?
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Store(format!("timestamp {micros} out of range")))
}

#[async_trait]
impl RoutePointStore for SqliteStore {
    async fn append(&self, point: &RoutePoint) -> Result<StoredRoutePoint> {
        let point = point.clone();
        self.with_conn(move |conn, table| {
            let timestamp = Utc::now();
            conn.execute(
                &format!(
                    "INSERT INTO {table} (timestamp_us, user_id, latitude, longitude, measurement_time)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![
                    timestamp.timestamp_micros(),
                    point.user_id,
                    point.latitude,
                    point.longitude,
                    point.measurement_time.to_rfc3339(),
                ],
            )?;
            Ok(StoredRoutePoint {
                row_key: conn.last_insert_rowid().to_string(),
                // stored at microsecond precision
                timestamp: from_micros(timestamp.timestamp_micros())?,
                point,
            })
        })
        .await
    }

    async fn query_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredRoutePoint>> {
        self.with_conn(move |conn, table| {
            let mut stmt = conn.prepare(&format!(
                "SELECT row_key, timestamp_us, user_id, latitude, longitude, measurement_time
                 FROM {table} WHERE timestamp_us > ?1 AND timestamp_us <= ?2"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![from.timestamp_micros(), to.timestamp_micros()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;

            let mut points = vec![];
            for row in rows {
                let (row_key, timestamp_us, user_id, latitude, longitude, measured) = row?;
                let measurement_time = DateTime::parse_from_rfc3339(&measured)
                    .map_err(|e| Error::Store(format!("row {row_key}: bad measurement time: {e}")))?
                    .with_timezone(&Utc);
                points.push(StoredRoutePoint {
                    row_key: row_key.to_string(),
                    timestamp: from_micros(timestamp_us)?,
                    point: RoutePoint::new(user_id, latitude, longitude, measurement_time),
                });
            }
            Ok(points)
        })
        .await
    }
}
