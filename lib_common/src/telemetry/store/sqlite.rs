//! # SQLite Reading Store
//!
//! Persists readings in a single `sensor_data` table through a one-connection
//! `sqlx` pool. Timestamps are stored as integer microseconds so ordering is
//! numeric rather than lexical.

use super::{ReadingStore, StoreError};
use crate::telemetry::reading::Reading;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sensor_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        seq INTEGER NOT NULL,
        timestamp_us INTEGER NOT NULL,
        speed REAL NOT NULL,
        temperature REAL NOT NULL,
        pressure REAL NOT NULL
    )";

const SELECT_NEWEST_SQL: &str = "
    SELECT seq, timestamp_us, speed, temperature, pressure
    FROM sensor_data
    ORDER BY timestamp_us DESC, seq DESC
    LIMIT ?";

const TRIM_SQL: &str = "
    DELETE FROM sensor_data
    WHERE id NOT IN (
        SELECT id FROM sensor_data
        ORDER BY timestamp_us DESC, seq DESC
        LIMIT ?
    )";

type ReadingRow = (i64, i64, f64, f64, f64);

/// A `sensor_data` table in a SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path` and its parent
    /// directory, then ensures the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::DirectoryError {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let store = Self::connect(options).await?;
        log::info!("Database initialized successfully at {}", path.display());
        Ok(store)
    }

    /// A private in-memory database, gone when the store is dropped.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // One connection that never idles out: writes are serialised anyway and an
        // in-memory database lives only as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await
            .map_err(|e: sqlx::Error| StoreError::ConnectionError(e.to_string()))?;

        sqlx::query(CREATE_TABLE_SQL)
            .execute(&pool)
            .await
            .map_err(|e: sqlx::Error| StoreError::SchemaError(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn newest(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let rows = sqlx::query_as::<_, ReadingRow>(SELECT_NEWEST_SQL)
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.into_iter().map(into_reading).collect()
    }
}

impl ReadingStore for SqliteStore {
    async fn append(&mut self, reading: &Reading) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sensor_data (seq, timestamp_us, speed, temperature, pressure)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_i64(reading.seq)?)
        .bind(reading.timestamp.timestamp_micros())
        .bind(reading.speed)
        .bind(reading.temperature)
        .bind(reading.pressure)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn latest(&mut self) -> Result<Option<Reading>, StoreError> {
        Ok(self.newest(1).await?.pop())
    }

    async fn history(&mut self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        let mut rows = self.newest(limit).await?;
        rows.reverse();
        Ok(rows)
    }

    async fn trim(&mut self, keep: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(TRIM_SQL)
            .bind(to_i64(keep)?)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }
}

fn query_error(e: sqlx::Error) -> StoreError {
    StoreError::QueryError(e.to_string())
}

fn to_i64<T: TryInto<i64> + Copy + std::fmt::Display>(value: T) -> Result<i64, StoreError> {
    value
        .try_into()
        .map_err(|_| StoreError::QueryError(format!("{} does not fit a SQLite integer", value)))
}

fn into_reading((seq, timestamp_us, speed, temperature, pressure): ReadingRow) -> Result<Reading, StoreError> {
    let timestamp = DateTime::<Utc>::from_timestamp_micros(timestamp_us).ok_or(StoreError::CorruptRow(seq))?;
    Ok(Reading {
        seq: u64::try_from(seq).map_err(|_| StoreError::CorruptRow(seq))?,
        timestamp,
        speed,
        temperature,
        pressure,
    })
}
