//! SQLite store
//!
//! Timestamps are stored as Unix milliseconds. Writes are serialized by an
//! async mutex in addition to the SQLite transaction, which keeps
//! read-modify-write sequences from racing on a shared pool.

use super::{
    DeviceMutation, DeviceState, HistoryQuery, SensorHistory, SettingsMutation, StateStore,
    StoreError, StoreResult, UserSettings, DEVICE_ID, SETTINGS_ID,
};
use crate::store::model::truncate_to_millis;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS device_state (
        id INTEGER PRIMARY KEY,
        is_on INTEGER NOT NULL,
        brightness INTEGER NOT NULL,
        sensor_value INTEGER NOT NULL,
        is_auto_mode INTEGER NOT NULL,
        last_updated INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_settings (
        id INTEGER PRIMARY KEY,
        light_threshold_low INTEGER NOT NULL,
        light_threshold_high INTEGER NOT NULL,
        auto_brightness INTEGER NOT NULL,
        last_updated INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sensor_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sensor_value INTEGER NOT NULL,
        brightness INTEGER NOT NULL,
        is_on INTEGER NOT NULL,
        is_auto_mode INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_sensor_history_timestamp ON sensor_history(timestamp)",
];

type DeviceRow = (i64, i64, i64, i64, i64, i64);
type SettingsRow = (i64, i64, i64, i64, i64);
type HistoryRow = (i64, i64, i64, i64, i64, i64);

/// Store backed by a SQLite database through an sqlx pool
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // A private in-memory database lives and dies with its connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        info!(url = %url, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema applied");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}

fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> StoreResult<T> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn decode_device(row: DeviceRow) -> StoreResult<DeviceState> {
    let (id, is_on, brightness, sensor_value, is_auto_mode, last_updated) = row;
    Ok(DeviceState {
        id,
        is_on: is_on != 0,
        brightness: narrow("brightness", brightness)?,
        sensor_value: narrow("sensor_value", sensor_value)?,
        is_auto_mode: is_auto_mode != 0,
        last_updated: from_millis(last_updated)?,
    })
}

fn decode_settings(row: SettingsRow) -> StoreResult<UserSettings> {
    let (id, low, high, auto_brightness, last_updated) = row;
    Ok(UserSettings {
        id,
        light_threshold_low: narrow("light_threshold_low", low)?,
        light_threshold_high: narrow("light_threshold_high", high)?,
        auto_brightness: narrow("auto_brightness", auto_brightness)?,
        last_updated: from_millis(last_updated)?,
    })
}

fn decode_history(row: HistoryRow) -> StoreResult<SensorHistory> {
    let (id, sensor_value, brightness, is_on, is_auto_mode, timestamp) = row;
    Ok(SensorHistory {
        id,
        sensor_value: narrow("sensor_value", sensor_value)?,
        brightness: narrow("brightness", brightness)?,
        is_on: is_on != 0,
        is_auto_mode: is_auto_mode != 0,
        timestamp: from_millis(timestamp)?,
    })
}

async fn load_device(conn: &mut SqliteConnection) -> StoreResult<DeviceState> {
    let row = sqlx::query_as::<_, DeviceRow>(
        "SELECT id, is_on, brightness, sensor_value, is_auto_mode, last_updated \
         FROM device_state WHERE id = ?",
    )
    .bind(DEVICE_ID)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => decode_device(row),
        None => {
            let state = DeviceState::initial(Utc::now());
            save_device(conn, &state).await?;
            Ok(state)
        }
    }
}

async fn save_device(conn: &mut SqliteConnection, state: &DeviceState) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO device_state \
         (id, is_on, brightness, sensor_value, is_auto_mode, last_updated) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(DEVICE_ID)
    .bind(i64::from(state.is_on))
    .bind(i64::from(state.brightness))
    .bind(i64::from(state.sensor_value))
    .bind(i64::from(state.is_auto_mode))
    .bind(to_millis(state.last_updated))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_settings(conn: &mut SqliteConnection) -> StoreResult<UserSettings> {
    let row = sqlx::query_as::<_, SettingsRow>(
        "SELECT id, light_threshold_low, light_threshold_high, auto_brightness, last_updated \
         FROM user_settings WHERE id = ?",
    )
    .bind(SETTINGS_ID)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => decode_settings(row),
        None => {
            let settings = UserSettings::defaults(Utc::now());
            save_settings(conn, &settings).await?;
            Ok(settings)
        }
    }
}

async fn save_settings(conn: &mut SqliteConnection, settings: &UserSettings) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO user_settings \
         (id, light_threshold_low, light_threshold_high, auto_brightness, last_updated) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(SETTINGS_ID)
    .bind(i64::from(settings.light_threshold_low))
    .bind(i64::from(settings.light_threshold_high))
    .bind(i64::from(settings.auto_brightness))
    .bind(to_millis(settings.last_updated))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn device_state(&self) -> StoreResult<DeviceState> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let state = load_device(&mut tx).await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn update_device(&self, mutation: DeviceMutation) -> StoreResult<DeviceState> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut state = load_device(&mut tx).await?;
        mutation(&mut state);
        state.last_updated = truncate_to_millis(Utc::now());
        save_device(&mut tx, &state).await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn record_feedback(
        &self,
        mutation: DeviceMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<(DeviceState, SensorHistory)> {
        let at = truncate_to_millis(at);
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut state = load_device(&mut tx).await?;
        mutation(&mut state);
        state.last_updated = at;
        save_device(&mut tx, &state).await?;

        let mut row = SensorHistory::mirror(&state, at);
        let result = sqlx::query(
            "INSERT INTO sensor_history \
             (sensor_value, brightness, is_on, is_auto_mode, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(i64::from(row.sensor_value))
        .bind(i64::from(row.brightness))
        .bind(i64::from(row.is_on))
        .bind(i64::from(row.is_auto_mode))
        .bind(to_millis(at))
        .execute(&mut *tx)
        .await?;
        row.id = result.last_insert_rowid();

        tx.commit().await?;
        Ok((state, row))
    }

    async fn settings(&self) -> StoreResult<UserSettings> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let settings = load_settings(&mut tx).await?;
        tx.commit().await?;
        Ok(settings)
    }

    async fn update_settings(&self, mutation: SettingsMutation) -> StoreResult<UserSettings> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut settings = load_settings(&mut tx).await?;
        // Dropping the transaction on rejection rolls back a lazy insert too
        mutation(&mut settings).map_err(StoreError::Rejected)?;
        settings.last_updated = truncate_to_millis(Utc::now());
        save_settings(&mut tx, &settings).await?;
        tx.commit().await?;
        Ok(settings)
    }

    async fn history(&self, query: &HistoryQuery) -> StoreResult<Vec<SensorHistory>> {
        let since = query.since.map(to_millis).unwrap_or(i64::MIN);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, sensor_value, brightness, is_on, is_auto_mode, timestamp \
             FROM sensor_history WHERE timestamp >= ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut history = rows
            .into_iter()
            .map(decode_history)
            .collect::<StoreResult<Vec<_>>>()?;
        history.reverse();
        Ok(history)
    }

    async fn trim_history(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM sensor_history WHERE timestamp < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
