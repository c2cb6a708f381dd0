//! State store for the device, its settings and the telemetry log
//!
//! Every logical update runs as one transaction: load-or-create the row,
//! apply a mutation closure, persist. Two concurrent updates never interleave
//! field by field. The device and settings rows are created lazily on first
//! access and never deleted.

pub mod memory;
pub mod model;
pub mod sqlite;

pub use memory::MemoryStore;
pub use model::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Mutation applied to the device state inside a transaction
pub type DeviceMutation = Box<dyn FnOnce(&mut DeviceState) + Send>;

/// Mutation applied to the settings inside a transaction; `Err` aborts it
pub type SettingsMutation = Box<dyn FnOnce(&mut UserSettings) -> Result<(), String> + Send>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The mutation refused the change; nothing was written
    #[error("{0}")]
    Rejected(String),
    #[error("Stored data is invalid: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional access to the three persisted entities
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current device state, created with initial values if absent
    async fn device_state(&self) -> StoreResult<DeviceState>;

    /// Apply `mutation` to the device state and persist it
    async fn update_device(&self, mutation: DeviceMutation) -> StoreResult<DeviceState>;

    /// Apply device feedback and append the matching history row atomically
    ///
    /// `last_updated` of the state and the history row's timestamp are both
    /// set to `at`.
    async fn record_feedback(
        &self,
        mutation: DeviceMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<(DeviceState, SensorHistory)>;

    /// Current settings, created with defaults if absent
    async fn settings(&self) -> StoreResult<UserSettings>;

    /// Apply `mutation` to a copy of the settings; persist only if it succeeds
    async fn update_settings(&self, mutation: SettingsMutation) -> StoreResult<UserSettings>;

    /// History rows selected by `query`, oldest first
    async fn history(&self, query: &HistoryQuery) -> StoreResult<Vec<SensorHistory>>;

    /// Delete history rows older than `cutoff`; returns the number removed
    async fn trim_history(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Cheap reachability check for readiness probes
    async fn ping(&self) -> StoreResult<()>;

    /// Backend name for logs and health output
    fn backend_name(&self) -> &'static str;
}
