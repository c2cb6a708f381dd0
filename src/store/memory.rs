//! In-process store
//!
//! One async mutex guards all three entities, so the lock scope is the
//! transaction scope. Nothing survives a restart; used for tests and for
//! `database.url = "memory"`.

use super::{
    DeviceMutation, DeviceState, HistoryQuery, SensorHistory, SettingsMutation, StateStore,
    StoreError, StoreResult, UserSettings,
};
use crate::store::model::truncate_to_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    device: Option<DeviceState>,
    settings: Option<UserSettings>,
    history: Vec<SensorHistory>,
    next_history_id: i64,
}

impl Tables {
    fn device_or_create(&mut self) -> &mut DeviceState {
        self.device
            .get_or_insert_with(|| DeviceState::initial(Utc::now()))
    }

    fn settings_or_create(&mut self) -> &mut UserSettings {
        self.settings
            .get_or_insert_with(|| UserSettings::defaults(Utc::now()))
    }
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of history rows currently held
    pub async fn history_len(&self) -> usize {
        self.tables.lock().await.history.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn device_state(&self) -> StoreResult<DeviceState> {
        let mut tables = self.tables.lock().await;
        Ok(tables.device_or_create().clone())
    }

    async fn update_device(&self, mutation: DeviceMutation) -> StoreResult<DeviceState> {
        let mut tables = self.tables.lock().await;
        mutation(tables.device_or_create());
        let device = tables.device_or_create();
        device.last_updated = truncate_to_millis(Utc::now());
        Ok(device.clone())
    }

    async fn record_feedback(
        &self,
        mutation: DeviceMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<(DeviceState, SensorHistory)> {
        let at = truncate_to_millis(at);
        let mut tables = self.tables.lock().await;

        mutation(tables.device_or_create());
        let device = tables.device_or_create();
        device.last_updated = at;
        let state = device.clone();

        tables.next_history_id += 1;
        let mut row = SensorHistory::mirror(&state, at);
        row.id = tables.next_history_id;
        tables.history.push(row.clone());

        Ok((state, row))
    }

    async fn settings(&self) -> StoreResult<UserSettings> {
        let mut tables = self.tables.lock().await;
        Ok(tables.settings_or_create().clone())
    }

    async fn update_settings(&self, mutation: SettingsMutation) -> StoreResult<UserSettings> {
        let mut tables = self.tables.lock().await;
        let mut candidate = tables.settings_or_create().clone();
        mutation(&mut candidate).map_err(StoreError::Rejected)?;
        candidate.last_updated = truncate_to_millis(Utc::now());
        tables.settings = Some(candidate.clone());
        Ok(candidate)
    }

    async fn history(&self, query: &HistoryQuery) -> StoreResult<Vec<SensorHistory>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<SensorHistory> = tables
            .history
            .iter()
            .filter(|row| query.since.map_or(true, |since| row.timestamp >= since))
            .cloned()
            .collect();

        // Stable sort: equal timestamps keep insertion order
        rows.sort_by_key(|row| row.timestamp);

        let skip = rows.len().saturating_sub(query.limit);
        Ok(rows.split_off(skip))
    }

    async fn trim_history(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.history.len();
        tables.history.retain(|row| row.timestamp >= cutoff);
        Ok((before - tables.history.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
