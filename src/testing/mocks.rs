//! Mock implementations for testing
//!
//! A transport that records commands instead of talking to a broker, and a
//! store whose writes can be switched to fail.

use crate::error::LightError;
use crate::protocol::DeviceCommand;
use crate::store::{
    DeviceMutation, DeviceState, HistoryQuery, MemoryStore, SensorHistory, SettingsMutation,
    StateStore, StoreError, StoreResult, UserSettings,
};
use crate::transport::{ConnectionState, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    pub published_commands: Arc<Mutex<Vec<DeviceCommand>>>,
    connected: AtomicBool,
    should_fail: AtomicBool,
    telemetry_sender: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published_commands: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(true),
            should_fail: AtomicBool::new(false),
            telemetry_sender: std::sync::Mutex::new(None),
        }
    }
}

impl MockTransport {
    /// Connected transport that accepts every publish
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected transport whose publishes fail
    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.should_fail.store(true, Ordering::SeqCst);
        transport
    }

    /// Transport that reports a lost session
    pub fn disconnected() -> Self {
        let transport = Self::default();
        transport.connected.store(false, Ordering::SeqCst);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn get_published_commands(&self) -> Vec<DeviceCommand> {
        self.published_commands.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_commands.lock().await.clear();
    }

    /// Push a raw payload through the attached telemetry channel, as the
    /// broker would
    pub async fn inject_telemetry(&self, payload: &[u8]) -> Result<(), String> {
        let sender = self
            .telemetry_sender
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| "No telemetry sender attached".to_string())?;
        sender
            .send(payload.to_vec())
            .await
            .map_err(|e| format!("Telemetry channel closed: {e}"))
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = LightError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LightError::transport_unavailable("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_command(&self, command: &DeviceCommand) -> Result<(), Self::Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LightError::transport_unavailable("Mock transport disconnected"));
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LightError::transport_unavailable("Mock publish failure"));
        }
        self.published_commands.lock().await.push(*command);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        Some(if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("Mock transport disconnected".to_string())
        })
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_telemetry_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        if let Ok(mut slot) = self.telemetry_sender.lock() {
            *slot = Some(sender);
        }
    }
}

/// In-memory store whose operations can be made to fail
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingStore {
    /// Store that fails every write
    pub fn failing_writes() -> Self {
        let store = Self::default();
        store.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    /// Store that fails every operation
    pub fn unavailable() -> Self {
        let store = Self::failing_writes();
        store.fail_reads.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of history rows actually written
    pub async fn history_len(&self) -> usize {
        self.inner.history_len().await
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FailingStore {
    async fn device_state(&self) -> StoreResult<DeviceState> {
        self.check_read()?;
        self.inner.device_state().await
    }

    async fn update_device(&self, mutation: DeviceMutation) -> StoreResult<DeviceState> {
        self.check_write()?;
        self.inner.update_device(mutation).await
    }

    async fn record_feedback(
        &self,
        mutation: DeviceMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<(DeviceState, SensorHistory)> {
        self.check_write()?;
        self.inner.record_feedback(mutation, at).await
    }

    async fn settings(&self) -> StoreResult<UserSettings> {
        self.check_read()?;
        self.inner.settings().await
    }

    async fn update_settings(&self, mutation: SettingsMutation) -> StoreResult<UserSettings> {
        self.check_write()?;
        self.inner.update_settings(mutation).await
    }

    async fn history(&self, query: &HistoryQuery) -> StoreResult<Vec<SensorHistory>> {
        self.check_read()?;
        self.inner.history(query).await
    }

    async fn trim_history(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check_write()?;
        self.inner.trim_history(cutoff).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_read()
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
