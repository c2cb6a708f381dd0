//! Feedback ingestion: device telemetry into canonical state
//!
//! Each accepted message overwrites the fields it carries, appends one
//! history row and, in automatic mode, runs the threshold policy. Nothing
//! here is allowed to take the receive loop down.

use crate::control::policy::{self, PolicyInput};
use crate::error::{LightError, LightResult};
use crate::observability::metrics;
use crate::protocol::{DeviceCommand, TelemetryMessage, TelemetryReading};
use crate::store::{DeviceState, SensorHistory, StateStore};
use crate::telemetry_span;
use crate::transport::Transport;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

/// Timestamps above this magnitude are Unix milliseconds, below it seconds
pub const MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

/// Result of ingesting one telemetry message
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub state: DeviceState,
    pub history: SensorHistory,
    /// Command chosen by the policy, if automatic mode was on
    pub auto_command: Option<DeviceCommand>,
    /// Whether `auto_command` reached the transport
    pub auto_command_delivered: bool,
}

/// Convert a device timestamp to an instant (pure function)
///
/// Returns `None` for non-finite or unrepresentable values.
pub fn resolve_timestamp(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() > MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1000.0
    };
    if millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// Overwrite the fields present in `reading` (pure function)
pub fn apply_reading(state: &mut DeviceState, reading: &TelemetryReading) {
    if let Some(is_on) = reading.is_on {
        state.is_on = is_on;
    }
    if let Some(brightness) = reading.brightness {
        state.brightness = brightness;
    }
    if let Some(sensor_value) = reading.sensor_value {
        state.sensor_value = sensor_value;
    }
    if let Some(is_auto_mode) = reading.is_auto_mode {
        state.is_auto_mode = is_auto_mode;
    }
}

/// Consumes telemetry and keeps the store in line with the device
pub struct FeedbackIngestor<T: Transport> {
    store: Arc<dyn StateStore>,
    transport: Arc<T>,
}

impl<T: Transport + 'static> FeedbackIngestor<T> {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<T>) -> Self {
        Self { store, transport }
    }

    /// Apply one raw telemetry payload
    pub async fn ingest(&self, payload: &[u8]) -> LightResult<IngestOutcome> {
        metrics().telemetry_received();

        let reading = match TelemetryMessage::parse(payload).and_then(TelemetryMessage::validate) {
            Ok(reading) => reading,
            Err(message) => {
                metrics().telemetry_rejected();
                return Err(LightError::malformed_telemetry(message));
            }
        };

        let now = Utc::now();
        let at = match reading.timestamp {
            Some(raw) => resolve_timestamp(raw).unwrap_or_else(|| {
                warn!(timestamp = raw, "Telemetry timestamp out of range, using server time");
                now
            }),
            None => now,
        };

        let started = Instant::now();
        let (state, history) = self
            .store
            .record_feedback(
                Box::new(move |state: &mut DeviceState| apply_reading(state, &reading)),
                at,
            )
            .await
            .map_err(|e| {
                metrics().persistence_failure();
                LightError::from(e)
            })?;
        metrics().history_row_written(started.elapsed());

        debug!(
            is_on = state.is_on,
            brightness = state.brightness,
            sensor_value = state.sensor_value,
            is_auto_mode = state.is_auto_mode,
            "Device state updated from feedback"
        );

        let mut outcome = IngestOutcome {
            state,
            history,
            auto_command: None,
            auto_command_delivered: false,
        };

        if outcome.state.is_auto_mode {
            self.run_policy(&mut outcome).await;
        }

        Ok(outcome)
    }

    /// Evaluate the policy and publish its command without touching the store
    async fn run_policy(&self, outcome: &mut IngestOutcome) {
        let settings = match self.store.settings().await {
            Ok(settings) => settings,
            Err(e) => {
                metrics().persistence_failure();
                error!(error = %e, "Failed to load settings for automatic control");
                return;
            }
        };

        let Some(command) = policy::evaluate(PolicyInput::new(&outcome.state, &settings)) else {
            return;
        };
        outcome.auto_command = Some(command);

        match self.transport.publish_command(&command).await {
            Ok(()) => {
                metrics().auto_command_issued();
                outcome.auto_command_delivered = true;
                info!(
                    command = ?command,
                    sensor_value = outcome.state.sensor_value,
                    low = settings.light_threshold_low,
                    high = settings.light_threshold_high,
                    "Automatic control issued command"
                );
            }
            Err(e) => {
                metrics().command_dropped();
                warn!(command = ?command, error = %e, "Automatic command dropped");
            }
        }
    }

    /// Drain the telemetry channel until every sender is gone
    pub async fn run(self, mut receiver: mpsc::Receiver<Vec<u8>>) {
        info!("Feedback ingestor started");
        while let Some(payload) = receiver.recv().await {
            let span = telemetry_span!(bytes = payload.len());
            match self.ingest(&payload).instrument(span).await {
                Ok(_) => {}
                Err(LightError::MalformedTelemetry { message }) => {
                    warn!(
                        error = %message,
                        payload = %String::from_utf8_lossy(&payload),
                        "Discarding malformed telemetry"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to record telemetry");
                }
            }
        }
        info!("Telemetry channel closed, feedback ingestor stopped");
    }
}
