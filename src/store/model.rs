//! Persisted entities: the device state singleton, the settings singleton
//! and the append-only sensor history

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Row id of the device state singleton
pub const DEVICE_ID: i64 = 1;
/// Row id of the settings singleton
pub const SETTINGS_ID: i64 = 1;

pub const DEFAULT_THRESHOLD_LOW: u32 = 300;
pub const DEFAULT_THRESHOLD_HIGH: u32 = 700;
pub const DEFAULT_AUTO_BRIGHTNESS: u8 = 80;

/// Canonical state of the managed lamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceState {
    pub id: i64,
    pub is_on: bool,
    /// 0..=100
    pub brightness: u8,
    pub sensor_value: u32,
    pub is_auto_mode: bool,
    pub last_updated: DateTime<Utc>,
}

impl DeviceState {
    /// State used when no row exists yet: off, dark, manual mode
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            id: DEVICE_ID,
            is_on: false,
            brightness: 0,
            sensor_value: 0,
            is_auto_mode: false,
            last_updated: truncate_to_millis(now),
        }
    }
}

/// Automatic control thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    pub id: i64,
    pub light_threshold_low: u32,
    pub light_threshold_high: u32,
    /// Brightness used when the policy switches the lamp on
    pub auto_brightness: u8,
    pub last_updated: DateTime<Utc>,
}

impl UserSettings {
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            id: SETTINGS_ID,
            light_threshold_low: DEFAULT_THRESHOLD_LOW,
            light_threshold_high: DEFAULT_THRESHOLD_HIGH,
            auto_brightness: DEFAULT_AUTO_BRIGHTNESS,
            last_updated: truncate_to_millis(now),
        }
    }

    /// Check the settings invariants
    pub fn validate(&self) -> Result<(), String> {
        if self.light_threshold_low >= self.light_threshold_high {
            return Err(format!(
                "light_threshold_low ({}) must be lower than light_threshold_high ({})",
                self.light_threshold_low, self.light_threshold_high
            ));
        }
        if self.auto_brightness > 100 {
            return Err(format!(
                "auto_brightness {} outside 0..=100",
                self.auto_brightness
            ));
        }
        Ok(())
    }
}

/// Partial settings update as accepted from `PUT /api/device/settings`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub light_threshold_low: Option<i64>,
    #[serde(default)]
    pub light_threshold_high: Option<i64>,
    #[serde(default)]
    pub auto_brightness: Option<i64>,
}

impl SettingsUpdate {
    /// Merge into `settings`, then validate the result.
    ///
    /// On error `settings` may be partially modified; callers apply this to a
    /// scratch copy and only persist on success.
    pub fn apply_to(&self, settings: &mut UserSettings) -> Result<(), String> {
        if let Some(low) = self.light_threshold_low {
            settings.light_threshold_low = u32::try_from(low)
                .map_err(|_| format!("light_threshold_low {low} must be a non-negative integer"))?;
        }
        if let Some(high) = self.light_threshold_high {
            settings.light_threshold_high = u32::try_from(high).map_err(|_| {
                format!("light_threshold_high {high} must be a non-negative integer")
            })?;
        }
        if let Some(brightness) = self.auto_brightness {
            if !(0..=100).contains(&brightness) {
                return Err(format!("auto_brightness {brightness} outside 0..=100"));
            }
            settings.auto_brightness = brightness as u8;
        }
        settings.validate()
    }

    pub fn is_empty(&self) -> bool {
        self.light_threshold_low.is_none()
            && self.light_threshold_high.is_none()
            && self.auto_brightness.is_none()
    }
}

/// One accepted telemetry message, as recorded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorHistory {
    pub id: i64,
    pub sensor_value: u32,
    pub brightness: u8,
    pub is_on: bool,
    pub is_auto_mode: bool,
    pub timestamp: DateTime<Utc>,
}

impl SensorHistory {
    /// Snapshot of `state` at `timestamp`; `id` is assigned by the store
    pub fn mirror(state: &DeviceState, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            sensor_value: state.sensor_value,
            brightness: state.brightness,
            is_on: state.is_on,
            is_auto_mode: state.is_auto_mode,
            timestamp,
        }
    }
}

/// Selection of history rows: newest `limit` rows at or after `since`,
/// returned oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl HistoryQuery {
    /// Window reaching back further than chrono can represent selects
    /// everything
    pub fn last_hours(now: DateTime<Utc>, hours: u32, limit: usize) -> Self {
        Self {
            since: hours_before(now, hours),
            limit,
        }
    }
}

/// `now` minus `hours`, or `None` if that predates the representable range
pub fn hours_before(now: DateTime<Utc>, hours: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::hours(i64::from(hours)))
}

/// Drop sub-millisecond precision; timestamps are persisted as Unix millis
pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = (timestamp.nanosecond() / 1_000_000) * 1_000_000;
    timestamp.with_nanosecond(nanos).unwrap_or(timestamp)
}
