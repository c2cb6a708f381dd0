//! Message types for the lamp protocol and the control API
//!
//! Inbound telemetry is deliberately loose: every field is optional and
//! unknown fields are ignored, so firmware revisions can add fields without
//! breaking ingestion. Outbound commands have exactly two shapes.

use serde::{Deserialize, Serialize};

/// Raw telemetry message as published by the lamp (device -> server)
///
/// # Examples
/// ```
/// use smartlight::protocol::TelemetryMessage;
///
/// let message = TelemetryMessage::parse(br#"{"sensor_value": 420, "is_on": true}"#).unwrap();
/// assert_eq!(message.sensor_value, Some(420));
/// assert_eq!(message.brightness, None);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_auto_mode: Option<bool>,
    /// Unix time in seconds or milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl TelemetryMessage {
    /// Deserialize a raw MQTT payload (pure function)
    ///
    /// Only a JSON object is accepted; serde would otherwise map an array
    /// positionally onto the fields.
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| format!("Failed to parse telemetry: {e}"))?;
        if !value.is_object() {
            return Err("Telemetry must be a JSON object".to_string());
        }
        serde_json::from_value(value).map_err(|e| format!("Failed to parse telemetry: {e}"))
    }

    /// Check value ranges and narrow the numeric fields (pure function)
    ///
    /// A message with any out-of-range field is rejected as a whole so that
    /// a bad reading never leaves the device state half-applied.
    pub fn validate(self) -> Result<TelemetryReading, String> {
        let brightness = match self.brightness {
            Some(value) if !(0..=100).contains(&value) => {
                return Err(format!("brightness {value} outside 0..=100"));
            }
            Some(value) => Some(value as u8),
            None => None,
        };

        let sensor_value = match self.sensor_value {
            Some(value) => Some(
                u32::try_from(value)
                    .map_err(|_| format!("sensor_value {value} outside 0..={}", u32::MAX))?,
            ),
            None => None,
        };

        Ok(TelemetryReading {
            is_on: self.is_on,
            brightness,
            sensor_value,
            is_auto_mode: self.is_auto_mode,
            timestamp: self.timestamp,
        })
    }
}

/// Telemetry that passed range validation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryReading {
    pub is_on: Option<bool>,
    pub brightness: Option<u8>,
    pub sensor_value: Option<u32>,
    pub is_auto_mode: Option<bool>,
    pub timestamp: Option<f64>,
}

/// Power state as spelled on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn from_is_on(is_on: bool) -> Self {
        if is_on {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, PowerState::On)
    }
}

/// Command sent to the lamp (server -> device)
///
/// # Examples
/// ```
/// use smartlight::protocol::{DeviceCommand, PowerState};
///
/// let command = DeviceCommand::Manual { state: PowerState::On, brightness: 80 };
/// assert_eq!(
///     serde_json::to_string(&command).unwrap(),
///     r#"{"type":"MANUAL","state":"ON","brightness":80}"#
/// );
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DeviceCommand {
    #[serde(rename = "MANUAL")]
    Manual { state: PowerState, brightness: u8 },
    #[serde(rename = "AUTO")]
    Auto { enable: bool },
}

impl DeviceCommand {
    /// Serialize to the JSON wire payload (pure function)
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceCommand::Manual { .. } => "MANUAL",
            DeviceCommand::Auto { .. } => "AUTO",
        }
    }
}

/// Body of `POST /api/device/control`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlRequest {
    /// `SET_BRIGHTNESS`, `TOGGLE_POWER` or `SET_AUTO`
    pub action: String,
    /// Brightness for `SET_BRIGHTNESS`
    #[serde(default)]
    pub value: Option<i64>,
    /// Target for `SET_AUTO`
    #[serde(default)]
    pub enable: Option<bool>,
    /// Explicit power state for `TOGGLE_POWER`
    #[serde(default)]
    pub state: Option<bool>,
}

/// Reply to an accepted control request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
    /// The command handed to the transport
    pub command: DeviceCommand,
    /// Whether the transport accepted the command; `false` means it was dropped
    pub delivered: bool,
}

impl ControlResponse {
    pub fn new(command: DeviceCommand, delivered: bool) -> Self {
        let message = if delivered {
            "Command sent to device"
        } else {
            "Command recorded; device is unreachable and the command was dropped"
        };
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            command,
            delivered,
        }
    }
}
