//! Smart light control service
//!
//! Keeps one MQTT-connected lamp, its persisted state and a sensor history
//! in sync, and switches the lamp automatically from its light sensor.
//!
//! # Overview
//!
//! - [`protocol`] - telemetry, command and control-request wire types
//! - [`store`] - transactional state store (in-memory or SQLite)
//! - [`transport`] - MQTT session with background reconnection
//! - [`control`] - feedback ingestor, threshold policy and command dispatcher
//! - [`http`] - warp routes for the device API and health probes
//! - [`observability`] - logging, metrics and health reports
//!
//! # Quick Start
//!
//! ```rust
//! use smartlight::control::{evaluate, PolicyInput};
//! use smartlight::protocol::{DeviceCommand, PowerState};
//!
//! // Dark room, lamp off: the policy switches it on.
//! let command = evaluate(PolicyInput {
//!     sensor_value: 250,
//!     is_on: false,
//!     low: 300,
//!     high: 700,
//!     auto_brightness: 80,
//! });
//! assert_eq!(
//!     command,
//!     Some(DeviceCommand::Manual { state: PowerState::On, brightness: 80 })
//! );
//!
//! // Inside the dead band nothing happens.
//! let idle = evaluate(PolicyInput { sensor_value: 500, is_on: true, low: 300, high: 700, auto_brightness: 80 });
//! assert_eq!(idle, None);
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod transport;

pub use config::*;
pub use control::{CommandDispatcher, FeedbackIngestor};
pub use error::{LightError, LightResult};
pub use protocol::*;
pub use store::{DeviceState, SensorHistory, StateStore, UserSettings};
pub use transport::mqtt::MqttClient;
