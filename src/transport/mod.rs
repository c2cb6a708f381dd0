//! Transport layer between the server and the lamp
//!
//! This module provides the transport abstraction and its MQTT
//! implementation. Inbound telemetry is handed to a channel rather than a
//! callback so the ingestor can be driven without a broker.

use crate::protocol::DeviceCommand;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::{ConnectionState, HealthMetrics};

/// Pub/sub session with the lamp
///
/// `publish_command` is fire-and-forget: it never waits for the device and
/// fails immediately when the session is down. There is no outbound queue.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish the session and subscribe to the telemetry topic
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Stop background reconnection and close the session
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Serialize `command` and send it on the command topic
    async fn publish_command(&self, command: &DeviceCommand) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state; `None` before `connect`
    fn connection_state(&self) -> Option<ConnectionState>;

    /// Check if reconnection has given up
    fn is_permanently_disconnected(&self) -> bool;

    /// Where raw telemetry payloads are delivered
    fn set_telemetry_sender(&self, sender: mpsc::Sender<Vec<u8>>);

    /// Link statistics, for transports that track them
    fn link_health(&self) -> Option<HealthMetrics> {
        None
    }
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
