//! MQTT client for the lamp's command and status topics
//!
//! Split into pure and impure parts:
//!
//! - [`connection`] - connection states, backoff schedule, broker options
//! - [`message_handler`] - event routing and telemetry forwarding
//! - [`health_monitor`] - reconnection decisions and link health
//! - [`client`] - the rumqttc event loop and its reconnection supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use smartlight::config::MqttSection;
//! use smartlight::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClient::new(MqttSection::default())?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! client.set_telemetry_sender(tx);
//! client.connect().await?;
//! while let Some(payload) = rx.recv().await {
//!     println!("{} bytes of telemetry", payload.len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
