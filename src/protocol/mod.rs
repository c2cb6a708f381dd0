//! Wire formats exchanged with the lamp and the web client
//!
//! Telemetry and commands travel as JSON over MQTT; control requests and
//! responses travel as JSON over HTTP.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
