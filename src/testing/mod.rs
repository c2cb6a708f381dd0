//! Testing utilities and mock implementations
//!
//! Lets the control engine and the HTTP layer run without an MQTT broker
//! or a database file.

pub mod mocks;

pub use mocks::*;
