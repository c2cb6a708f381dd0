//! Simulated lamp for manual end-to-end checks
//!
//! Subscribes to the command topic, applies each command to an in-memory lamp
//! and answers with a full telemetry report on the status topic. With
//! `--interval-secs` it also reports on a timer, sweeping the light sensor
//! so the automatic policy has something to react to.

use clap::Parser;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event};
use serde::Serialize;
use smartlight::config::MqttSection;
use smartlight::observability::init_default_logging;
use smartlight::protocol::{DeviceCommand, PowerState};
use smartlight::transport::mqtt::configure_mqtt_options;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Sensor sweep bounds and step for periodic reports
const SENSOR_SWEEP_MAX: u32 = 1000;
const SENSOR_SWEEP_STEP: u32 = 50;

/// MQTT lamp simulator
#[derive(Parser)]
#[command(name = "simulate-device")]
#[command(about = "Pretend to be the smart light on the MQTT broker")]
#[command(version)]
struct Args {
    /// Broker URL (mqtt:// or mqtts://)
    #[arg(long, default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Client id prefix
    #[arg(long, default_value = "smartlight-simulator")]
    client_id: String,

    /// Topic the server publishes commands on
    #[arg(long, default_value = "iot/light/command")]
    command_topic: String,

    /// Topic telemetry is published on
    #[arg(long, default_value = "iot/light/status")]
    status_topic: String,

    /// Environment variable holding the broker username
    #[arg(long)]
    username_env: Option<String>,

    /// Environment variable holding the broker password
    #[arg(long)]
    password_env: Option<String>,

    /// Publish a report every N seconds (0 disables periodic reports)
    #[arg(long, default_value_t = 0)]
    interval_secs: u64,

    /// Hold the sensor at a fixed reading instead of sweeping it
    #[arg(long)]
    sensor: Option<u32>,
}

/// Telemetry report as the firmware sends it
#[derive(Debug, Serialize, PartialEq)]
struct Report {
    is_on: bool,
    brightness: u8,
    sensor_value: u32,
    is_auto_mode: bool,
    timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct Lamp {
    is_on: bool,
    brightness: u8,
    is_auto_mode: bool,
    sensor_value: u32,
    sweep_up: bool,
}

impl Default for Lamp {
    fn default() -> Self {
        Self {
            is_on: true,
            brightness: 50,
            is_auto_mode: false,
            sensor_value: 100,
            sweep_up: true,
        }
    }
}

impl Lamp {
    /// A manual command takes the lamp out of automatic mode
    fn apply(&mut self, command: &DeviceCommand) {
        match *command {
            DeviceCommand::Manual { state, brightness } => {
                self.is_auto_mode = false;
                self.is_on = state == PowerState::On;
                self.brightness = brightness;
            }
            DeviceCommand::Auto { enable } => self.is_auto_mode = enable,
        }
    }

    /// Advance the sensor one step, bouncing between 0 and the sweep maximum
    fn sweep_sensor(&mut self) {
        if self.sweep_up {
            self.sensor_value = (self.sensor_value + SENSOR_SWEEP_STEP).min(SENSOR_SWEEP_MAX);
            self.sweep_up = self.sensor_value < SENSOR_SWEEP_MAX;
        } else {
            self.sensor_value = self.sensor_value.saturating_sub(SENSOR_SWEEP_STEP);
            self.sweep_up = self.sensor_value == 0;
        }
    }

    fn report(&self, timestamp: i64) -> Report {
        Report {
            is_on: self.is_on,
            brightness: self.brightness,
            sensor_value: self.sensor_value,
            is_auto_mode: self.is_auto_mode,
            timestamp,
        }
    }
}

async fn publish_report(client: &AsyncClient, topic: &str, lamp: &Lamp) {
    let report = lamp.report(chrono::Utc::now().timestamp());
    let payload = match serde_json::to_vec(&report) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            return;
        }
    };
    match client
        .publish(topic.to_string(), QoS::AtLeastOnce, false, payload)
        .await
    {
        Ok(()) => info!(?report, "Telemetry sent"),
        Err(e) => warn!("Failed to publish telemetry: {}", e),
    }
}

#[tokio::main]
async fn main() {
    init_default_logging();
    let args = Args::parse();

    let section = MqttSection {
        broker_url: args.broker_url.clone(),
        client_id: args.client_id.clone(),
        username_env: args.username_env.clone(),
        password_env: args.password_env.clone(),
        command_topic: args.command_topic.clone(),
        status_topic: args.status_topic.clone(),
        ..MqttSection::default()
    };
    let options = match configure_mqtt_options(&section) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid broker settings: {}", e);
            process::exit(1);
        }
    };

    let (client, mut event_loop) = AsyncClient::new(options, 16);
    let mut lamp = Lamp::default();
    if let Some(sensor) = args.sensor {
        lamp.sensor_value = sensor;
    }

    let period = Duration::from_secs(args.interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    info!(broker = %args.broker_url, "Simulated lamp starting");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down simulated lamp");
                let _ = client.disconnect().await;
                break;
            }
            _ = ticker.tick(), if args.interval_secs > 0 => {
                if args.sensor.is_none() {
                    lamp.sweep_sensor();
                }
                publish_report(&client, &args.status_topic, &lamp).await;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %args.command_topic, "Connected; subscribing to commands");
                    if let Err(e) = client.subscribe(args.command_topic.clone(), QoS::AtLeastOnce).await {
                        error!("Subscribe failed: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match serde_json::from_slice::<DeviceCommand>(&publish.payload) {
                        Ok(command) => {
                            info!(command = command.kind(), "Command received");
                            lamp.apply(&command);
                            publish_report(&client, &args.status_topic, &lamp).await;
                        }
                        Err(e) => warn!("Ignoring unparseable command: {}", e),
                    }
                }
                Ok(other) => debug!(?other, "MQTT event"),
                Err(e) => {
                    warn!("Connection error: {}; retrying", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
