//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (telemetry ingestion, command publishing,
//! MQTT connection churn) and a mutex-protected table of control-request
//! counts per action. Served as JSON at `/metrics`.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_INGEST_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Telemetry ingestion
    telemetry_received: AtomicU64,
    telemetry_rejected: AtomicU64,
    history_rows_written: AtomicU64,
    persistence_failures: AtomicU64,
    ingest_times: Mutex<Vec<u64>>, // microseconds

    // Outbound commands
    commands_published: AtomicU64,
    commands_dropped: AtomicU64,
    auto_commands: AtomicU64,
    control_requests: Mutex<BTreeMap<String, ActionCounts>>,

    // MQTT session
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    reconnects: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ActionCounts {
    pub accepted: u64,
    pub rejected: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            telemetry_received: AtomicU64::new(0),
            telemetry_rejected: AtomicU64::new(0),
            history_rows_written: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            ingest_times: Mutex::new(Vec::new()),
            commands_published: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            auto_commands: AtomicU64::new(0),
            control_requests: Mutex::new(BTreeMap::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Telemetry metrics
    pub fn telemetry_received(&self) {
        self.telemetry_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_rejected(&self) {
        self.telemetry_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn history_row_written(&self, duration: Duration) {
        self.history_rows_written.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.ingest_times.lock() {
            times.push(duration.as_micros() as u64);
            if times.len() > MAX_INGEST_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Command metrics
    pub fn command_published(&self) {
        self.commands_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auto_command_issued(&self) {
        self.auto_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a control request by action name
    pub fn control_request(&self, action: &str, accepted: bool) {
        if let Ok(mut table) = self.control_requests.lock() {
            let counts = table.entry(action.to_string()).or_default();
            if accepted {
                counts.accepted += 1;
            } else {
                counts.rejected += 1;
            }
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.telemetry_received,
            &self.telemetry_rejected,
            &self.history_rows_written,
            &self.persistence_failures,
            &self.commands_published,
            &self.commands_dropped,
            &self.auto_commands,
            &self.connection_attempts,
            &self.connections_established,
            &self.connections_lost,
            &self.reconnects,
            &self.connection_start_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.ingest_times.lock() {
            times.clear();
        }
        if let Ok(mut table) = self.control_requests.lock() {
            table.clear();
        }
    }

    fn ingest_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.ingest_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_ingest_us, p50, p95) = self.ingest_time_statistics();
        let control_requests = self
            .control_requests
            .lock()
            .map(|table| table.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            telemetry: TelemetryMetrics {
                received: self.telemetry_received.load(Ordering::Relaxed),
                rejected: self.telemetry_rejected.load(Ordering::Relaxed),
                history_rows_written: self.history_rows_written.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
                avg_ingest_time_us: avg_ingest_us,
                ingest_time_p50_us: p50,
                ingest_time_p95_us: p95,
            },
            commands: CommandMetrics {
                published: self.commands_published.load(Ordering::Relaxed),
                dropped: self.commands_dropped.load(Ordering::Relaxed),
                auto_commands: self.auto_commands.load(Ordering::Relaxed),
                control_requests,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub telemetry: TelemetryMetrics,
    pub commands: CommandMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TelemetryMetrics {
    pub received: u64,
    pub rejected: u64,
    pub history_rows_written: u64,
    pub persistence_failures: u64,
    pub avg_ingest_time_us: f64,
    pub ingest_time_p50_us: f64,
    pub ingest_time_p95_us: f64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub published: u64,
    pub dropped: u64,
    pub auto_commands: u64,
    pub control_requests: BTreeMap<String, ActionCounts>,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub reconnects: u64,
    pub connection_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
