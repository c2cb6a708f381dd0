//! Pure health monitoring and reconnection logic for the MQTT client
//!
//! Decides whether to reconnect, how the connection state moves on each
//! event, and how healthy the link to the lamp looks.

use super::connection::{ConnectionState, ReconnectConfig};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// The lamp reports at least this often when it is online
const TELEMETRY_STALE_AFTER: Duration = Duration::from_secs(300);

/// Initial ConnAck wait when retries are unlimited
const UNBOUNDED_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// How long `connect()` waits for the first ConnAck (pure function)
    ///
    /// The server keeps serving HTTP while the supervisor goes on retrying
    /// in the background, so an unbounded schedule gets a short initial wait.
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time) + Duration::from_secs(5),
            None => UNBOUNDED_CONNECT_TIMEOUT,
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for the connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime_secs: uptime.map(|d| d.as_secs()),
            secs_since_last_telemetry: time_since_last_message.map(|d| d.as_secs()),
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    /// Connected, and telemetry is either not yet seen or recent (pure function)
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last)) => last < TELEMETRY_STALE_AFTER,
            _ => false,
        }
    }

    /// Log a connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("MQTT reconnection successful");
            }
            (_, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost; commands will be dropped until it returns");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting MQTT reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                tracing::debug!(target: "mqtt_transport", "MQTT state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate a reconnection schedule (pure function)
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Assess connection quality based on metrics (pure function)
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime_secs) {
            (0, Some(uptime)) if uptime > 3600 => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > 1800 => ConnectionQuality::Good,
            (1..=2, Some(_)) | (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthMetrics {
    pub uptime_secs: Option<u64>,
    pub secs_since_last_telemetry: Option<u64>,
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proceed(attempt: u32, delay_ms: u64) -> ReconnectionDecision {
        ReconnectionDecision::Proceed { attempt, delay_ms }
    }

    #[test]
    fn test_reconnection_follows_backoff_until_limit() {
        let unlimited = ReconnectConfig::default();
        let decide = |attempts, shutdown| {
            HealthMonitor::should_attempt_reconnection(attempts, &unlimited, shutdown)
        };
        assert_eq!(decide(0, false), proceed(1, 500));
        assert_eq!(decide(2, false), proceed(3, 2000));
        assert_eq!(decide(50, false), proceed(51, 5000));
        assert_eq!(decide(0, true), ReconnectionDecision::AbortShutdownRequested);

        let limited = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(1, &limited, false),
            proceed(2, 1000)
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &limited, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_initial_connect_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&ReconnectConfig::default()),
            UNBOUNDED_CONNECT_TIMEOUT
        );
        let limited = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![100, 200],
            sustained_delay: 200,
        };
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&limited),
            Duration::from_millis(5300)
        );
    }

    #[test]
    fn test_state_transitions() {
        let cases = [
            (ConnectionEvent::ConnAckReceived, ConnectionState::Connected),
            (
                ConnectionEvent::DisconnectedByBroker,
                ConnectionState::Disconnected("Broker disconnected".to_string()),
            ),
            (
                ConnectionEvent::NetworkError("refused".to_string()),
                ConnectionState::Disconnected("refused".to_string()),
            ),
            (
                ConnectionEvent::ReconnectionStarted(4),
                ConnectionState::Reconnecting(4),
            ),
            (
                ConnectionEvent::PermanentFailure("gave up".to_string()),
                ConnectionState::PermanentlyDisconnected("gave up".to_string()),
            ),
        ];
        for (event, expected) in cases {
            let next = HealthMonitor::determine_next_state(event);
            assert_eq!(next, expected);
            assert_eq!(
                HealthMonitor::can_publish(&next),
                next == ConnectionState::Connected
            );
        }
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
    }

    #[test]
    fn test_link_health_tracks_telemetry_age() {
        let now = Instant::now();
        let connected = Some(now - Duration::from_secs(120));

        let fresh = HealthMonitor::calculate_health_metrics(
            connected,
            Some(now - Duration::from_secs(10)),
            1,
        );
        assert_eq!(fresh.uptime_secs, Some(120));
        assert_eq!(fresh.secs_since_last_telemetry, Some(10));
        assert!(fresh.is_healthy);

        let silent_lamp = HealthMonitor::calculate_health_metrics(
            connected,
            Some(now - TELEMETRY_STALE_AFTER - Duration::from_secs(1)),
            1,
        );
        assert!(!silent_lamp.is_healthy);

        assert!(HealthMonitor::calculate_health_metrics(connected, None, 0).is_healthy);
        assert!(!HealthMonitor::calculate_health_metrics(None, None, 0).is_healthy);
    }

    #[test]
    fn test_reconnect_schedule_validation() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());
        for broken in [
            ReconnectConfig {
                max_attempts: Some(0),
                ..Default::default()
            },
            ReconnectConfig {
                sustained_delay: 0,
                ..Default::default()
            },
        ] {
            assert!(HealthMonitor::validate_connection_config(&broken).is_err());
        }
    }

    #[test]
    fn test_connection_quality_grades() {
        let grade = |uptime_secs, reconnect_count, is_healthy| {
            HealthMonitor::assess_connection_quality(&HealthMetrics {
                uptime_secs,
                secs_since_last_telemetry: Some(5),
                reconnect_count,
                is_healthy,
            })
        };
        assert_eq!(grade(Some(7200), 0, true), ConnectionQuality::Excellent);
        assert_eq!(grade(Some(60), 0, true), ConnectionQuality::Good);
        assert_eq!(grade(Some(2000), 1, true), ConnectionQuality::Good);
        assert_eq!(grade(Some(60), 4, true), ConnectionQuality::Fair);
        assert_eq!(grade(Some(60), 9, true), ConnectionQuality::Poor);
        assert_eq!(grade(Some(60), 20, true), ConnectionQuality::Critical);
        assert_eq!(grade(Some(7200), 0, false), ConnectionQuality::Critical);
    }
}
