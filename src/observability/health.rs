//! Health reporting for container orchestration
//!
//! Builds the bodies served at `/health`, `/ready` and `/live`. The service
//! is ready when the broker session is up and the store answers a ping.

use crate::observability::metrics::metrics;
use crate::store::StateStore;
use crate::transport::mqtt::{ConnectionQuality, HealthMonitor};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const TELEMETRY_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// Collects health checks from the transport and the store
pub struct HealthChecker<T: Transport> {
    store: Arc<dyn StateStore>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for HealthChecker<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> HealthChecker<T> {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<T>) -> Self {
        Self { store, transport }
    }

    /// Overall status with one entry per check
    pub async fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();

        let mut checks = BTreeMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert("store".to_string(), self.check_store_health().await);
        checks.insert("telemetry".to_string(), self.check_telemetry_health());

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        let status = if overall_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        };

        let link_quality = self
            .transport
            .link_health()
            .map(|link| HealthMonitor::assess_connection_quality(&link));

        HealthStatus {
            status,
            timestamp: now,
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            store_backend: self.store.backend_name().to_string(),
            link_quality,
            checks,
        }
    }

    /// Readiness: the lamp can be reached and state can be recorded
    pub async fn readiness(&self) -> ReadinessResponse {
        let mqtt_connected = self.transport.is_connected();
        let store_reachable = self.store.ping().await.is_ok();
        ReadinessResponse {
            ready: mqtt_connected && store_reachable,
            mqtt_connected,
            store_reachable,
            timestamp: current_timestamp(),
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        let now = current_timestamp();
        match self.transport.connection_state() {
            Some(state) if self.transport.is_connected() => HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!("MQTT session {}", state.label())),
                last_check: now,
            },
            Some(state) => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("MQTT session {state:?}")),
                last_check: now,
            },
            None => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("MQTT client never connected".to_string()),
                last_check: now,
            },
        }
    }

    async fn check_store_health(&self) -> HealthCheck {
        let now = current_timestamp();
        match self.store.ping().await {
            Ok(()) => HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!("{} store reachable", self.store.backend_name())),
                last_check: now,
            },
            Err(e) => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(e.to_string()),
                last_check: now,
            },
        }
    }

    fn check_telemetry_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let since_last = self
            .transport
            .link_health()
            .and_then(|link| link.secs_since_last_telemetry);
        telemetry_check(since_last, now)
    }
}

/// Freshness of the device's feedback (pure function)
fn telemetry_check(secs_since_last: Option<u64>, now: u64) -> HealthCheck {
    match secs_since_last {
        None => HealthCheck {
            status: "healthy".to_string(),
            message: Some("No telemetry received yet".to_string()),
            last_check: now,
        },
        Some(age) if age > TELEMETRY_STALENESS_THRESHOLD_SECONDS => HealthCheck {
            status: "stale".to_string(),
            message: Some(format!("No telemetry for {age} seconds")),
            last_check: now,
        },
        Some(_) => HealthCheck {
            status: "healthy".to_string(),
            message: Some("Recent telemetry".to_string()),
            last_check: now,
        },
    }
}

/// Liveness never depends on collaborators
pub fn liveness() -> LivenessResponse {
    LivenessResponse {
        alive: true,
        timestamp: current_timestamp(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub store_backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_quality: Option<ConnectionQuality>,
    pub checks: BTreeMap<String, HealthCheck>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub mqtt_connected: bool,
    pub store_reachable: bool,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FailingStore, MockTransport};

    #[tokio::test]
    async fn test_healthy_when_connected() {
        let checker = HealthChecker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockTransport::new()),
        );
        let status = checker.health_status().await;
        assert!(status.is_healthy());
        assert_eq!(status.store_backend, "memory");
        assert!(status.checks.contains_key("mqtt"));
        assert!(status.checks.contains_key("store"));
        assert!(status.link_quality.is_none());

        let ready = checker.readiness().await;
        assert!(ready.ready);
    }

    #[tokio::test]
    async fn test_degraded_when_broker_down() {
        let checker = HealthChecker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockTransport::disconnected()),
        );
        let status = checker.health_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks["mqtt"].status, "unhealthy");

        let ready = checker.readiness().await;
        assert!(!ready.ready);
        assert!(!ready.mqtt_connected);
        assert!(ready.store_reachable);
    }

    #[tokio::test]
    async fn test_not_ready_when_store_down() {
        let checker = HealthChecker::new(
            Arc::new(FailingStore::unavailable()),
            Arc::new(MockTransport::new()),
        );
        let ready = checker.readiness().await;
        assert!(!ready.ready);
        assert!(ready.mqtt_connected);
        assert!(!ready.store_reachable);

        let status = checker.health_status().await;
        assert_eq!(status.checks["store"].status, "unhealthy");
    }

    #[test]
    fn test_telemetry_staleness() {
        assert_eq!(telemetry_check(None, 0).status, "healthy");
        assert_eq!(telemetry_check(Some(10), 0).status, "healthy");
        assert_eq!(telemetry_check(Some(600), 0).status, "stale");
    }

    #[test]
    fn test_liveness_is_unconditional() {
        assert!(liveness().alive);
    }
}
