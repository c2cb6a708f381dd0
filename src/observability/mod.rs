//! Observability: structured logging, process-wide counters and health
//! reports for the probe endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::{liveness, HealthChecker, HealthStatus, ReadinessResponse};
pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, mqtt_span, telemetry_span};
