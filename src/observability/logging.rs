//! Structured logging setup and span helpers
//!
//! Output is configured from the environment:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: `json` for log shippers, `pretty` for local debugging,
//!   `compact` for a terminal (default json)
//! - `LOG_SPANS`: `true` to emit span open/close events
//! - `RUST_LOG`: full `EnvFilter` override
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG smartlight run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose info-level output is noise for operators
const QUIET_CRATES: &[&str] = &["rumqttc", "hyper", "warp", "sqlx", "tokio"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Case-insensitive; anything unrecognised means JSON
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl LogSettings {
    /// Read options through `lookup` (pure function given `lookup`)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: lookup("LOG_LEVEL")
                .map(|value| parse_level(&value))
                .unwrap_or(Level::INFO),
            format: lookup("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or(LogFormat::Json),
            include_spans: lookup("LOG_SPANS")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber; `RUST_LOG` wins over `settings.level`
pub fn init_logging(settings: LogSettings) {
    let filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => default_filter(settings.level),
    };
    let spans = span_events(settings.include_spans);
    let registry = tracing_subscriber::registry().with(filter);

    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_span_events(spans))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_span_events(spans),
            )
            .init(),
    }
}

/// Filter at `level` with chatty dependencies capped at warn
pub fn default_filter(level: Level) -> EnvFilter {
    QUIET_CRATES
        .iter()
        .fold(EnvFilter::new(level.to_string()), |filter, krate| {
            match format!("{krate}=warn").parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        })
}

/// Parse a `LOG_LEVEL` value; unknown values mean INFO
pub fn parse_level(s: &str) -> Level {
    s.trim().parse().unwrap_or(Level::INFO)
}

pub fn init_default_logging() {
    init_logging(LogSettings::from_env());
}

/// Span around one inbound telemetry message
#[macro_export]
macro_rules! telemetry_span {
    ($($field:tt)*) => {
        tracing::info_span!("telemetry", $($field)*)
    };
}

/// Span around one control request or policy command
#[macro_export]
macro_rules! command_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_command", $($field)*)
    };
}

/// Span for the MQTT supervisor task
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_session", $($field)*)
    };
}

pub use {command_span, mqtt_span, telemetry_span};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_log_format_parse() {
        for (input, expected) in [
            ("json", LogFormat::Json),
            ("PRETTY", LogFormat::Pretty),
            ("CoMpAcT", LogFormat::Compact),
            ("xml", LogFormat::Json),
            ("", LogFormat::Json),
        ] {
            assert_eq!(LogFormat::parse(input), expected, "{input}");
        }
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("ERROR"), Level::ERROR);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level(" debug "), Level::DEBUG);
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = LogSettings::from_lookup(lookup(&[]));
        assert_eq!(
            settings,
            LogSettings {
                level: Level::INFO,
                format: LogFormat::Json,
                include_spans: false,
            }
        );
    }

    #[test]
    fn test_settings_from_variables() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "compact"),
            ("LOG_SPANS", "TRUE"),
        ]));
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Compact);
        assert!(settings.include_spans);
    }

    #[test]
    fn test_default_filter_caps_dependencies() {
        let rendered = default_filter(Level::DEBUG).to_string();
        assert!(rendered.contains("debug"));
        for krate in QUIET_CRATES {
            assert!(rendered.contains(&format!("{krate}=warn")), "{rendered}");
        }
    }

    #[test]
    fn test_span_macros_build_spans() {
        let _telemetry = telemetry_span!(bytes = 42usize);
        let _command = command_span!(action = "TOGGLE_POWER");
        let _mqtt = mqtt_span!(client_id = "lamp");
    }
}
