//! Error taxonomy for the smart light service
//!
//! Every failure surfaced by the control engine maps onto one of the
//! `LightError` variants. HTTP handlers turn them into status codes and a
//! sanitised `{"detail": ...}` body.

use crate::config::ConfigError;
use crate::http::auth::AuthError;
use crate::store::StoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Main error type for device control operations
#[derive(Debug, Error)]
pub enum LightError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    #[error("Transport unavailable: {message}")]
    TransportUnavailable { message: String },

    #[error("Malformed telemetry: {message}")]
    MalformedTelemetry { message: String },

    #[error("Persistence failure: {0}")]
    Persistence(#[source] StoreError),

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

impl From<StoreError> for LightError {
    fn from(error: StoreError) -> Self {
        match error {
            // A rejected mutation never touched storage; it is a caller error.
            StoreError::Rejected(message) => Self::InvalidArgument { message },
            other => Self::Persistence(other),
        }
    }
}

/// JSON body returned for failed HTTP requests
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub detail: String,
}

impl LightError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create unknown action error
    pub fn unknown_action<S: Into<String>>(action: S) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Create transport unavailable error
    pub fn transport_unavailable<S: Into<String>>(message: S) -> Self {
        Self::TransportUnavailable {
            message: message.into(),
        }
    }

    /// Create malformed telemetry error
    pub fn malformed_telemetry<S: Into<String>>(message: S) -> Self {
        Self::MalformedTelemetry {
            message: message.into(),
        }
    }

    /// HTTP status code for this error when it reaches a request handler
    pub fn status_code(&self) -> u16 {
        match self {
            LightError::InvalidArgument { .. } | LightError::UnknownAction { .. } => 400,
            LightError::Unauthorized(_) => 401,
            LightError::TransportUnavailable { .. } => 503,
            LightError::MalformedTelemetry { .. } => 422,
            LightError::Persistence(_) | LightError::ConfigError(_) => 500,
        }
    }

    /// Convert into the response body, stripping anything that looks like a secret
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            detail: sanitize_error_message(&self.to_string()),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

/// Sanitize error messages before they leave the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for device control operations
pub type LightResult<T> = Result<T, LightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_constructor() {
        let error = LightError::invalid_argument("brightness must be within 0..=100");
        assert!(matches!(error, LightError::InvalidArgument { .. }));
        assert_eq!(
            error.to_string(),
            "Invalid argument: brightness must be within 0..=100"
        );
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_unknown_action_constructor() {
        let error = LightError::unknown_action("REBOOT");
        assert_eq!(error.to_string(), "Unknown action: REBOOT");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_rejected_store_mutation_is_invalid_argument() {
        let error: LightError = StoreError::Rejected("low must be below high".to_string()).into();
        assert!(matches!(error, LightError::InvalidArgument { .. }));
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_database_failure_is_persistence() {
        let error: LightError = StoreError::Database(sqlx::Error::PoolClosed).into();
        assert!(matches!(error, LightError::Persistence(_)));
        assert_eq!(error.status_code(), 500);
    }

    #[test]
    fn test_error_body_sanitization() {
        let error = LightError::invalid_argument("bad credentials password=hunter2 token=abc");
        let body = error.to_error_body();
        assert!(!body.detail.contains("hunter2"));
        assert!(!body.detail.contains("abc"));
        assert!(body.detail.contains("password=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_message = "é".repeat(400);
        let sanitized = sanitize_error_message(&long_message);
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }
}
