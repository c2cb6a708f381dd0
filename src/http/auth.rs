//! Bearer-token authentication for the device API
//!
//! Tokens are issued elsewhere; this side only maps a presented token to a
//! configured user, or rejects the call.

use crate::config::{ConfigError, LightConfig};
use std::collections::HashMap;
use thiserror::Error;

/// Authentication failures; all map to 401
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingCredentials,
    #[error("Authorization header must use the Bearer scheme")]
    InvalidScheme,
    #[error("Invalid or expired token")]
    InvalidToken,
}

/// Identity of an authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            username: "anonymous".to_string(),
        }
    }
}

/// "Current caller identity or reject", consulted on every protected call
pub trait Authenticator: Send + Sync {
    /// `header` is the raw `Authorization` header value, if any
    fn authenticate(&self, header: Option<&str>) -> Result<Caller, AuthError>;
}

/// Fixed token table resolved at startup
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    enabled: bool,
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Authenticator accepting the given `(username, token)` pairs
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            enabled: true,
            tokens: tokens
                .into_iter()
                .map(|(username, token)| (token, username))
                .collect(),
        }
    }

    /// Authenticator that lets every caller through as `anonymous`
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from the `[auth]` section, reading tokens from the environment
    pub fn from_config(config: &LightConfig) -> Result<Self, ConfigError> {
        if !config.auth.enabled {
            return Ok(Self::disabled());
        }
        Ok(Self::new(config.resolve_api_tokens()?))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Extract the token from a `Bearer <token>` header value (pure function)
pub fn parse_bearer(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidScheme)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidScheme);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidToken);
    }
    Ok(token)
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, header: Option<&str>) -> Result<Caller, AuthError> {
        if !self.enabled {
            return Ok(Caller::anonymous());
        }
        let token = parse_bearer(header.ok_or(AuthError::MissingCredentials)?)?;
        self.tokens
            .get(token)
            .map(|username| Caller {
                username: username.clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> StaticTokenAuthenticator {
        StaticTokenAuthenticator::new([("admin".to_string(), "s3cret".to_string())])
    }

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer abc"), Ok("abc"));
        assert_eq!(parse_bearer("bearer   abc  "), Ok("abc"));
        assert_eq!(parse_bearer("Basic abc"), Err(AuthError::InvalidScheme));
        assert_eq!(parse_bearer("Bearer"), Err(AuthError::InvalidScheme));
        assert_eq!(parse_bearer("Bearer  "), Err(AuthError::InvalidScheme));
    }

    #[test]
    fn test_known_token_maps_to_user() {
        let caller = authenticator().authenticate(Some("Bearer s3cret")).unwrap();
        assert_eq!(caller.username, "admin");
    }

    #[test]
    fn test_rejections() {
        let auth = authenticator();
        assert_eq!(auth.authenticate(None), Err(AuthError::MissingCredentials));
        assert_eq!(
            auth.authenticate(Some("Bearer wrong")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.authenticate(Some("Token s3cret")),
            Err(AuthError::InvalidScheme)
        );
    }

    #[test]
    fn test_disabled_lets_everyone_in() {
        let auth = StaticTokenAuthenticator::disabled();
        assert!(!auth.is_enabled());
        assert_eq!(auth.authenticate(None), Ok(Caller::anonymous()));
    }

    #[test]
    fn test_from_config_reads_env() {
        let mut config = LightConfig::default();
        config.auth.users.push(crate::config::AuthUser {
            username: "ops".to_string(),
            token_env: "SMARTLIGHT_TEST_AUTH_TOKEN_OPS".to_string(),
        });
        assert!(StaticTokenAuthenticator::from_config(&config).is_err());

        std::env::set_var("SMARTLIGHT_TEST_AUTH_TOKEN_OPS", "ops-token");
        let auth = StaticTokenAuthenticator::from_config(&config).unwrap();
        assert_eq!(auth.user_count(), 1);
        assert_eq!(
            auth.authenticate(Some("Bearer ops-token")).unwrap().username,
            "ops"
        );
        std::env::remove_var("SMARTLIGHT_TEST_AUTH_TOKEN_OPS");

        config.auth.enabled = false;
        assert!(!StaticTokenAuthenticator::from_config(&config)
            .unwrap()
            .is_enabled());
    }
}
