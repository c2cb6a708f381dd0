//! MQTT topic validation
//!
//! The service publishes on one fixed command topic and subscribes to one
//! fixed telemetry topic, so both must be concrete topic names: no wildcards,
//! no empty levels at the edges, and within the MQTT length limit.

use thiserror::Error;

/// Maximum encoded length of an MQTT topic name
pub const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.trim().is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }

    for ch in topic.chars() {
        match ch {
            '+' | '#' => return Err(ValidationError::WildcardInTopic(ch)),
            '\0' => return Err(ValidationError::NullCharacter),
            _ => {}
        }
    }

    Ok(())
}

/// Validation errors for configured topics
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic contains wildcard character: '{0}'")]
    WildcardInTopic(char),
    #[error("Topic contains a NUL character")]
    NullCharacter,
    #[error("Topic is {0} bytes long, exceeding the MQTT limit")]
    TopicTooLong(usize),
}
