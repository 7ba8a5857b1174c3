//! Request validation at the HTTP boundary: type, length and format checks.
//! SQL is always parameterized, so nothing here escapes or rewrites input.

use crate::error::TopicError;
use crate::models::{BrokerConfig, MAX_RELAY_INDEX, MIN_RELAY_INDEX};
use crate::topic::{validate_topic_name, TopicFilter};
use crate::transport::qos_from_u8;
use rumqttc::QoS;
use thiserror::Error;

const MAX_ID_LEN: usize = 64;
const MAX_NAME_LEN: usize = 100;
const MAX_HOST_LEN: usize = 253;
const MAX_CREDENTIAL_LEN: usize = 256;
const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field} must be 1-{max} characters")]
    Length { field: &'static str, max: usize },
    #[error("{field} may only contain letters, digits, '-', '_' and '.'")]
    Characters { field: &'static str },
    #[error("port must be between 1 and 65535")]
    Port,
    #[error("qos must be 0, 1 or 2")]
    Qos,
    #[error("relay must be between {} and {}", MIN_RELAY_INDEX, MAX_RELAY_INDEX)]
    Relay,
    #[error("payload exceeds {} bytes", MAX_PAYLOAD_BYTES)]
    PayloadTooLarge,
    #[error("password given without username")]
    PasswordWithoutUser,
    #[error(transparent)]
    Topic(#[from] TopicError),
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() || value.chars().count() > max {
        return Err(ValidationError::Length { field, max });
    }
    Ok(())
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    check_len(field, value, MAX_ID_LEN)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::Characters { field });
    }
    Ok(())
}

pub fn broker_id(value: &str) -> Result<(), ValidationError> {
    check_identifier("broker_id", value)
}

/// Device ids become a topic level, so anything MQTT treats specially is out.
pub fn device_id(value: &str) -> Result<(), ValidationError> {
    check_identifier("device_id", value)
}

pub fn broker_config(config: &BrokerConfig) -> Result<(), ValidationError> {
    check_len("name", &config.name, MAX_NAME_LEN)?;
    check_len("host", &config.host, MAX_HOST_LEN)?;
    if config.host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ValidationError::Characters { field: "host" });
    }
    if config.port == 0 {
        return Err(ValidationError::Port);
    }
    match (&config.username, &config.password) {
        (None, Some(_)) => return Err(ValidationError::PasswordWithoutUser),
        (Some(user), _) => check_len("username", user, MAX_CREDENTIAL_LEN)?,
        _ => {}
    }
    if let Some(password) = &config.password {
        if password.len() > MAX_CREDENTIAL_LEN {
            return Err(ValidationError::Length {
                field: "password",
                max: MAX_CREDENTIAL_LEN,
            });
        }
    }
    Ok(())
}

pub fn qos(level: u8) -> Result<QoS, ValidationError> {
    qos_from_u8(level).ok_or(ValidationError::Qos)
}

pub fn relay_index(index: u8) -> Result<u8, ValidationError> {
    if (MIN_RELAY_INDEX..=MAX_RELAY_INDEX).contains(&index) {
        Ok(index)
    } else {
        Err(ValidationError::Relay)
    }
}

pub fn publish_request(topic: &str, payload: &str) -> Result<(), ValidationError> {
    validate_topic_name(topic)?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge);
    }
    Ok(())
}

pub fn subscription_filter(filter: &str) -> Result<(), ValidationError> {
    TopicFilter::parse(filter)?;
    Ok(())
}

pub fn name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    check_len(field, value, MAX_NAME_LEN)
}
