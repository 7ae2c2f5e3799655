use std::time::Duration;

use thiserror::Error;

/// Fatal errors found while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APS_ECU_IP is missing, no inverter address configured")]
    MissingEcuIp,
    #[error("invalid position lat={latitude} lng={longitude}, expected [-90,90] / [-180,180]")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid MQTT QoS {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    #[error("update interval must be at least one second")]
    InvalidInterval,
    #[error("request timeout {0:?} too low, must be more than 2s")]
    RequestTimeoutTooLow(Duration),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("config file unparsable: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Recoverable failures talking to the inverter. Any of these fails the whole poll.
#[derive(Debug, Error)]
pub enum DeviceCommError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("inverter answered with HTTP status {0}")]
    Http(u16),
    #[error("inverter rejected request: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("malformed value for field '{field}'")]
    MalformedField { field: &'static str },
}

impl From<reqwest::Error> for DeviceCommError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeviceCommError::Timeout
        } else if e.is_decode() {
            DeviceCommError::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            DeviceCommError::Http(status.as_u16())
        } else {
            DeviceCommError::Connection(e.to_string())
        }
    }
}

/// A single message the broker client did not accept.
#[derive(Debug, Error)]
#[error("failed to publish to '{topic}': {source}")]
pub struct PublishError {
    pub topic: String,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("daylight window for {date} is malformed: sunrise {sunrise} is not before sunset {sunset}")]
    InvalidDaylightWindow {
        date: chrono::NaiveDate,
        sunrise: chrono::DateTime<chrono::Utc>,
        sunset: chrono::DateTime<chrono::Utc>,
    },
}
