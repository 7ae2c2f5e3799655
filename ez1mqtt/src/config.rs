use std::{fs, path::Path, str::FromStr, time::Duration};

use log::info;
use serde_derive::Deserialize;

use crate::error::ConfigError;
use crate::sources::ez1::inverter::DEFAULT_PORT;
use crate::sun_window::{LocalZone, Position};
use crate::targets::mqtt::mqtt_config::MqttConfig;
use crate::targets::mqtt::mqtt_wrapper::QoS;

const MIN_REQUEST_TIMEOUT_SECS: u64 = 2;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EcuConfig {
    pub ip: String,
    pub port: u16,
    /// Seconds between two polls.
    pub update_interval: u64,
    /// Seconds, defaults to the update interval capped at 10s.
    pub request_timeout: Option<u64>,
    pub timezone: Option<String>,
    pub stop_at_night: bool,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: DEFAULT_PORT,
            update_interval: 15,
            request_timeout: None,
            timezone: None,
            stop_at_night: false,
            latitude: 52.5162,
            longitude: 13.3777,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub ecu: EcuConfig,
    pub mqtt: MqttConfig,
}

/// Validated runtime settings, everything the poll loop needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub ecu_host: String,
    pub ecu_port: u16,
    pub update_interval: Duration,
    pub request_timeout: Duration,
    pub stop_at_night: bool,
    pub position: Position,
    pub zone: LocalZone,
    pub qos: QoS,
}

impl Settings {
    /// Link shown on the Home Assistant device page.
    pub fn configuration_url(&self) -> String {
        format!("http://{}:{}/getAlarm", self.ecu_host, self.ecu_port)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Reads `path`, else `$CONFIG_FILE`, else starts from defaults, then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let from_env = std::env::var("CONFIG_FILE").ok();
        let path = path.or(from_env.as_deref().map(Path::new));

        let mut config = match path {
            Some(path) => {
                info!("loading configuration from {}", path.display());
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str::<Config>(&contents)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overwrites fields for which `lookup` knows a value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ecu = &mut self.ecu;
        if let Some(v) = lookup("APS_ECU_IP") {
            ecu.ip = v;
        }
        if let Some(v) = lookup("APS_ECU_PORT") {
            ecu.port = parse_value("APS_ECU_PORT", &v)?;
        }
        if let Some(v) = lookup("APS_ECU_UPDATE_INTERVAL") {
            ecu.update_interval = parse_value("APS_ECU_UPDATE_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("APS_ECU_REQUEST_TIMEOUT") {
            ecu.request_timeout = Some(parse_value("APS_ECU_REQUEST_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("APS_ECU_TIMEZONE") {
            ecu.timezone = Some(v);
        }
        if let Some(v) = lookup("APS_ECU_STOP_AT_NIGHT") {
            ecu.stop_at_night = parse_bool("APS_ECU_STOP_AT_NIGHT", &v)?;
        }
        if let Some(v) = lookup("APS_ECU_POSITION_LAT") {
            ecu.latitude = parse_value("APS_ECU_POSITION_LAT", &v)?;
        }
        if let Some(v) = lookup("APS_ECU_POSITION_LNG") {
            ecu.longitude = parse_value("APS_ECU_POSITION_LNG", &v)?;
        }

        let mqtt = &mut self.mqtt;
        if let Some(v) = lookup("MQTT_BROKER_HOST") {
            mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_BROKER_PORT") {
            mqtt.port = Some(parse_value("MQTT_BROKER_PORT", &v)?);
        }
        if let Some(v) = lookup("MQTT_BROKER_USER") {
            mqtt.username = Some(v).filter(|u| !u.trim().is_empty());
        }
        if let Some(v) = lookup("MQTT_BROKER_PASSWD") {
            mqtt.password = Some(v);
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            mqtt.client_id = v;
        }
        if let Some(v) = lookup("MQTT_BROKER_SECURED_CONNECTION") {
            mqtt.tls = Some(parse_bool("MQTT_BROKER_SECURED_CONNECTION", &v)?);
        }
        if let Some(v) = lookup("MQTT_TOPIC_PREFIX") {
            mqtt.topic_prefix = Some(v);
        }
        if let Some(v) = lookup("MQTT_QOS") {
            mqtt.qos = parse_value("MQTT_QOS", &v)?;
        }

        let homa = &mut mqtt.homa;
        if let Some(v) = lookup("HOMA_ENABLED") {
            homa.enabled = parse_bool("HOMA_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HOMA_SYSTEMID") {
            homa.system_id = v;
        }
        if let Some(v) = lookup("HOMA_ROOM") {
            homa.room = v;
        }
        if let Some(v) = lookup("HOMA_NAME") {
            homa.name = v;
        }

        let hass = &mut mqtt.hass;
        if let Some(v) = lookup("HASS_ENABLED") {
            hass.enabled = parse_bool("HASS_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HASS_DEVICE_ID") {
            hass.device_id = v;
        }
        if let Some(v) = lookup("HASS_DEVICE_NAME") {
            hass.device_name = v;
        }
        if let Some(v) = lookup("HASS_NAME_PREFIX") {
            hass.name_prefix = v;
        }
        if let Some(v) = lookup("HASS_AREA") {
            hass.area = v;
        }
        if let Some(v) = lookup("HASS_STATE_TOPIC_BASE") {
            hass.state_topic_base = Some(v);
        }
        Ok(())
    }

    /// Checks mandatory fields and resolves position, zone and timings.
    /// `env_tz` is the value of `$TZ`, consulted when no zone is configured.
    pub fn validate(&self, env_tz: Option<&str>) -> Result<Settings, ConfigError> {
        if self.ecu.ip.trim().is_empty() {
            return Err(ConfigError::MissingEcuIp);
        }
        if self.ecu.update_interval == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        let request_timeout = Duration::from_secs(
            self.ecu
                .request_timeout
                .unwrap_or(self.ecu.update_interval.min(MAX_REQUEST_TIMEOUT_SECS)),
        );
        if request_timeout <= Duration::from_secs(MIN_REQUEST_TIMEOUT_SECS) {
            return Err(ConfigError::RequestTimeoutTooLow(request_timeout));
        }

        Ok(Settings {
            ecu_host: self.ecu.ip.trim().to_string(),
            ecu_port: self.ecu.port,
            update_interval: Duration::from_secs(self.ecu.update_interval),
            request_timeout,
            stop_at_night: self.ecu.stop_at_night,
            position: Position::new(self.ecu.latitude, self.ecu.longitude)?,
            zone: LocalZone::resolve(self.ecu.timezone.as_deref(), env_tz)?,
            qos: QoS::try_from(self.mqtt.qos)?,
        })
    }
}
