use rand::{distr::Alphanumeric, Rng};
use serde::Deserialize;

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_client_id() -> String {
    format!(
        "ez1-mqtt-{}",
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect::<String>()
    )
}

fn default_qos() -> u8 {
    1
}

/// HomA convention, `/devices/{system_id}/controls/{name}`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HomaConfig {
    pub enabled: bool,
    /// Falls back to the inverter's device id when empty.
    pub system_id: String,
    pub room: String,
    pub name: String,
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            system_id: String::new(),
            room: "Sensors".into(),
            name: "Solar PV".into(),
        }
    }
}

/// Home Assistant MQTT discovery.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HassConfig {
    pub enabled: bool,
    /// Falls back to the inverter's device id when empty.
    pub device_id: String,
    pub device_name: String,
    pub name_prefix: String,
    pub area: String,
    /// Defaults to `ez1/{device_id}`.
    pub state_topic_base: Option<String>,
}

impl Default for HassConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_id: String::new(),
            device_name: "Solar PV".into(),
            name_prefix: String::new(),
            area: "Energie".into(),
            state_topic_base: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Plain topics, `{topic_prefix}{name}`. Ignored while HomA is enabled.
    pub topic_prefix: Option<String>,
    #[serde(default)]
    pub homa: HomaConfig,
    #[serde(default)]
    pub hass: HassConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            username: None,
            password: None,
            tls: None,
            client_id: default_client_id(),
            qos: default_qos(),
            topic_prefix: None,
            homa: HomaConfig::default(),
            hass: HassConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn use_tls(&self) -> bool {
        self.tls.is_some_and(|tls| tls)
    }

    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or_else(|| if self.use_tls() { 8883 } else { 1883 })
    }
}

#[cfg(test)]
mod test {
    use super::MqttConfig;

    #[test]
    fn test_deserialize() {
        let conf_str = include_str!("../../../test/configs/test_mqtt_conf.yaml");
        let conf: MqttConfig = serde_yaml::from_str(conf_str).unwrap();

        assert_eq!(conf.host, "::1");
        assert_eq!(conf.username.unwrap(), "test");
        assert_eq!(conf.password.unwrap(), "testpw");
        assert_eq!(conf.tls, None);
        assert_eq!(conf.qos, 1);
        assert!(conf.client_id.starts_with("ez1-mqtt-"));
        assert_eq!(conf.topic_prefix.as_deref(), Some("/aps/"));
        assert!(conf.homa.enabled);
        assert_eq!(conf.homa.system_id, "123456-solar");
        assert_eq!(conf.homa.room, "Sensors");
        assert!(!conf.hass.enabled);
        assert_eq!(conf.hass.area, "Energie");
    }

    #[test]
    fn test_default_ports() {
        let mut conf = MqttConfig::default();
        assert_eq!(conf.port(), 1883);
        conf.tls = Some(true);
        assert_eq!(conf.port(), 8883);
        conf.port = Some(1234);
        assert_eq!(conf.port(), 1234);
    }
}
