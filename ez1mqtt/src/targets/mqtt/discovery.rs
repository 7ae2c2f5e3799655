use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use serde::Serialize;

use crate::error::PublishError;
use crate::reading::{MetricDescriptor, MetricId, METRICS, SETTINGS};
use crate::targets::mqtt::mqtt_wrapper::{MqttWrapper, QoS};
use crate::targets::mqtt::topic_mapper::HassTarget;

/// `DeviceConfig` groups all sensors of one inverter in Home Assistant.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
    sw_version: String, // firmware reported by the inverter
    #[serde(skip_serializing_if = "Option::is_none")]
    suggested_area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    configuration_url: Option<String>,
}

impl DeviceConfig {
    pub fn new(target: &HassTarget) -> Self {
        Self {
            identifiers: vec![target.device_id.clone()],
            name: target.device_name.clone(),
            manufacturer: "APsystems".to_string(),
            model: "EZ1".to_string(),
            sw_version: target.sw_version.clone(),
            suggested_area: Some(target.area.clone()).filter(|a| !a.is_empty()),
            configuration_url: target.configuration_url.clone(),
        }
    }
}

/// `SensorConfig` is the payload of one MQTT discovery message.
///
/// More information about the MQTT discovery protocol can be found here:
/// https://www.home-assistant.io/integrations/mqtt/#mqtt-discovery
///
#[derive(Serialize, Debug, PartialEq)]
pub struct SensorConfig {
    name: String,
    unique_id: String,
    object_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    device_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<String>,
    device: DeviceConfig,
}

impl SensorConfig {
    pub fn new(
        target: &HassTarget,
        descriptor: &MetricDescriptor,
        availability_topic: Option<&str>,
    ) -> Self {
        let object_id = target.object_id(descriptor);
        Self {
            name: format!("{}{}", target.name_prefix, descriptor.name),
            unique_id: object_id.clone(),
            object_id,
            state_topic: target.state_topic(descriptor),
            availability_topic: availability_topic.map(str::to_string),
            unit_of_measurement: Some(descriptor.unit)
                .filter(|unit| !unit.is_empty())
                .map(str::to_string),
            device_class: descriptor.device_class.to_string(),
            state_class: descriptor.state_class.map(str::to_string),
            payload_on: descriptor.is_binary().then(|| "1".to_string()),
            payload_off: descriptor.is_binary().then(|| "0".to_string()),
            device: DeviceConfig::new(target),
        }
    }
}

/// Announces every metric to Home Assistant once per process lifetime.
///
/// The registry is keyed by the discovery target's device id. A slot is claimed
/// under the lock before publishing, so racing callers for one metric produce a
/// single message; a failed publish gives the slot back.
pub struct DiscoveryPublisher {
    registry: Mutex<HashMap<String, HashSet<MetricId>>>,
    availability_topic: Option<String>,
    qos: QoS,
    retain: bool,
}

impl DiscoveryPublisher {
    pub fn new(availability_topic: Option<String>, qos: QoS) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            availability_topic,
            qos,
            retain: true,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, HashSet<MetricId>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, target: &HassTarget, metric: MetricId) -> bool {
        self.registry()
            .entry(target.device_id.clone())
            .or_default()
            .insert(metric)
    }

    fn release(&self, target: &HassTarget, metric: MetricId) {
        if let Some(metrics) = self.registry().get_mut(&target.device_id) {
            metrics.remove(&metric);
        }
    }

    pub fn is_discovered(&self, target: &HassTarget, metric: MetricId) -> bool {
        self.registry()
            .get(&target.device_id)
            .is_some_and(|metrics| metrics.contains(&metric))
    }

    /// Publishes the discovery config of `descriptor` unless already done.
    /// Returns whether a message was sent.
    pub fn ensure_discovered<MQTT: MqttWrapper>(
        &self,
        client: &mut MQTT,
        target: &HassTarget,
        descriptor: &MetricDescriptor,
    ) -> Result<bool, PublishError> {
        if !self.claim(target, descriptor.id) {
            return Ok(false);
        }

        let topic = target.config_topic(descriptor);
        let config = SensorConfig::new(target, descriptor, self.availability_topic.as_deref());
        let result = serde_json::to_string(&config)
            .map_err(anyhow::Error::from)
            .and_then(|payload| {
                debug!("Publishing to {topic} with payload {payload}");
                client.publish(topic.clone(), self.qos, self.retain, payload)
            });

        match result {
            Ok(()) => Ok(true),
            Err(source) => {
                self.release(target, descriptor.id);
                Err(PublishError { topic, source })
            }
        }
    }

    /// Removes all retained discovery configs of `target` from the broker.
    pub fn clear<MQTT: MqttWrapper>(&self, client: &mut MQTT, target: &HassTarget) -> Vec<PublishError> {
        let mut errors = Vec::new();
        for descriptor in METRICS.iter().chain(&SETTINGS) {
            let topic = target.config_topic(descriptor);
            if let Err(source) = client.publish(topic.clone(), self.qos, true, "") {
                errors.push(PublishError { topic, source });
            }
        }
        self.registry().remove(&target.device_id);
        info!("Home Assistant config topics of '{}' cleared", target.device_id);
        errors
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::targets::mqtt::mqtt_config::MqttConfig;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        published: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    impl MqttWrapper for Recorder {
        fn publish<S, V>(&mut self, topic: S, _qos: QoS, _retain: bool, payload: V) -> anyhow::Result<()>
        where
            S: Clone + Into<String>,
            V: Clone + Into<Vec<u8>>,
        {
            if self.fail {
                anyhow::bail!("broker unreachable");
            }
            let payload = String::from_utf8(payload.into())?;
            self.published.lock().unwrap().push((topic.into(), payload));
            Ok(())
        }

        fn new(_config: &MqttConfig, _status_topic: &str) -> Self {
            Self::default()
        }
    }

    fn target(device_id: &str) -> HassTarget {
        HassTarget {
            device_id: device_id.into(),
            device_name: "Solar PV".into(),
            name_prefix: "EZ1 ".into(),
            area: "Energie".into(),
            state_topic_base: format!("ez1/{device_id}"),
            configuration_url: Some("http://192.168.1.40:8050/getAlarm".into()),
            sw_version: "EZ1 1.6.0".into(),
        }
    }

    #[test]
    fn test_discovery_is_published_once() {
        let publisher = DiscoveryPublisher::new(Some("ez1/balcony/state".into()), QoS::AtLeastOnce);
        let mut client = Recorder::default();
        let target = target("balcony");

        for _ in 0..5 {
            for descriptor in &METRICS {
                publisher
                    .ensure_discovered(&mut client, &target, descriptor)
                    .unwrap();
            }
        }

        let published = client.published.lock().unwrap();
        assert_eq!(published.len(), 9);
        assert!(published
            .iter()
            .all(|(topic, _)| topic.starts_with("homeassistant/sensor/balcony-")));
    }

    #[test]
    fn test_registry_is_per_target() {
        let publisher = DiscoveryPublisher::new(None, QoS::AtLeastOnce);
        let mut client = Recorder::default();

        assert!(publisher
            .ensure_discovered(&mut client, &target("a"), &METRICS[0])
            .unwrap());
        assert!(publisher
            .ensure_discovered(&mut client, &target("b"), &METRICS[0])
            .unwrap());
        assert!(!publisher
            .ensure_discovered(&mut client, &target("a"), &METRICS[0])
            .unwrap());
    }

    #[test]
    fn test_payload() {
        let publisher = DiscoveryPublisher::new(Some("ez1/balcony/state".into()), QoS::AtLeastOnce);
        let mut client = Recorder::default();
        publisher
            .ensure_discovered(&mut client, &target("balcony"), &METRICS[7])
            .unwrap();

        let published = client.published.lock().unwrap();
        let (topic, payload) = &published[0];
        assert_eq!(topic, "homeassistant/sensor/balcony-Energy-lifetime-P1/config");

        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["name"], "EZ1 Energy lifetime P1");
        assert_eq!(json["unique_id"], "balcony-Energy-lifetime-P1");
        assert_eq!(json["state_topic"], "ez1/balcony/energy_lifetime_p1");
        assert_eq!(json["availability_topic"], "ez1/balcony/state");
        assert_eq!(json["unit_of_measurement"], "kWh");
        assert_eq!(json["device_class"], "energy");
        assert_eq!(json["state_class"], "total_increasing");
        assert_eq!(json["device"]["identifiers"][0], "balcony");
        assert_eq!(json["device"]["manufacturer"], "APsystems");
        assert_eq!(json["device"]["suggested_area"], "Energie");
    }

    #[test]
    fn test_binary_sensor_payload() {
        let publisher = DiscoveryPublisher::new(None, QoS::AtLeastOnce);
        let mut client = Recorder::default();
        publisher
            .ensure_discovered(&mut client, &target("balcony"), &SETTINGS[0])
            .unwrap();

        let published = client.published.lock().unwrap();
        let (topic, payload) = &published[0];
        assert_eq!(topic, "homeassistant/binary_sensor/balcony-Power-Status/config");

        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["state_topic"], "ez1/balcony/power_status");
        assert_eq!(json["payload_on"], "1");
        assert_eq!(json["payload_off"], "0");
        assert!(json.get("unit_of_measurement").is_none());
        assert!(json.get("state_class").is_none());
        assert!(json.get("availability_topic").is_none());
    }

    #[test]
    fn test_failed_publish_is_retried() {
        let publisher = DiscoveryPublisher::new(None, QoS::AtLeastOnce);
        let target = target("balcony");
        let mut broken = Recorder {
            fail: true,
            ..Default::default()
        };

        let err = publisher
            .ensure_discovered(&mut broken, &target, &METRICS[0])
            .unwrap_err();
        assert_eq!(err.topic, "homeassistant/sensor/balcony-Power/config");
        assert!(!publisher.is_discovered(&target, METRICS[0].id));

        let mut client = Recorder::default();
        assert!(publisher
            .ensure_discovered(&mut client, &target, &METRICS[0])
            .unwrap());
        assert!(publisher.is_discovered(&target, METRICS[0].id));
    }

    #[test]
    fn test_concurrent_calls_publish_once() {
        let publisher = Arc::new(DiscoveryPublisher::new(None, QoS::AtLeastOnce));
        let published = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let publisher = Arc::clone(&publisher);
                let barrier = Arc::clone(&barrier);
                let mut client = Recorder {
                    published: Arc::clone(&published),
                    fail: false,
                };
                thread::spawn(move || {
                    let target = target("balcony");
                    barrier.wait();
                    for descriptor in &METRICS {
                        publisher
                            .ensure_discovered(&mut client, &target, descriptor)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(published.lock().unwrap().len(), 9);
    }

    #[test]
    fn test_clear() {
        let publisher = DiscoveryPublisher::new(None, QoS::AtLeastOnce);
        let mut client = Recorder::default();
        let target = target("balcony");
        publisher
            .ensure_discovered(&mut client, &target, &METRICS[0])
            .unwrap();

        assert!(publisher.clear(&mut client, &target).is_empty());
        assert!(!publisher.is_discovered(&target, METRICS[0].id));

        let published = client.published.lock().unwrap();
        assert_eq!(published.len(), 12);
        assert!(published[1..].iter().all(|(_, payload)| payload.is_empty()));
    }
}
