use log::warn;

use crate::reading::{MetricDescriptor, PowerSettings, Reading, METRICS, SETTINGS};
use crate::sources::inverter::DeviceInfo;
use crate::targets::mqtt::mqtt_config::MqttConfig;
use crate::targets::mqtt::mqtt_wrapper::QoS;

const DEFAULT_STATE_BASE: &str = "ez1";
const STATUS_CONTROL: &str = "State";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HomaTarget {
    pub system_id: String,
    pub room: String,
    pub name: String,
}

impl HomaTarget {
    pub fn device_topic(&self) -> String {
        format!("/devices/{}", self.system_id)
    }

    pub fn control_topic(&self, control: &str) -> String {
        format!("/devices/{}/controls/{}", self.system_id, control)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HassTarget {
    pub device_id: String,
    pub device_name: String,
    pub name_prefix: String,
    pub area: String,
    pub state_topic_base: String,
    pub configuration_url: Option<String>,
    pub sw_version: String,
}

impl HassTarget {
    /// `{device_id}-{name}` with blanks turned into dashes, e.g. `balcony-Power-P1`.
    pub fn object_id(&self, descriptor: &MetricDescriptor) -> String {
        format!("{}-{}", self.device_id, descriptor.name.replace(' ', "-"))
    }

    pub fn config_topic(&self, descriptor: &MetricDescriptor) -> String {
        format!(
            "homeassistant/{}/{}/config",
            descriptor.component,
            self.object_id(descriptor)
        )
    }

    pub fn state_topic(&self, descriptor: &MetricDescriptor) -> String {
        format!("{}/{}", self.state_topic_base, descriptor.id.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishTarget {
    PlainPrefix { prefix: String },
    HomA(HomaTarget),
    HassDiscovery(HassTarget),
}

impl PublishTarget {
    pub fn state_topic(&self, descriptor: &MetricDescriptor) -> String {
        match self {
            PublishTarget::PlainPrefix { prefix } => format!("{}{}", prefix, descriptor.name),
            PublishTarget::HomA(homa) => homa.control_topic(descriptor.name),
            PublishTarget::HassDiscovery(hass) => hass.state_topic(descriptor),
        }
    }
}

/// The publishing conventions in effect, fixed at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveTargets {
    targets: Vec<PublishTarget>,
    qos: QoS,
    retain: bool,
}

impl ActiveTargets {
    /// HomA takes the non-discovery topic root: a plain prefix configured next
    /// to a HomA target is dropped. Duplicate targets are dropped as well.
    pub fn new(targets: Vec<PublishTarget>, qos: QoS) -> Self {
        let has_homa = targets
            .iter()
            .any(|t| matches!(t, PublishTarget::HomA(_)));

        let mut active: Vec<PublishTarget> = Vec::new();
        for target in targets {
            if has_homa {
                if let PublishTarget::PlainPrefix { prefix } = &target {
                    warn!("HomA is enabled, ignoring topic prefix '{prefix}'");
                    continue;
                }
            }
            if !active.contains(&target) {
                active.push(target);
            }
        }
        Self {
            targets: active,
            qos,
            retain: true,
        }
    }

    /// Publishes state, meta and discovery messages unretained when false.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Derives the targets from configuration. Empty ids fall back to the
    /// device id the inverter reported.
    pub fn from_config(
        config: &MqttConfig,
        device: &DeviceInfo,
        qos: QoS,
        configuration_url: Option<String>,
    ) -> Self {
        let or_device_id = |id: &str| {
            if id.is_empty() {
                device.device_id.clone()
            } else {
                id.to_string()
            }
        };

        let mut targets = Vec::new();
        if let Some(prefix) = &config.topic_prefix {
            targets.push(PublishTarget::PlainPrefix {
                prefix: prefix.clone(),
            });
        }
        if config.homa.enabled {
            targets.push(PublishTarget::HomA(HomaTarget {
                system_id: or_device_id(&config.homa.system_id),
                room: config.homa.room.clone(),
                name: config.homa.name.clone(),
            }));
        }
        if config.hass.enabled {
            let device_id = or_device_id(&config.hass.device_id);
            let state_topic_base = config
                .hass
                .state_topic_base
                .clone()
                .unwrap_or_else(|| format!("{DEFAULT_STATE_BASE}/{device_id}"));
            targets.push(PublishTarget::HassDiscovery(HassTarget {
                device_id,
                device_name: config.hass.device_name.clone(),
                name_prefix: config.hass.name_prefix.clone(),
                area: config.hass.area.clone(),
                state_topic_base,
                configuration_url,
                sw_version: device.version.clone(),
            }));
        }
        Self::new(targets, qos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublishTarget> {
        self.targets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn homa(&self) -> Option<&HomaTarget> {
        self.targets.iter().find_map(|t| match t {
            PublishTarget::HomA(homa) => Some(homa),
            _ => None,
        })
    }

    pub fn hass(&self) -> impl Iterator<Item = &HassTarget> {
        self.targets.iter().filter_map(|t| match t {
            PublishTarget::HassDiscovery(hass) => Some(hass),
            _ => None,
        })
    }

    /// Availability topic carrying `online` / `offline`.
    pub fn status_topic(&self) -> String {
        if let Some(homa) = self.homa() {
            return homa.control_topic(STATUS_CONTROL);
        }
        for target in &self.targets {
            match target {
                PublishTarget::PlainPrefix { prefix } => {
                    return format!("{prefix}{STATUS_CONTROL}");
                }
                PublishTarget::HassDiscovery(hass) => {
                    return format!("{}/state", hass.state_topic_base);
                }
                PublishTarget::HomA(_) => {}
            }
        }
        format!("{DEFAULT_STATE_BASE}/state")
    }
}

/// One message ready to hand to the broker client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub qos: QoS,
}

impl Publication {
    pub fn new(topic: String, payload: String, retain: bool, qos: QoS) -> Self {
        Self {
            topic,
            payload,
            retain,
            qos,
        }
    }

    pub fn retained(topic: String, payload: String, qos: QoS) -> Self {
        Self::new(topic, payload, true, qos)
    }
}

fn fan_out(targets: &ActiveTargets, values: &[(&MetricDescriptor, String)]) -> Vec<Publication> {
    let homa_wins = targets.homa().is_some();
    targets
        .iter()
        .filter(|target| !(homa_wins && matches!(target, PublishTarget::PlainPrefix { .. })))
        .flat_map(|target| {
            values.iter().map(move |(descriptor, payload)| {
                Publication::new(
                    target.state_topic(descriptor),
                    payload.clone(),
                    targets.retain(),
                    targets.qos(),
                )
            })
        })
        .collect()
}

/// Fans one reading out to the state topics of every active target.
///
/// Output is ordered by target, then by metric, and depends on nothing but the
/// arguments. Discovery configs are not part of it.
pub fn map(reading: &Reading, targets: &ActiveTargets) -> Vec<Publication> {
    let values: Vec<_> = METRICS
        .iter()
        .filter_map(|d| reading.value(d.id).map(|value| (d, d.format(value))))
        .collect();
    fan_out(targets, &values)
}

/// Same as `map` for the output settings.
pub fn map_power_settings(settings: &PowerSettings, targets: &ActiveTargets) -> Vec<Publication> {
    let values: Vec<_> = SETTINGS
        .iter()
        .filter_map(|d| settings.payload(d.id).map(|payload| (d, payload)))
        .collect();
    fan_out(targets, &values)
}
