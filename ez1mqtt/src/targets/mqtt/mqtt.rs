use crate::{
    error::PublishError,
    reading::{MetricDescriptor, PowerSettings, Reading, METRICS, SETTINGS},
    sources::inverter::DeviceInfo,
    targets::{
        metric_publisher::MetricPublisher,
        mqtt::{
            discovery::DiscoveryPublisher,
            homa,
            mqtt_config::MqttConfig,
            mqtt_wrapper::MqttWrapper,
            topic_mapper::{self, ActiveTargets, Publication},
        },
    },
};

use log::{debug, info, warn};
use std::collections::HashSet;

pub struct Mqtt<MQTT: MqttWrapper> {
    client: MQTT,
    targets: ActiveTargets,
    discovery: DiscoveryPublisher,
}

impl<MQTT: MqttWrapper> Mqtt<MQTT> {
    pub fn new(config: &MqttConfig, targets: ActiveTargets) -> Self {
        let client = MQTT::new(config, &targets.status_topic());
        Self::with_client(client, targets)
    }

    pub fn with_client(client: MQTT, targets: ActiveTargets) -> Self {
        let discovery = DiscoveryPublisher::new(Some(targets.status_topic()), targets.qos())
            .with_retain(targets.retain());
        Self {
            client,
            targets,
            discovery,
        }
    }

    pub fn client(&self) -> &MQTT {
        &self.client
    }

    pub fn targets(&self) -> &ActiveTargets {
        &self.targets
    }

    fn send(&mut self, publications: Vec<Publication>) -> Vec<PublishError> {
        let mut errors = Vec::new();
        for publication in publications {
            debug!(
                "Publishing to {} value: {}",
                publication.topic, publication.payload
            );
            if let Err(source) = self.client.publish(
                publication.topic.clone(),
                publication.qos,
                publication.retain,
                publication.payload,
            ) {
                warn!("mqtt error on {}: {source:?}", publication.topic);
                errors.push(PublishError {
                    topic: publication.topic,
                    source,
                });
            }
        }
        errors
    }

    /// Publishes the HomA meta topics, a no-op without a HomA target.
    pub fn announce(&mut self, device: &DeviceInfo, started_at: &str) -> Vec<PublishError> {
        let Some(target) = self.targets.homa() else {
            debug!("HomA not enabled, nothing to announce");
            return Vec::new();
        };
        let publications = homa::meta_publications(
            target,
            device,
            started_at,
            self.targets.qos(),
            self.targets.retain(),
        );
        let errors = self.send(publications);
        debug!("HomA meta values published");
        errors
    }

    /// Removes every retained topic this publisher may have written.
    pub fn clear_retained(&mut self) -> Vec<PublishError> {
        let qos = self.targets.qos();
        let mut publications = Vec::new();
        if let Some(target) = self.targets.homa() {
            publications.extend(homa::clear_publications(target, qos));
        }
        for target in self.targets.iter() {
            for descriptor in METRICS.iter().chain(&SETTINGS) {
                publications.push(Publication::retained(
                    target.state_topic(descriptor),
                    String::new(),
                    qos,
                ));
            }
        }
        publications.push(Publication::retained(
            self.targets.status_topic(),
            String::new(),
            qos,
        ));
        let mut seen = HashSet::new();
        publications.retain(|p| seen.insert(p.topic.clone()));
        let mut errors = self.send(publications);

        for target in self.targets.hass() {
            errors.extend(self.discovery.clear(&mut self.client, target));
        }
        info!("Retained topics cleared");
        errors
    }

    /// Announces `descriptors` to every Hass target. Returns the failures and
    /// the state topics that must wait until their discovery went through.
    fn discover(&mut self, descriptors: &[MetricDescriptor]) -> (Vec<PublishError>, HashSet<String>) {
        let mut errors = Vec::new();
        let mut undiscovered = HashSet::new();
        for target in self.targets.hass() {
            for descriptor in descriptors {
                match self
                    .discovery
                    .ensure_discovered(&mut self.client, target, descriptor)
                {
                    Ok(true) => info!("Announced {} to Home Assistant", descriptor.name),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("{e}");
                        undiscovered.insert(target.state_topic(descriptor));
                        errors.push(e);
                    }
                }
            }
        }
        (errors, undiscovered)
    }

    fn discover_and_send(
        &mut self,
        descriptors: &[MetricDescriptor],
        publications: Vec<Publication>,
    ) -> Vec<PublishError> {
        // announce metrics to Home Assistant ahead of their first value
        let (mut errors, undiscovered) = self.discover(descriptors);
        let publications = publications
            .into_iter()
            .filter(|p| {
                let skip = undiscovered.contains(&p.topic);
                if skip {
                    debug!("{} not discovered yet, skipping its state", p.topic);
                }
                !skip
            })
            .collect();
        errors.extend(self.send(publications));
        errors
    }
}

impl<MQTT: MqttWrapper> MetricPublisher for Mqtt<MQTT> {
    fn publish(&mut self, reading: &Reading) -> Vec<PublishError> {
        let publications = topic_mapper::map(reading, &self.targets);
        self.discover_and_send(&METRICS, publications)
    }

    fn publish_power_settings(&mut self, settings: &PowerSettings) -> Vec<PublishError> {
        let publications = topic_mapper::map_power_settings(settings, &self.targets);
        self.discover_and_send(&SETTINGS, publications)
    }
}
