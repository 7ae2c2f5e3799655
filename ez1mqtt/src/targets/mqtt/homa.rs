use crate::reading::{MetricDescriptor, MetricId, METRICS, SETTINGS};
use crate::sources::inverter::DeviceInfo;
use crate::targets::mqtt::mqtt_wrapper::QoS;
use crate::targets::mqtt::topic_mapper::{HomaTarget, Publication};

// informational controls following the metrics and settings, in this order
const INFO_CONTROLS: [&str; 5] = ["Device id", "Device IP", "Version", "Start time", "State"];

fn metric_room(metric: MetricId) -> &'static str {
    match metric {
        MetricId::Power | MetricId::EnergyToday => "Home",
        _ => "",
    }
}

fn metric_unit(descriptor: &MetricDescriptor) -> String {
    if descriptor.unit.is_empty() {
        String::new()
    } else {
        format!(" {}", descriptor.unit)
    }
}

fn descriptors() -> impl Iterator<Item = &'static MetricDescriptor> {
    METRICS.iter().chain(SETTINGS.iter())
}

/// Meta topics describing the device and its controls to HomA dashboards,
/// plus the informational control values.
pub fn meta_publications(
    target: &HomaTarget,
    device: &DeviceInfo,
    started_at: &str,
    qos: QoS,
    retain: bool,
) -> Vec<Publication> {
    let publish = |topic: String, payload: String| Publication::new(topic, payload, retain, qos);
    let device_topic = target.device_topic();
    let mut publications = vec![
        publish(format!("{device_topic}/meta/name"), target.name.clone()),
        publish(format!("{device_topic}/meta/room"), target.room.clone()),
    ];

    // all controls are read-only, so even the power status is plain text
    let controls = descriptors()
        .map(|m| (m.name, metric_room(m.id), metric_unit(m)))
        .chain(INFO_CONTROLS.iter().map(|name| (*name, "", String::new())));

    for (order, (name, room, unit)) in controls.enumerate() {
        let control = target.control_topic(name);
        publications.extend([
            publish(format!("{control}/meta/type"), "text".into()),
            publish(format!("{control}/meta/order"), (order + 1).to_string()),
            publish(format!("{control}/meta/room"), room.to_string()),
            publish(format!("{control}/meta/unit"), unit),
        ]);
    }

    let info_values = [
        device.device_id.clone(),
        device.ip_addr.clone(),
        device.version.clone(),
        started_at.to_string(),
        "online".to_string(),
    ];
    for (name, value) in INFO_CONTROLS.iter().zip(info_values) {
        publications.push(publish(target.control_topic(name), value));
    }
    publications
}

/// Empty retained payloads for every topic HomA publishing ever writes.
pub fn clear_publications(target: &HomaTarget, qos: QoS) -> Vec<Publication> {
    let device_topic = target.device_topic();
    let mut publications = vec![
        Publication::retained(format!("{device_topic}/meta/name"), String::new(), qos),
        Publication::retained(format!("{device_topic}/meta/room"), String::new(), qos),
    ];
    let names = descriptors().map(|m| m.name).chain(INFO_CONTROLS);
    for name in names {
        let control = target.control_topic(name);
        publications.push(Publication::retained(control.clone(), String::new(), qos));
        for meta in ["type", "order", "room", "unit"] {
            publications.push(Publication::retained(
                format!("{control}/meta/{meta}"),
                String::new(),
                qos,
            ));
        }
    }
    publications
}

#[cfg(test)]
mod test {
    use super::*;

    fn target() -> HomaTarget {
        HomaTarget {
            system_id: "123456-solar".into(),
            room: "Sensors".into(),
            name: "Solar PV".into(),
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "E17010000783".into(),
            version: "EZ1 1.6.0".into(),
            ssid: "solar-net".into(),
            ip_addr: "192.168.1.40".into(),
            min_power: 30,
            max_power: 800,
        }
    }

    fn find<'a>(publications: &'a [Publication], topic: &str) -> &'a str {
        &publications
            .iter()
            .find(|p| p.topic == topic)
            .unwrap_or_else(|| panic!("{topic} not published"))
            .payload
    }

    #[test]
    fn test_meta() {
        let publications = meta_publications(
            &target(),
            &device(),
            "2025-06-21T12:00:00+02:00",
            QoS::AtLeastOnce,
            true,
        );

        assert_eq!(find(&publications, "/devices/123456-solar/meta/name"), "Solar PV");
        assert_eq!(find(&publications, "/devices/123456-solar/meta/room"), "Sensors");
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Power/meta/unit"),
            " W"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Power/meta/room"),
            "Home"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Energy lifetime P2/meta/order"),
            "9"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Power Status/meta/order"),
            "10"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Power Status/meta/unit"),
            ""
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Power Max Output/meta/unit"),
            " W"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/State/meta/order"),
            "16"
        );
        assert_eq!(
            find(&publications, "/devices/123456-solar/controls/Device IP"),
            "192.168.1.40"
        );
        assert_eq!(find(&publications, "/devices/123456-solar/controls/State"), "online");
        assert!(publications.iter().all(|p| p.retain));
        assert_eq!(publications.len(), 2 + 16 * 4 + 5);
    }

    #[test]
    fn test_meta_unretained() {
        let publications =
            meta_publications(&target(), &device(), "now", QoS::AtMostOnce, false);
        assert!(publications.iter().all(|p| !p.retain));
    }

    #[test]
    fn test_clear() {
        let publications = clear_publications(&target(), QoS::AtLeastOnce);
        assert_eq!(publications.len(), 2 + 16 * 5);
        assert!(publications.iter().all(|p| p.payload.is_empty() && p.retain));
        assert!(publications
            .iter()
            .any(|p| p.topic == "/devices/123456-solar/controls/Energy today P1"));
        assert!(publications
            .iter()
            .any(|p| p.topic == "/devices/123456-solar/controls/Power Max Output/meta/order"));
    }
}
