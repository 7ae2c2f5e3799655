use chrono::{DateTime, Utc};
use log::debug;

/// One successful poll of the inverter. Power in W, energy in kWh.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub power_total_w: f64,
    pub power_ch1_w: f64,
    pub power_ch2_w: f64,
    pub energy_today_kwh: f64,
    pub energy_today_ch1_kwh: f64,
    pub energy_today_ch2_kwh: f64,
    pub energy_lifetime_kwh: f64,
    pub energy_lifetime_ch1_kwh: f64,
    pub energy_lifetime_ch2_kwh: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-channel values as reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelValues {
    pub power_w: f64,
    pub energy_today_kwh: f64,
    pub energy_lifetime_kwh: f64,
}

impl Reading {
    /// Builds a reading from both channels, totals are the channel sums.
    pub fn from_channels(ch1: ChannelValues, ch2: ChannelValues, timestamp: DateTime<Utc>) -> Self {
        let reading = Self {
            power_total_w: ch1.power_w + ch2.power_w,
            power_ch1_w: ch1.power_w,
            power_ch2_w: ch2.power_w,
            energy_today_kwh: ch1.energy_today_kwh + ch2.energy_today_kwh,
            energy_today_ch1_kwh: ch1.energy_today_kwh,
            energy_today_ch2_kwh: ch2.energy_today_kwh,
            energy_lifetime_kwh: ch1.energy_lifetime_kwh + ch2.energy_lifetime_kwh,
            energy_lifetime_ch1_kwh: ch1.energy_lifetime_kwh,
            energy_lifetime_ch2_kwh: ch2.energy_lifetime_kwh,
            timestamp,
        };
        if reading.has_today_above_lifetime() {
            // device glitch, passed through unchanged
            debug!("energy today exceeds lifetime energy: {reading:?}");
        }
        reading
    }

    /// `None` for metrics that are not part of a reading.
    pub fn value(&self, metric: MetricId) -> Option<f64> {
        let value = match metric {
            MetricId::Power => self.power_total_w,
            MetricId::PowerP1 => self.power_ch1_w,
            MetricId::PowerP2 => self.power_ch2_w,
            MetricId::EnergyToday => self.energy_today_kwh,
            MetricId::EnergyTodayP1 => self.energy_today_ch1_kwh,
            MetricId::EnergyTodayP2 => self.energy_today_ch2_kwh,
            MetricId::EnergyLifetime => self.energy_lifetime_kwh,
            MetricId::EnergyLifetimeP1 => self.energy_lifetime_ch1_kwh,
            MetricId::EnergyLifetimeP2 => self.energy_lifetime_ch2_kwh,
            MetricId::PowerStatus | MetricId::MaxPower => return None,
        };
        Some(value)
    }

    pub fn has_today_above_lifetime(&self) -> bool {
        self.energy_today_kwh > self.energy_lifetime_kwh
            || self.energy_today_ch1_kwh > self.energy_lifetime_ch1_kwh
            || self.energy_today_ch2_kwh > self.energy_lifetime_ch2_kwh
    }
}

/// Output settings of the inverter, read far less often than a `Reading`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerSettings {
    pub max_power_w: u32,
    pub power_on: bool,
    pub timestamp: DateTime<Utc>,
}

impl PowerSettings {
    /// Payload of `metric`, `None` for the metrics of a `Reading`.
    pub fn payload(&self, metric: MetricId) -> Option<String> {
        match metric {
            MetricId::MaxPower => Some(self.max_power_w.to_string()),
            MetricId::PowerStatus => Some(if self.power_on { "1" } else { "0" }.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricId {
    Power,
    PowerP1,
    PowerP2,
    EnergyToday,
    EnergyTodayP1,
    EnergyTodayP2,
    EnergyLifetime,
    EnergyLifetimeP1,
    EnergyLifetimeP2,
    PowerStatus,
    MaxPower,
}

impl MetricId {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricId::Power => "power",
            MetricId::PowerP1 => "power_p1",
            MetricId::PowerP2 => "power_p2",
            MetricId::EnergyToday => "energy_today",
            MetricId::EnergyTodayP1 => "energy_today_p1",
            MetricId::EnergyTodayP2 => "energy_today_p2",
            MetricId::EnergyLifetime => "energy_lifetime",
            MetricId::EnergyLifetimeP1 => "energy_lifetime_p1",
            MetricId::EnergyLifetimeP2 => "energy_lifetime_p2",
            MetricId::PowerStatus => "power_status",
            MetricId::MaxPower => "max_power",
        }
    }
}

/// Static definition of one published quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub id: MetricId,
    /// Human readable name, also the leaf of plain and HomA topics.
    pub name: &'static str,
    /// Empty for unitless values.
    pub unit: &'static str,
    /// Home Assistant entity type, `sensor` or `binary_sensor`.
    pub component: &'static str,
    pub device_class: &'static str,
    pub state_class: Option<&'static str>,
    /// Number of decimals in the published payload.
    pub precision: usize,
}

impl MetricDescriptor {
    const fn power(id: MetricId, name: &'static str) -> Self {
        Self {
            id,
            name,
            unit: "W",
            component: "sensor",
            device_class: "power",
            state_class: Some("measurement"),
            precision: 1,
        }
    }

    const fn energy(id: MetricId, name: &'static str, precision: usize) -> Self {
        Self {
            id,
            name,
            unit: "kWh",
            component: "sensor",
            device_class: "energy",
            state_class: Some("total_increasing"),
            precision,
        }
    }

    const fn max_power() -> Self {
        Self {
            id: MetricId::MaxPower,
            name: "Power Max Output",
            unit: "W",
            component: "sensor",
            device_class: "power",
            state_class: None,
            precision: 0,
        }
    }

    const fn power_status() -> Self {
        Self {
            id: MetricId::PowerStatus,
            name: "Power Status",
            unit: "",
            component: "binary_sensor",
            device_class: "power",
            state_class: None,
            precision: 0,
        }
    }

    pub fn is_binary(&self) -> bool {
        self.component == "binary_sensor"
    }

    pub fn format(&self, value: f64) -> String {
        format!("{:.*}", self.precision, value)
    }
}

pub static METRICS: [MetricDescriptor; 9] = [
    MetricDescriptor::power(MetricId::Power, "Power"),
    MetricDescriptor::power(MetricId::PowerP1, "Power P1"),
    MetricDescriptor::power(MetricId::PowerP2, "Power P2"),
    MetricDescriptor::energy(MetricId::EnergyToday, "Energy today", 3),
    MetricDescriptor::energy(MetricId::EnergyTodayP1, "Energy today P1", 3),
    MetricDescriptor::energy(MetricId::EnergyTodayP2, "Energy today P2", 3),
    MetricDescriptor::energy(MetricId::EnergyLifetime, "Energy lifetime", 1),
    MetricDescriptor::energy(MetricId::EnergyLifetimeP1, "Energy lifetime P1", 1),
    MetricDescriptor::energy(MetricId::EnergyLifetimeP2, "Energy lifetime P2", 1),
];

/// Published from `PowerSettings`, after the reading metrics.
pub static SETTINGS: [MetricDescriptor; 2] = [
    MetricDescriptor::power_status(),
    MetricDescriptor::max_power(),
];

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_totals_are_channel_sums() {
        let reading = Reading::from_channels(
            ChannelValues {
                power_w: 60.0,
                energy_today_kwh: 0.5,
                energy_lifetime_kwh: 200.0,
            },
            ChannelValues {
                power_w: 63.4,
                energy_today_kwh: 0.73,
                energy_lifetime_kwh: 256.7,
            },
            ts(),
        );
        assert!((reading.power_total_w - 123.4).abs() < 1e-9);
        assert!((reading.energy_today_kwh - 1.23).abs() < 1e-9);
        assert!((reading.energy_lifetime_kwh - 456.7).abs() < 1e-9);
        assert_eq!(reading.value(MetricId::PowerP2), Some(63.4));
        assert_eq!(reading.value(MetricId::MaxPower), None);
    }

    #[test]
    fn test_today_above_lifetime_is_kept() {
        let glitch = ChannelValues {
            power_w: 1.0,
            energy_today_kwh: 5.0,
            energy_lifetime_kwh: 2.0,
        };
        let reading = Reading::from_channels(glitch, ChannelValues::default(), ts());
        assert!(reading.has_today_above_lifetime());
        assert_eq!(reading.energy_today_ch1_kwh, 5.0);
    }

    #[test]
    fn test_descriptors_are_unique() {
        let mut ids: Vec<_> = METRICS.iter().chain(&SETTINGS).map(|m| m.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 11);
        assert_eq!(METRICS[0].format(123.4), "123.4");
        assert_eq!(METRICS[3].format(1.23), "1.230");
    }

    #[test]
    fn test_power_settings_payloads() {
        let settings = PowerSettings {
            max_power_w: 600,
            power_on: false,
            timestamp: ts(),
        };
        assert_eq!(settings.payload(MetricId::MaxPower).as_deref(), Some("600"));
        assert_eq!(settings.payload(MetricId::PowerStatus).as_deref(), Some("0"));
        assert_eq!(settings.payload(MetricId::Power), None);
        assert!(SETTINGS[0].is_binary());
        assert!(!SETTINGS[1].is_binary());
    }
}
