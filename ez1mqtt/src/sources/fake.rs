use std::time::Duration;

use chrono::Utc;

use crate::error::DeviceCommError;
use crate::reading::{ChannelValues, Reading};

use super::inverter::{DeviceInfo, Inverter, NetworkState};

/// Stand-in for a real device, used with `--fake`.
pub struct FakeInverter {
    pub device_id: String,
    polls: u32,
}

impl FakeInverter {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            polls: 0,
        }
    }
}

impl Inverter for FakeInverter {
    fn set_state(&mut self, _new_state: NetworkState) {}

    fn fetch_status(&mut self, _timeout: Duration) -> Result<Reading, DeviceCommError> {
        self.polls = self.polls.wrapping_add(1);
        let today = f64::from(self.polls % 1000) * 0.001;
        let channel = |power_w: f64| ChannelValues {
            power_w,
            energy_today_kwh: today,
            energy_lifetime_kwh: 100.0 + today,
        };
        Ok(Reading::from_channels(channel(60.0), channel(63.4), Utc::now()))
    }

    fn device_info(&mut self, _timeout: Duration) -> Result<DeviceInfo, DeviceCommError> {
        Ok(DeviceInfo {
            device_id: self.device_id.clone(),
            version: "fake".to_string(),
            ssid: "fake".to_string(),
            ip_addr: "192.0.2.1".to_string(),
            min_power: 30,
            max_power: 800,
        })
    }

    fn max_power(&mut self, _timeout: Duration) -> Result<u32, DeviceCommError> {
        Ok(800)
    }

    fn power_status(&mut self, _timeout: Duration) -> Result<bool, DeviceCommError> {
        Ok(true)
    }
}
