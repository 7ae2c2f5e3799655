use std::time::Duration;

use chrono::Utc;

use crate::error::DeviceCommError;
use crate::reading::{PowerSettings, Reading};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkState {
    Unknown,
    Online,
    Offline,
}

/// Static identity of the inverter, queried once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub version: String,
    pub ssid: String,
    pub ip_addr: String,
    pub min_power: u32,
    pub max_power: u32,
}

pub trait Inverter {
    fn set_state(&mut self, new_state: NetworkState);

    /// Reads the live output data. Every call is bounded by `timeout`.
    fn fetch_status(&mut self, timeout: Duration) -> Result<Reading, DeviceCommError>;

    fn device_info(&mut self, timeout: Duration) -> Result<DeviceInfo, DeviceCommError>;

    /// Configured output limit in watts.
    fn max_power(&mut self, timeout: Duration) -> Result<u32, DeviceCommError>;

    /// `true` while the inverter feeds in.
    fn power_status(&mut self, timeout: Duration) -> Result<bool, DeviceCommError>;

    fn power_settings(&mut self, timeout: Duration) -> Result<PowerSettings, DeviceCommError> {
        Ok(PowerSettings {
            max_power_w: self.max_power(timeout)?,
            power_on: self.power_status(timeout)?,
            timestamp: Utc::now(),
        })
    }
}
