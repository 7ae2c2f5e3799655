use crate::error::DeviceCommError;
use crate::reading::{ChannelValues, Reading};
use crate::sources::inverter::{DeviceInfo, Inverter, NetworkState};
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8050;

const CMD_OUTPUT_DATA: &str = "getOutputData";
const CMD_DEVICE_INFO: &str = "getDeviceInfo";
const CMD_MAX_POWER: &str = "getMaxPower";
const CMD_ON_OFF: &str = "getOnOff";

/// APsystems EZ1 micro-inverter queried through its local HTTP API.
pub struct EZ1Inverter {
    host: String,
    port: u16,
    state: NetworkState,
    client: Client,
}

impl Inverter for EZ1Inverter {
    fn set_state(&mut self, new_state: NetworkState) {
        if self.state != new_state {
            self.state = new_state;
            info!("Inverter is {new_state:?}");
        }
    }

    fn fetch_status(&mut self, timeout: Duration) -> Result<Reading, DeviceCommError> {
        let data = self.send_request(CMD_OUTPUT_DATA, timeout)?;
        parse_output_data(&data, Utc::now())
    }

    fn device_info(&mut self, timeout: Duration) -> Result<DeviceInfo, DeviceCommError> {
        let data = self.send_request(CMD_DEVICE_INFO, timeout)?;
        parse_device_info(&data)
    }

    fn max_power(&mut self, timeout: Duration) -> Result<u32, DeviceCommError> {
        let data = self.send_request(CMD_MAX_POWER, timeout)?;
        parse_max_power(&data)
    }

    fn power_status(&mut self, timeout: Duration) -> Result<bool, DeviceCommError> {
        let data = self.send_request(CMD_ON_OFF, timeout)?;
        parse_power_status(&data)
    }
}

impl EZ1Inverter {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            state: NetworkState::Unknown,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn send_request(&mut self, command: &str, timeout: Duration) -> Result<Value, DeviceCommError> {
        let url = format!("{}/{}", self.base_url(), command);
        debug!("GET {url}");

        let body = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text());

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                debug!("{e}");
                self.set_state(NetworkState::Offline);
                return Err(e.into());
            }
        };
        self.set_state(NetworkState::Online);

        unwrap_data(&body)
    }
}

/// Checks the response envelope and returns its `data` object.
fn unwrap_data(body: &str) -> Result<Value, DeviceCommError> {
    let mut envelope: Value = serde_json::from_str(body)
        .map_err(|e| DeviceCommError::MalformedResponse(e.to_string()))?;

    match envelope.get("message").and_then(Value::as_str) {
        Some("SUCCESS") => {}
        Some(message) => return Err(DeviceCommError::Rejected(message.to_string())),
        None => {
            return Err(DeviceCommError::MalformedResponse(
                "missing 'message'".to_string(),
            ))
        }
    }

    match envelope.get_mut("data").map(Value::take) {
        Some(data @ Value::Object(_)) => Ok(data),
        _ => Err(DeviceCommError::MalformedResponse(
            "missing 'data' object".to_string(),
        )),
    }
}

/// Reads a non-negative, finite quantity. Numbers sent as strings are accepted.
fn quantity(data: &Value, field: &'static str) -> Result<f64, DeviceCommError> {
    let value = match data.get(field) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or(DeviceCommError::MalformedField { field })
}

fn text(data: &Value, field: &'static str) -> Result<String, DeviceCommError> {
    match data.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(DeviceCommError::MalformedField { field }),
    }
}

/// Converts a `getOutputData` payload. Any unusable field fails the whole reading.
pub fn parse_output_data(data: &Value, timestamp: DateTime<Utc>) -> Result<Reading, DeviceCommError> {
    let ch1 = ChannelValues {
        power_w: quantity(data, "p1")?,
        energy_today_kwh: quantity(data, "e1")?,
        energy_lifetime_kwh: quantity(data, "te1")?,
    };
    let ch2 = ChannelValues {
        power_w: quantity(data, "p2")?,
        energy_today_kwh: quantity(data, "e2")?,
        energy_lifetime_kwh: quantity(data, "te2")?,
    };
    Ok(Reading::from_channels(ch1, ch2, timestamp))
}

pub fn parse_device_info(data: &Value) -> Result<DeviceInfo, DeviceCommError> {
    Ok(DeviceInfo {
        device_id: text(data, "deviceId")?,
        version: text(data, "devVer")?,
        ssid: text(data, "ssid").unwrap_or_default(),
        ip_addr: text(data, "ipAddr").unwrap_or_default(),
        min_power: quantity(data, "minPower").map(|v| v as u32).unwrap_or_default(),
        max_power: quantity(data, "maxPower").map(|v| v as u32).unwrap_or_default(),
    })
}

pub fn parse_max_power(data: &Value) -> Result<u32, DeviceCommError> {
    quantity(data, "maxPower").map(|v| v as u32)
}

/// The device reports `"0"` while feeding in and `"1"` when switched off.
pub fn parse_power_status(data: &Value) -> Result<bool, DeviceCommError> {
    match text(data, "status")?.as_str() {
        "0" => Ok(true),
        "1" => Ok(false),
        _ => Err(DeviceCommError::MalformedField { field: "status" }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn output_data(body: &str) -> Result<Reading, DeviceCommError> {
        unwrap_data(body).and_then(|data| parse_output_data(&data, Utc::now()))
    }

    #[test]
    fn test_parse_output_data() {
        let reading = output_data(include_str!("../../../test/responses/output_data.json")).unwrap();

        assert_eq!(reading.power_ch1_w, 60.0);
        assert_eq!(reading.power_ch2_w, 63.4);
        assert!((reading.power_total_w - 123.4).abs() < 1e-9);
        assert!((reading.energy_today_kwh - 1.23).abs() < 1e-9);
        assert!((reading.energy_lifetime_kwh - 456.7).abs() < 1e-9);
    }

    #[test]
    fn test_non_numeric_field_fails_poll() {
        let err = output_data(include_str!("../../../test/responses/output_data_malformed.json"))
            .unwrap_err();
        assert!(matches!(err, DeviceCommError::MalformedField { field: "p1" }));
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let body = r#"{"data":{"p1":"12","e1":"0.1","te1":"3","p2":0,"e2":0,"te2":0},"message":"SUCCESS"}"#;
        assert_eq!(output_data(body).unwrap().power_total_w, 12.0);
    }

    #[test]
    fn test_missing_or_negative_field_fails_poll() {
        let missing = r#"{"data":{"p1":1,"e1":0.1,"te1":3,"p2":0,"e2":0},"message":"SUCCESS"}"#;
        assert!(matches!(
            output_data(missing),
            Err(DeviceCommError::MalformedField { field: "te2" })
        ));
        let negative = r#"{"data":{"p1":-1,"e1":0.1,"te1":3,"p2":0,"e2":0,"te2":0},"message":"SUCCESS"}"#;
        assert!(output_data(negative).is_err());
    }

    #[test]
    fn test_rejected_and_garbage_responses() {
        let rejected = r#"{"data":{},"message":"FAILED","deviceId":"E17000000001"}"#;
        assert!(matches!(
            output_data(rejected),
            Err(DeviceCommError::Rejected(m)) if m == "FAILED"
        ));
        assert!(matches!(
            output_data("<html>busy</html>"),
            Err(DeviceCommError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_device_info() {
        let data = unwrap_data(include_str!("../../../test/responses/device_info.json")).unwrap();
        let info = parse_device_info(&data).unwrap();
        assert_eq!(info.device_id, "E17010000783");
        assert_eq!(info.version, "EZ1 1.6.0");
        assert_eq!(info.max_power, 800);
    }

    #[test]
    fn test_parse_max_power() {
        let data = unwrap_data(include_str!("../../../test/responses/max_power.json")).unwrap();
        assert_eq!(parse_max_power(&data).unwrap(), 600);

        let data = serde_json::json!({ "maxPower": "" });
        assert!(matches!(
            parse_max_power(&data),
            Err(DeviceCommError::MalformedField { field: "maxPower" })
        ));
    }

    #[test]
    fn test_parse_power_status() {
        let data = unwrap_data(include_str!("../../../test/responses/on_off.json")).unwrap();
        assert!(parse_power_status(&data).unwrap());

        assert!(!parse_power_status(&serde_json::json!({ "status": "1" })).unwrap());
        assert!(!parse_power_status(&serde_json::json!({ "status": 1 })).unwrap());
        assert!(matches!(
            parse_power_status(&serde_json::json!({ "status": "2" })),
            Err(DeviceCommError::MalformedField { field: "status" })
        ));
    }
}
