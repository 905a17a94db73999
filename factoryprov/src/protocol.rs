//! AT queries and JSON test commands on top of a [`SerialChannel`].

use {
    crate::{
        channel::{Matcher, SerialChannel},
        error::{Error, Result},
    },
    log::{debug, warn},
    regex::Regex,
    serde::Serialize,
    serde_json::Value,
    std::{sync::LazyLock, time::Duration},
};

/// Unlock secret the stock board firmware accepts.
pub const DEFAULT_UNLOCK_SECRET: &str = "N00BIO";

/// Placeholder recorded for a field that could not be read.
pub const ERROR_VALUE: &str = "ERROR";

/// Commands a factory test can issue to a board.
///
/// [`CommandProtocol`] implements this over a serial channel; test plans are
/// written against the trait.
pub trait DeviceCommands {
    /// Send `command` and return the value after `prefix`.
    fn query(&self, command: &str, prefix: &str) -> Result<String>;

    /// Send `command` and require a literal `OK`.
    fn execute(&self, command: &str) -> Result<()>;

    /// Run the on-board self test `test_<name>`.
    fn test_command(&self, name: &str) -> Result<TestCommandResult>;

    /// `AT+<NAME>?` answered by `+<NAME>:<value>`.
    fn query_field(&self, name: &str) -> Result<String> {
        self.query(&format!("AT+{name}?"), &format!("+{name}:"))
    }
}

/// Outcome of a `test_<name>` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCommandResult {
    /// Line the device answered with.
    pub raw: String,
    /// Decoded JSON object, if the answer was one.
    pub parsed: Option<Value>,
    /// Success as reported by the device.
    pub success: bool,
}

/// Serial command protocol for one connected board.
pub struct CommandProtocol {
    channel: SerialChannel,
}

impl CommandProtocol {
    /// Wrap an open channel.
    pub fn new(channel: SerialChannel) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &SerialChannel {
        &self.channel
    }

    /// Close the channel, failing anything still queued.
    pub fn close(self) {
        self.channel
            .close();
    }

    fn command_timeout(&self) -> Duration {
        self.channel
            .options()
            .command_timeout
    }
}

impl DeviceCommands for CommandProtocol {
    fn query(&self, command: &str, prefix: &str) -> Result<String> {
        let response =
            self.channel
                .send_and_await(command, Matcher::prefix(prefix), self.command_timeout())?;
        Ok(response.value)
    }

    fn execute(&self, command: &str) -> Result<()> {
        self.channel
            .send_and_await(command, Matcher::Terminal, self.command_timeout())?;
        Ok(())
    }

    fn test_command(&self, name: &str) -> Result<TestCommandResult> {
        let command = format!("test_{name}");
        let timeout = self
            .channel
            .options()
            .test_timeout;
        let response = self
            .channel
            .send_and_await(&command, Matcher::Json, timeout)?;
        debug!("{command} -> {} (success: {})", response.raw, response.success);
        Ok(TestCommandResult {
            raw: response.raw,
            parsed: response.json,
            success: response.success,
        })
    }
}

/// Identification fields every board reports.
///
/// A field that could not be read holds [`ERROR_VALUE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// `AT+FWVERSION?`
    pub firmware_version: String,
    /// `AT+HWVERSION?`
    pub hw_version: String,
    /// `AT+UNIQUEID?`
    pub unique_id: String,
    /// `AT+DEVICEMAKE?`
    pub device_make: String,
    /// `AT+DEVICEMODEL?`
    pub device_model: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            firmware_version: ERROR_VALUE.into(),
            hw_version: ERROR_VALUE.into(),
            unique_id: ERROR_VALUE.into(),
            device_make: ERROR_VALUE.into(),
            device_model: ERROR_VALUE.into(),
        }
    }
}

/// Read every identification field; one failure never stops the others.
pub fn read_device_info(device: &dyn DeviceCommands) -> DeviceInfo {
    let read = |name: &str| {
        device
            .query_field(name)
            .unwrap_or_else(|e| {
                warn!("Reading {name} failed: {e}");
                ERROR_VALUE.to_string()
            })
    };
    DeviceInfo {
        firmware_version: read("FWVERSION"),
        hw_version: read("HWVERSION"),
        unique_id: read("UNIQUEID"),
        device_make: read("DEVICEMAKE"),
        device_model: read("DEVICEMODEL"),
    }
}

/// Families of JSON self tests with a canonical result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFamily {
    /// Wi-Fi scan: status, RSSI, visible networks.
    Wifi,
    /// I2C temperature/humidity sensor.
    Environmental,
    /// RS-485 master/slave loopback.
    BusLoopback,
}

impl TestFamily {
    /// Keys a device may nest the family's fields under.
    fn nest_keys(self) -> &'static [&'static str] {
        match self {
            Self::Wifi => &["wifi", "data", "result"],
            Self::Environmental => &["i2c", "sensor_data", "data", "result"],
            Self::BusLoopback => &["rs485", "data", "result"],
        }
    }

    /// Map a raw test result onto this family's canonical shape.
    pub fn normalize(self, result: &TestCommandResult) -> CanonicalResult {
        let empty = Value::Null;
        let value = result
            .parsed
            .as_ref()
            .unwrap_or(&empty);
        let get = |names: &[&str]| lookup(value, names, self.nest_keys());
        match self {
            Self::Wifi => CanonicalResult::Wifi(WifiResult {
                success: result.success,
                status: get(&["status", "result"]).and_then(as_text),
                rssi: get(&["rssi", "signal"]).and_then(as_i64),
                networks: get(&["networks", "ssids", "aps"]).and_then(as_string_list),
            }),
            Self::Environmental => CanonicalResult::Environmental(EnvironmentalResult {
                success: result.success,
                sensor_addr: get(&["sensor_addr", "addr", "address"]).and_then(as_text),
                sensor: get(&["sensor", "sensor_name", "model"]).and_then(as_text),
                temperature_c: get(&["temperature_c", "temperature", "temp"]).and_then(as_f64),
                humidity_rh: get(&["humidity_rh", "humidity", "hum"]).and_then(as_f64),
            }),
            Self::BusLoopback => CanonicalResult::BusLoopback(BusLoopbackResult {
                success: result.success,
                temperature: get(&["temperature", "temperature_c", "temp"]).and_then(as_f64),
                humidity: get(&["humidity", "humidity_rh", "hum"]).and_then(as_f64),
                slave_ok: get(&["slave_ok", "slave"]).and_then(as_bool),
                master_ok: get(&["master_ok", "master"]).and_then(as_bool),
            }),
        }
    }
}

/// Canonical Wi-Fi test result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WifiResult {
    /// Device-reported success.
    pub success: bool,
    /// Status text, e.g. `done`.
    pub status: Option<String>,
    /// Strongest RSSI in dBm.
    pub rssi: Option<i64>,
    /// Visible network names.
    pub networks: Option<Vec<String>>,
}

/// Canonical environmental sensor result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentalResult {
    /// Device-reported success.
    pub success: bool,
    /// Bus address of the sensor.
    pub sensor_addr: Option<String>,
    /// Sensor part name.
    pub sensor: Option<String>,
    /// Temperature in °C.
    pub temperature_c: Option<f64>,
    /// Relative humidity in %.
    pub humidity_rh: Option<f64>,
}

/// Canonical bus loopback result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusLoopbackResult {
    /// Device-reported success.
    pub success: bool,
    /// Temperature read over the bus.
    pub temperature: Option<f64>,
    /// Humidity read over the bus.
    pub humidity: Option<f64>,
    /// Slave side answered.
    pub slave_ok: Option<bool>,
    /// Master side answered.
    pub master_ok: Option<bool>,
}

/// Normalized self-test result of any family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalResult {
    /// Wi-Fi family.
    Wifi(WifiResult),
    /// Environmental family.
    Environmental(EnvironmentalResult),
    /// Bus loopback family.
    BusLoopback(BusLoopbackResult),
}

impl CanonicalResult {
    /// Device-reported success of the underlying test.
    pub fn success(&self) -> bool {
        match self {
            Self::Wifi(r) => r.success,
            Self::Environmental(r) => r.success,
            Self::BusLoopback(r) => r.success,
        }
    }

    /// As a JSON value, with absent fields as `null`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// First of `names` found at the top level or one level down under a nest key.
fn lookup<'a>(value: &'a Value, names: &[&str], nests: &[&str]) -> Option<&'a Value> {
    let direct = names
        .iter()
        .find_map(|n| value.get(*n))
        .filter(|v| !v.is_null() && !v.is_object());
    direct.or_else(|| {
        nests
            .iter()
            .filter_map(|k| value.get(*k))
            .filter(|v| v.is_object())
            .find_map(|nested| {
                names
                    .iter()
                    .find_map(|n| nested.get(*n))
                    .filter(|v| !v.is_null())
            })
    })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_end_matches(['%', 'C', '°', ' '])
            .parse()
            .ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .map(|f| f.round() as i64)
            }),
        Value::String(s) => s
            .trim()
            .trim_end_matches("dBm")
            .trim()
            .parse()
            .ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i != 0),
        Value::String(s) => match s
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "true" | "ok" | "yes" | "1" | "pass" => Some(true),
            "false" | "fail" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) => item
                        .get("ssid")
                        .and_then(as_text),
                    other => as_text(other),
                })
                .collect(),
        ),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Parse an answer such as `3.61 V`, `-0.5` or `.50` into its first number.
pub fn parse_number(text: &str) -> Result<f64> {
    static NUMBER: LazyLock<Regex> =
        LazyLock::new(|| {
            Regex::new(r"-?(?:\d+(?:\.\d+)?|\.\d+)").expect("Invalid number regex")
        });
    NUMBER
        .find(text)
        .and_then(|m| {
            m.as_str()
                .parse()
                .ok()
        })
        .ok_or_else(|| Error::Parse(format!("no number in `{text}`")))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            channel::ChannelOptions,
            port::mock::{MockHandle, MockPort},
        },
        serde_json::json,
    };

    fn protocol() -> (CommandProtocol, MockHandle) {
        let (port, handle) = MockPort::new();
        let options = ChannelOptions::default()
            .with_command_timeout(Duration::from_millis(150))
            .with_test_timeout(Duration::from_millis(300));
        let channel = SerialChannel::with_port(Box::new(port), options).unwrap();
        (CommandProtocol::new(channel), handle)
    }

    fn result(value: Value) -> TestCommandResult {
        TestCommandResult {
            raw: value.to_string(),
            success: crate::channel::json_success(&value),
            parsed: Some(value),
        }
    }

    #[test]
    fn query_field_returns_trimmed_value() {
        let (proto, mock) = protocol();
        mock.reply(&["+VALUE_VBAT: 3.61"], Duration::from_millis(2));
        assert_eq!(
            proto
                .query_field("VALUE_VBAT")
                .unwrap(),
            "3.61"
        );
        assert_eq!(mock.written_lines(), vec!["AT+VALUE_VBAT?"]);
    }

    #[test]
    fn execute_requires_ok() {
        let (proto, mock) = protocol();
        mock.reply(&["OK"], Duration::from_millis(2))
            .reply(&["ERROR"], Duration::from_millis(2));
        assert!(
            proto
                .execute("AT+LORARAWPUSH")
                .is_ok()
        );
        assert!(matches!(
            proto.execute("AT+LORARAWPUSH"),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn test_command_uses_json_matcher() {
        let (proto, mock) = protocol();
        mock.reply(&[r#"{"result":"ok","rssi":-55}"#], Duration::from_millis(2));
        let res = proto
            .test_command("wifi")
            .unwrap();
        assert!(res.success);
        assert_eq!(mock.written_lines(), vec!["test_wifi"]);
        assert_eq!(res.parsed.unwrap()["rssi"], -55);
    }

    #[test]
    fn test_command_bare_tokens() {
        let (proto, mock) = protocol();
        mock.reply(&["done"], Duration::from_millis(2))
            .reply(&["unknown command"], Duration::from_millis(2));
        assert!(
            proto
                .test_command("rs485")
                .unwrap()
                .success
        );
        let failed = proto
            .test_command("bogus")
            .unwrap();
        assert!(!failed.success);
        assert!(failed.parsed.is_none());
    }

    #[test]
    fn device_info_marks_failed_fields_only() {
        let (proto, mock) = protocol();
        let d = Duration::from_millis(2);
        mock.reply(&["+FWVERSION:1.2.0"], d)
            .reply(&["ERROR"], d)
            .silent()
            .reply(&["+DEVICEMAKE:Nube"], d)
            .reply(&["+DEVICEMODEL:ME-1"], d);
        let info = read_device_info(&proto);
        assert_eq!(info.firmware_version, "1.2.0");
        assert_eq!(info.hw_version, ERROR_VALUE);
        assert_eq!(info.unique_id, ERROR_VALUE);
        assert_eq!(info.device_make, "Nube");
        assert_eq!(info.device_model, "ME-1");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["firmwareVersion"], "1.2.0");
    }

    #[test]
    fn wifi_flat_and_nested_agree() {
        let flat = result(json!({"status":"done","rssi":-61,"networks":["lab","office"]}));
        let nested = result(json!({"result":"ok","wifi":{"rssi":"-61","ssids":"lab, office"}}));
        let (CanonicalResult::Wifi(a), CanonicalResult::Wifi(b)) = (
            TestFamily::Wifi.normalize(&flat),
            TestFamily::Wifi.normalize(&nested),
        ) else {
            panic!("wrong family");
        };
        assert_eq!(a.rssi, Some(-61));
        assert_eq!(b.rssi, Some(-61));
        assert_eq!(a.networks, b.networks);
        assert_eq!(a.status.as_deref(), Some("done"));
    }

    #[test]
    fn environmental_unknown_fields_are_null() {
        let res = result(json!({"status":"done","firmware":"x"}));
        let value = TestFamily::Environmental
            .normalize(&res)
            .to_value();
        assert!(value["temperature_c"].is_null());
        assert!(value["humidity_rh"].is_null());
        assert!(value["sensor_addr"].is_null());
        assert_eq!(value["success"], true);
    }

    #[test]
    fn environmental_accepts_string_numbers() {
        let res = result(json!({
            "data": {"sensor_addr": "0x44", "sensor": "SHT40", "temp": "24.5C", "hum": "41%"}
        }));
        let CanonicalResult::Environmental(env) = TestFamily::Environmental.normalize(&res) else {
            panic!("wrong family");
        };
        assert_eq!(env.sensor_addr.as_deref(), Some("0x44"));
        assert_eq!(env.temperature_c, Some(24.5));
        assert_eq!(env.humidity_rh, Some(41.0));
    }

    #[test]
    fn bus_loopback_flags() {
        let res = result(json!({
            "status": "done",
            "slave_ok": 1,
            "master_ok": "false",
            "temperature": 22
        }));
        let CanonicalResult::BusLoopback(bus) = TestFamily::BusLoopback.normalize(&res) else {
            panic!("wrong family");
        };
        assert_eq!(bus.slave_ok, Some(true));
        assert_eq!(bus.master_ok, Some(false));
        assert_eq!(bus.temperature, Some(22.0));
        assert_eq!(bus.humidity, None);
    }

    #[test]
    fn normalize_without_json_never_panics() {
        let bare = TestCommandResult {
            raw: "OK".into(),
            parsed: None,
            success: true,
        };
        for family in [TestFamily::Wifi, TestFamily::Environmental, TestFamily::BusLoopback] {
            assert!(
                family
                    .normalize(&bare)
                    .success()
            );
        }
    }

    #[test]
    fn parse_number_variants() {
        assert!((parse_number("3.61 V").unwrap() - 3.61).abs() < f64::EPSILON);
        assert!((parse_number("-0.5").unwrap() + 0.5).abs() < f64::EPSILON);
        assert!((parse_number("pulses=12").unwrap() - 12.0).abs() < f64::EPSILON);
        assert!((parse_number(".50").unwrap() - 0.5).abs() < f64::EPSILON);
        assert!((parse_number("-.5").unwrap() + 0.5).abs() < f64::EPSILON);
        assert!((parse_number("ain=.25V").unwrap() - 0.25).abs() < f64::EPSILON);
        assert!(parse_number("n/a").is_err());
    }
}
