//! Wire envelope shared by every device-to-cloud and cloud-to-device message.
//!
//! ```json
//! {"appId": "GNSS", "ts": 1700000000000, "data": {"lat": 35.68, "lon": 139.76, "acc": 7.2}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shadow::ShadowConfig;

/// Application id carried in `appId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AppId {
    Gnss,
    Temp,
    Count,
    Alert,
    Device,
    Modem,
    Config,
    /// Any id this simulator does not act upon
    Other(String),
}

impl AppId {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Gnss => "GNSS",
            Self::Temp => "TEMP",
            Self::Count => "COUNT",
            Self::Alert => "ALERT",
            Self::Device => "DEVICE",
            Self::Modem => "MODEM",
            Self::Config => "CONFIG",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        match s.as_str() {
            "GNSS" => Self::Gnss,
            "TEMP" => Self::Temp,
            "COUNT" => Self::Count,
            "ALERT" => Self::Alert,
            "DEVICE" => Self::Device,
            "MODEM" => Self::Modem,
            "CONFIG" => Self::Config,
            _ => Self::Other(s),
        }
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> Self {
        match id {
            AppId::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type carried in `messageType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Data report or command response
    Data,
    /// Command request
    Cmd,
    Other(String),
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DATA" => Self::Data,
            "CMD" => Self::Cmd,
            _ => Self::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Data => "DATA".to_string(),
            MessageType::Cmd => "CMD".to_string(),
            MessageType::Other(s) => s,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: String = self.clone().into();
        f.write_str(&s)
    }
}

/// Message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "appId")]
    pub app_id: AppId,

    #[serde(rename = "messageType", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,

    /// Milliseconds since the Unix epoch. Inbound values that are not an
    /// integer are read as 0 or truncated rather than rejected.
    #[serde(default, deserialize_with = "lenient_ts")]
    pub ts: i64,

    #[serde(default)]
    pub data: Value,
}

fn lenient_ts<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ts = match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    };
    Ok(ts)
}

impl Envelope {
    /// A `DATA` message stamped with the current time.
    pub fn data(app_id: AppId, data: Value) -> Self {
        Self {
            app_id,
            message_type: Some(MessageType::Data),
            ts: now_ms(),
            data,
        }
    }

    /// A location fix. GNSS reports carry no message type.
    pub fn gnss(fix: &GnssFix) -> Self {
        Self {
            app_id: AppId::Gnss,
            message_type: None,
            ts: now_ms(),
            data: serde_json::to_value(fix).unwrap_or(Value::Null),
        }
    }

    pub fn temperature(celsius: f64) -> Self {
        Self::data(AppId::Temp, serde_json::json!(celsius))
    }

    pub fn counter(value: u64) -> Self {
        Self::data(AppId::Count, serde_json::json!(value))
    }

    pub fn alert(alert: &AlertData) -> Self {
        Self::data(
            AppId::Alert,
            serde_json::to_value(alert).unwrap_or(Value::Null),
        )
    }

    pub fn device_info(snapshot: &DeviceSnapshot) -> Self {
        Self::data(
            AppId::Device,
            serde_json::to_value(snapshot).unwrap_or(Value::Null),
        )
    }

    /// Reply to a modem query.
    pub fn modem_response(response: &str) -> Self {
        Self::data(AppId::Modem, Value::String(response.to_string()))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Location fix payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy in meters
    pub acc: f64,
}

impl GnssFix {
    /// Round to the precision reported on the wire (6 dp position, 1 dp accuracy).
    pub fn new(lat: f64, lon: f64, acc: f64) -> Self {
        Self {
            lat: round_to(lat, 6),
            lon: round_to(lon, 6),
            acc: round_to(acc, 1),
        }
    }
}

/// Alert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertData {
    #[serde(rename = "type")]
    pub kind: i64,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AlertData {
    pub fn new(kind: i64, value: i64, description: Option<&str>) -> Self {
        Self {
            kind,
            value,
            description: description.map(str::to_string),
        }
    }
}

/// Placeholder network details reported at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub network_code: String,
    pub area_code: String,
    pub mccmnc: String,
    pub ip_address: String,
    #[serde(rename = "cellID")]
    pub cell_id: String,
    pub rsrp: i32,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            network_code: "10".to_string(),
            area_code: "1234".to_string(),
            mccmnc: "44010".to_string(),
            ip_address: "10.0.0.1".to_string(),
            cell_id: "ABCD1234".to_string(),
            rsrp: -85,
        }
    }
}

/// Placeholder SIM details reported at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimInfo {
    pub iccid: String,
    pub imsi: String,
}

impl Default for SimInfo {
    fn default() -> Self {
        Self {
            iccid: "8981100000000000000".to_string(),
            imsi: SIMULATED_IMSI.to_string(),
        }
    }
}

/// Subscriber identity reported by the simulated SIM.
pub const SIMULATED_IMSI: &str = "440100000000000";

/// One-shot device-info snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub network_info: NetworkInfo,
    pub sim_info: SimInfo,
    pub app_version: String,
    pub config: ShadowConfig,
}

impl DeviceSnapshot {
    pub fn new(app_version: impl Into<String>, config: ShadowConfig) -> Self {
        Self {
            network_info: NetworkInfo::default(),
            sim_info: SimInfo::default(),
            app_version: app_version.into(),
            config,
        }
    }
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Round half away from zero to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gnss_envelope_omits_message_type() {
        let env = Envelope::gnss(&GnssFix::new(35.681234567, 139.7671, 7.25));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["appId"], "GNSS");
        assert!(value.get("messageType").is_none());
        assert_eq!(value["data"]["lat"], json!(35.681235));
        assert_eq!(value["data"]["acc"], json!(7.3));
        assert!(value["ts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_inbound_command_parses() {
        let raw = br#"{"appId":"MODEM","messageType":"CMD","data":"AT+CGMR"}"#;
        let env: Envelope = serde_json::from_slice(raw).unwrap();
        assert_eq!(env.app_id, AppId::Modem);
        assert_eq!(env.message_type, Some(MessageType::Cmd));
        assert_eq!(env.ts, 0);
        assert_eq!(env.data, json!("AT+CGMR"));
    }

    #[test]
    fn test_inbound_timestamp_is_lenient() {
        let env: Envelope = serde_json::from_value(json!({
            "appId": "MODEM",
            "messageType": "CMD",
            "ts": 1712345678901.5,
            "data": "AT+CGSN"
        }))
        .unwrap();
        assert_eq!(env.ts, 1712345678901);
        assert_eq!(env.data, json!("AT+CGSN"));

        let env: Envelope =
            serde_json::from_value(json!({"appId": "CONFIG", "ts": null, "data": {}})).unwrap();
        assert_eq!(env.ts, 0);

        let env: Envelope =
            serde_json::from_value(json!({"appId": "CONFIG", "ts": "soon", "data": {}})).unwrap();
        assert_eq!(env.ts, 0);
    }

    #[test]
    fn test_unknown_app_id_preserved() {
        let env: Envelope = serde_json::from_value(json!({"appId": "FOTA", "data": {}})).unwrap();
        assert_eq!(env.app_id, AppId::Other("FOTA".to_string()));
        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["appId"], "FOTA");
    }

    #[test]
    fn test_alert_description_optional() {
        let with = serde_json::to_value(AlertData::new(0, 0, Some("Button pressed"))).unwrap();
        assert_eq!(with, json!({"type": 0, "value": 0, "description": "Button pressed"}));
        let without = serde_json::to_value(AlertData::new(1, 3, None)).unwrap();
        assert_eq!(without, json!({"type": 1, "value": 3}));
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = DeviceSnapshot::new("1.2.3", ShadowConfig::new(120, true));
        let value = serde_json::to_value(Envelope::device_info(&snapshot)).unwrap();
        assert_eq!(value["appId"], "DEVICE");
        assert_eq!(value["messageType"], "DATA");
        assert_eq!(value["data"]["networkInfo"]["cellID"], "ABCD1234");
        assert_eq!(value["data"]["simInfo"]["imsi"], SIMULATED_IMSI);
        assert_eq!(value["data"]["appVersion"], "1.2.3");
        assert_eq!(
            value["data"]["config"],
            json!({"counterEnable": true, "locationInterval": 120})
        );
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(21.449, 1), 21.4);
        assert_eq!(round_to(-3.25, 1), -3.3);
        assert_eq!(round_to(1.0, 6), 1.0);
    }
}
