//! Inbound telemetry messages.
//!
//! The vehicle publishes flat JSON objects tagged by `type` or `sensor`. Only
//! `heartbeat` and `net` drive link logic; the other recognized variants are
//! decoded for the console, and anything else is carried as
//! [`TelemetryMessage::Other`] with its raw payload.
//!
//! Decoding never rejects an object: a field of the wrong shape reads as
//! absent (or coerced, for flags and error reports) so the message still
//! counts as activity and still reaches the dispatch hook.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

/// Tag given to objects that carry neither `type` nor `sensor`.
pub const UNTAGGED: &str = "unknown";

mod lenient {
    use serde::Deserializer;
    use serde::de::{Deserialize, DeserializeOwned};
    use serde_json::Value;

    pub fn value<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        Ok(T::deserialize(Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    fn as_flag(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|x| x != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(as_flag(&Value::deserialize(d)?).unwrap_or(false))
    }

    pub fn flag_or_true<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(as_flag(&Value::deserialize(d)?).unwrap_or(true))
    }

    /// Strings pass through; any other non-null value is kept as its JSON text.
    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }
}

/// Classification tag of a telemetry message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TelemetryTag {
    Heartbeat,
    Attitude,
    ExternalDepth,
    Power,
    Network,
    Other(String),
}

impl TelemetryTag {
    /// Classify a raw payload. `heartbeat` and `net`/`network` are recognized
    /// through either tag field; everything else prefers `type`.
    pub fn of(payload: &Map<String, Value>) -> Option<Self> {
        let kind = payload.get("type").and_then(Value::as_str);
        let sensor = payload.get("sensor").and_then(Value::as_str);

        if kind == Some("heartbeat") || sensor == Some("heartbeat") {
            return Some(TelemetryTag::Heartbeat);
        }
        if kind == Some("net") || sensor == Some("network") {
            return Some(TelemetryTag::Network);
        }
        let tag = match kind.or(sensor)? {
            "attitude" => TelemetryTag::Attitude,
            "external_depth" => TelemetryTag::ExternalDepth,
            "power" => TelemetryTag::Power,
            other => TelemetryTag::Other(other.to_string()),
        };
        Some(tag)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TelemetryTag::Heartbeat => "heartbeat",
            TelemetryTag::Attitude => "attitude",
            TelemetryTag::ExternalDepth => "external_depth",
            TelemetryTag::Power => "power",
            TelemetryTag::Network => "net",
            TelemetryTag::Other(tag) => tag,
        }
    }
}

impl fmt::Display for TelemetryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Heartbeat {
    #[serde(default, deserialize_with = "lenient::flag")]
    pub armed: bool,
    /// Seconds since the vehicle last accepted a pilot frame.
    #[serde(default, deserialize_with = "lenient::number")]
    pub pilot_age: Option<f64>,
    #[serde(default, alias = "sequence", deserialize_with = "lenient::value")]
    pub pilot_seq: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct RollPitchYaw {
    #[serde(default, deserialize_with = "lenient::value")]
    pub roll: f64,
    #[serde(default, deserialize_with = "lenient::value")]
    pub pitch: f64,
    #[serde(default, deserialize_with = "lenient::value")]
    pub yaw: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AttitudeHealth {
    #[serde(default, deserialize_with = "lenient::text")]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub mag_qual: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Attitude {
    #[serde(default, deserialize_with = "lenient::value")]
    pub rpy_deg: Option<RollPitchYaw>,
    #[serde(default, deserialize_with = "lenient::value")]
    pub health: Option<AttitudeHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalDepth {
    #[serde(default, deserialize_with = "lenient::text")]
    pub sensor: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub depth_m: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub pressure_mbar: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub temperature_c: Option<f64>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Power {
    #[serde(default, deserialize_with = "lenient::number")]
    pub voltage_v: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub current_a: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub power_w: Option<f64>,
    #[serde(default = "default_true", deserialize_with = "lenient::flag_or_true")]
    pub ok: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub held: bool,
    #[serde(default, deserialize_with = "lenient::text")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetLink {
    #[serde(default, deserialize_with = "lenient::text")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub speed_mbps: Option<f64>,
}

/// Vehicle-side network interface report.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetStatus {
    #[serde(default, deserialize_with = "lenient::text")]
    pub iface: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "lenient::value")]
    pub link: NetLink,
    /// Bytes per second received by the vehicle.
    #[serde(default, deserialize_with = "lenient::number")]
    pub rx_bps: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub tx_bps: Option<f64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_tether: bool,
}

/// Typed view of one telemetry payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Heartbeat(Heartbeat),
    Attitude(Attitude),
    ExternalDepth(ExternalDepth),
    Power(Power),
    Network(NetStatus),
    Other { tag: String },
}

/// A parsed message together with its original payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub tag: TelemetryTag,
    pub message: TelemetryMessage,
    pub payload: Value,
}

impl TelemetryRecord {
    /// Decode one raw payload.
    ///
    /// Fails only when the text is not a JSON object. Objects without a tag
    /// are kept under [`UNTAGGED`].
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let payload: Value = serde_json::from_str(raw)
            .map_err(|e| crate::LinkError::malformed("telemetry", e.to_string()))?;
        let object = payload
            .as_object()
            .ok_or_else(|| crate::LinkError::malformed("telemetry", "payload is not an object"))?;
        let tag = TelemetryTag::of(object).unwrap_or_else(|| TelemetryTag::Other(UNTAGGED.to_string()));

        let message = match &tag {
            TelemetryTag::Heartbeat => TelemetryMessage::Heartbeat(decode(&payload)),
            TelemetryTag::Attitude => TelemetryMessage::Attitude(decode(&payload)),
            TelemetryTag::ExternalDepth => TelemetryMessage::ExternalDepth(decode(&payload)),
            TelemetryTag::Power => TelemetryMessage::Power(decode(&payload)),
            TelemetryTag::Network => TelemetryMessage::Network(decode(&payload)),
            TelemetryTag::Other(name) => TelemetryMessage::Other { tag: name.clone() },
        };

        Ok(Self { tag, message, payload })
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        match &self.message {
            TelemetryMessage::Heartbeat(hb) => Some(hb),
            _ => None,
        }
    }
}

fn decode<T: for<'de> Deserialize<'de> + Default>(payload: &Value) -> T {
    T::deserialize(payload).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_recognized_by_either_tag() {
        let by_type = TelemetryRecord::parse(r#"{"type":"heartbeat","armed":true,"pilot_age":0.05,"pilot_seq":9}"#).unwrap();
        let by_sensor = TelemetryRecord::parse(r#"{"sensor":"heartbeat","armed":false,"sequence":3}"#).unwrap();

        assert_eq!(by_type.tag, TelemetryTag::Heartbeat);
        let hb = by_type.heartbeat().unwrap();
        assert!(hb.armed);
        assert_eq!(hb.pilot_age, Some(0.05));
        assert_eq!(hb.pilot_seq, Some(9));

        assert_eq!(by_sensor.heartbeat().unwrap().pilot_seq, Some(3));
    }

    #[test]
    fn network_report_decodes_nested_link() {
        let record = TelemetryRecord::parse(
            r#"{"type":"net","iface":"eth0","link":{"kind":"ethernet","state":"up","speed_mbps":100},"rx_bps":1250,"tx_bps":90000,"is_tether":true}"#,
        )
        .unwrap();
        match record.message {
            TelemetryMessage::Network(net) => {
                assert_eq!(net.iface.as_deref(), Some("eth0"));
                assert_eq!(net.link.speed_mbps, Some(100.0));
                assert!(net.is_tether);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn tag_prefers_type_then_sensor() {
        let record = TelemetryRecord::parse(r#"{"sensor":"bar30","type":"external_depth","depth_m":1.5}"#).unwrap();
        assert_eq!(record.tag, TelemetryTag::ExternalDepth);

        let record = TelemetryRecord::parse(r#"{"sensor":"leak","leak":false}"#).unwrap();
        assert_eq!(record.tag, TelemetryTag::Other("leak".into()));
        assert_eq!(record.payload["leak"], false);
    }

    #[test]
    fn power_defaults_to_ok() {
        let record = TelemetryRecord::parse(r#"{"type":"power","voltage_v":15.9}"#).unwrap();
        match record.message {
            TelemetryMessage::Power(power) => {
                assert!(power.ok);
                assert!(!power.held);
                assert_eq!(power.voltage_v, Some(15.9));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn only_non_objects_are_rejected() {
        for raw in ["not json", "[1,2]", "42", r#""heartbeat""#] {
            let err = TelemetryRecord::parse(raw).unwrap_err();
            assert!(matches!(err, crate::LinkError::MalformedMessage { .. }), "{raw}");
        }
    }

    #[test]
    fn oddly_typed_fields_are_coerced_not_rejected() {
        let record = TelemetryRecord::parse(r#"{"type":"heartbeat","armed":1,"pilot_age":"0.25","pilot_seq":-4}"#).unwrap();
        let hb = record.heartbeat().unwrap();
        assert!(hb.armed);
        assert_eq!(hb.pilot_age, Some(0.25));
        assert_eq!(hb.pilot_seq, None);

        let record = TelemetryRecord::parse(r#"{"type":"heartbeat","armed":"yes"}"#).unwrap();
        assert!(record.heartbeat().unwrap().armed);

        let record = TelemetryRecord::parse(r#"{"type":"power","voltage_v":null,"error":{"code":3}}"#).unwrap();
        match record.message {
            TelemetryMessage::Power(power) => {
                assert_eq!(power.voltage_v, None);
                assert_eq!(power.error.as_deref(), Some(r#"{"code":3}"#));
                assert!(power.ok);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let record = TelemetryRecord::parse(r#"{"type":"attitude","rpy_deg":"level","health":{"mode":4}}"#).unwrap();
        match record.message {
            TelemetryMessage::Attitude(attitude) => {
                assert_eq!(attitude.rpy_deg, None);
                assert_eq!(attitude.health.unwrap().mode.as_deref(), Some("4"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn untagged_object_is_forwarded() {
        let record = TelemetryRecord::parse(r#"{"value":1}"#).unwrap();
        assert_eq!(record.tag, TelemetryTag::Other(UNTAGGED.into()));
        assert_eq!(record.payload["value"], 1);
    }
}
