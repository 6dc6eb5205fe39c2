//! Wire codec for the envelope contract.
//!
//! Every message on the bus is `{v, ts, deviceId, location, type, payload,
//! correlationId?, source?}`. The payload shape depends on `type`, so decoding
//! produces a [`Message`] variant carrying only the fields valid for it.
//! Headerless legacy payloads (bare metric fields) are sniffed and turned into
//! telemetry envelopes.

use crate::errors::{Error, Result};
use crate::model::{Capabilities, Command};
use crate::validate::validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u8 = 1;

pub const REGISTRY_SEGMENT: &str = "_registry";

/// Topic filters the hub subscribes to.
pub const SUBSCRIPTIONS: &[&str] = &[
    "home/+/+/telemetry",
    "home/+/+/command",
    "home/+/+/ack",
    "home/_registry/+/birth",
    "home/_registry/+/will",
    "/device/+/telemetry",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Telemetry,
    Command,
    Ack,
    Birth,
    Will,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Telemetry => "telemetry",
            MessageType::Command => "command",
            MessageType::Ack => "ack",
            MessageType::Birth => "birth",
            MessageType::Will => "will",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "telemetry" => Some(MessageType::Telemetry),
            "command" => Some(MessageType::Command),
            "ack" => Some(MessageType::Ack),
            "birth" => Some(MessageType::Birth),
            "will" => Some(MessageType::Will),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: String,
    pub value: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Executed,
    Rejected,
    Error,
    Expired,
    /// Accepted by the device but not yet applied. Not terminal.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub correlation_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub actual_value: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub telemetry_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Telemetry(TelemetryPayload),
    Command(CommandPayload),
    Ack(AckPayload),
    Birth(BirthPayload),
    Will,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Telemetry(_) => MessageType::Telemetry,
            Message::Command(_) => MessageType::Command,
            Message::Ack(_) => MessageType::Ack,
            Message::Birth(_) => MessageType::Birth,
            Message::Will => MessageType::Will,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub protocol_version: u8,
    pub ts: i64,
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub message: Message,
    /// Synthesized from a headerless payload.
    pub legacy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default = "default_version")]
    v: u8,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTelemetry {
    Readings { readings: Vec<WireReading> },
    Flat(Map<String, Value>),
}

#[derive(Deserialize)]
struct WireReading {
    id: String,
    value: Value,
    #[serde(default)]
    unit: Option<String>,
}

/// Identity carried by the topic itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub kind: Option<String>,
}

impl TopicInfo {
    pub fn parse(topic: &str) -> Self {
        let parts: Vec<&str> = topic.split('/').collect();
        let owned = |s: &str| (!s.is_empty()).then(|| s.to_string());
        match parts.as_slice() {
            ["home", REGISTRY_SEGMENT, device, kind] => TopicInfo {
                location: None,
                device_id: owned(device),
                kind: owned(kind),
            },
            ["home", location, device, kind] => TopicInfo {
                location: owned(location),
                device_id: owned(device),
                kind: owned(kind),
            },
            ["", "device", device, kind] => TopicInfo {
                location: None,
                device_id: owned(device),
                kind: owned(kind),
            },
            _ => TopicInfo::default(),
        }
    }
}

pub fn command_topic(location: &str, device_id: &str) -> String {
    format!("home/{}/{}/command", location, device_id)
}

/// Numeric view of a reading value. Booleans become 1.0/0.0; anything else is
/// not a metric.
pub fn metric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Decodes and validates one transport message.
pub fn decode(topic: &str, payload: &[u8], received_at: i64) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::Decode(format!("JSON parse error: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(Error::Decode("payload is not a JSON object".to_string()));
    };

    let topic_info = TopicInfo::parse(topic);
    let envelope = if object.contains_key("type") || object.contains_key("payload") {
        decode_envelope(object, &topic_info, received_at)?
    } else {
        decode_legacy(object, &topic_info, received_at)?
    };

    validate(&envelope)?;
    Ok(envelope)
}

fn decode_envelope(object: Map<String, Value>, topic: &TopicInfo, received_at: i64) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_value(Value::Object(object))
        .map_err(|e| Error::Decode(format!("malformed envelope: {}", e)))?;

    let message_type =
        MessageType::parse(&wire.kind).ok_or_else(|| Error::UnknownMessageType(wire.kind.clone()))?;

    let message = match message_type {
        MessageType::Telemetry => Message::Telemetry(decode_telemetry(wire.payload)?),
        MessageType::Command => Message::Command(payload_as(wire.payload, "command")?),
        MessageType::Ack => Message::Ack(payload_as(wire.payload, "ack")?),
        MessageType::Birth => Message::Birth(payload_as(wire.payload, "birth")?),
        MessageType::Will => Message::Will,
    };

    Ok(Envelope {
        protocol_version: wire.v,
        ts: wire.ts.filter(|ts| *ts > 0).unwrap_or(received_at),
        device_id: wire.device_id.filter(|s| !s.is_empty()).or_else(|| topic.device_id.clone()),
        location: wire.location.filter(|s| !s.is_empty()).or_else(|| topic.location.clone()),
        correlation_id: wire.correlation_id,
        source: wire.source,
        message,
        legacy: false,
    })
}

fn payload_as<T: serde::de::DeserializeOwned>(payload: Value, kind: &str) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| Error::Decode(format!("malformed {} payload: {}", kind, e)))
}

fn decode_telemetry(payload: Value) -> Result<TelemetryPayload> {
    let wire: WireTelemetry = payload_as(payload, "telemetry")?;
    let readings = match wire {
        WireTelemetry::Readings { readings } => readings
            .into_iter()
            .filter_map(|r| {
                metric_value(&r.value).map(|value| Reading {
                    id: r.id,
                    value,
                    unit: r.unit,
                })
            })
            .collect(),
        WireTelemetry::Flat(fields) => flat_readings(&fields),
    };
    Ok(TelemetryPayload { readings })
}

fn flat_readings(fields: &Map<String, Value>) -> Vec<Reading> {
    fields
        .iter()
        .filter_map(|(id, value)| {
            metric_value(value).map(|value| Reading {
                id: id.clone(),
                value,
                unit: None,
            })
        })
        .collect()
}

fn decode_legacy(mut object: Map<String, Value>, topic: &TopicInfo, received_at: i64) -> Result<Envelope> {
    let ts = object
        .remove("ts")
        .and_then(|v| v.as_i64())
        .filter(|ts| *ts > 0)
        .unwrap_or(received_at);

    let readings: Vec<Reading> = flat_readings(&object)
        .into_iter()
        .map(|mut r| {
            if r.id == "tempC" || r.id == "temp" {
                r.id = "temperature".to_string();
            }
            r
        })
        .collect();

    if readings.is_empty() {
        return Err(Error::Decode("headerless payload has no metric fields".to_string()));
    }

    Ok(Envelope {
        protocol_version: PROTOCOL_VERSION,
        ts,
        device_id: topic.device_id.clone(),
        location: topic.location.clone(),
        correlation_id: None,
        source: None,
        message: Message::Telemetry(TelemetryPayload { readings }),
        legacy: true,
    })
}

/// Builds the outbound envelope for a ledger entry.
pub fn encode_command(command: &Command, location: &str, ts: i64) -> Result<(String, Vec<u8>)> {
    let envelope = serde_json::json!({
        "v": PROTOCOL_VERSION,
        "ts": ts,
        "deviceId": command.device_id,
        "location": location,
        "type": MessageType::Command.as_str(),
        "correlationId": command.correlation_id,
        "source": command.source,
        "payload": {
            "target": command.actuator_id,
            "action": command.action,
            "value": command.value,
            "reason": command.reason,
            "ttl": command.ttl_ms,
        }
    });
    Ok((command_topic(location, &command.device_id), serde_json::to_vec(&envelope)?))
}
