use chrono::Utc;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: u8 = 1;
pub const RELAY_ID: &str = "relay1";

/// Where a simulated device lives on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub location: String,
}

impl Identity {
    pub fn new(device_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            location: location.into(),
        }
    }

    pub fn topic(&self, kind: &str) -> String {
        format!("home/{}/{}/{}", self.location, self.device_id, kind)
    }

    pub fn registry_topic(&self, kind: &str) -> String {
        format!("home/_registry/{}/{}", self.device_id, kind)
    }

    pub fn legacy_topic(&self) -> String {
        format!("/device/{}/telemetry", self.device_id)
    }

    fn wrap(&self, kind: &str, payload: Value) -> Value {
        json!({
            "v": PROTOCOL_VERSION,
            "ts": Utc::now().timestamp_millis(),
            "deviceId": self.device_id,
            "location": self.location,
            "type": kind,
            "payload": payload,
            "source": self.device_id,
        })
    }

    pub fn birth(&self, telemetry_interval_ms: u64, relay_on: bool) -> Value {
        self.wrap(
            "birth",
            json!({
                "name": format!("Simulated {}", self.device_id),
                "platform": "simulator",
                "firmware": env!("CARGO_PKG_VERSION"),
                "telemetryIntervalMs": telemetry_interval_ms,
                "capabilities": {
                    "sensors": [
                        {"id": "t1", "type": "temperature", "unit": "C"},
                        {"id": "h1", "type": "humidity", "unit": "%"}
                    ],
                    "actuators": [
                        {"id": RELAY_ID, "type": "relay", "name": "Relay", "state": relay_on}
                    ]
                }
            }),
        )
    }

    pub fn will(&self) -> Value {
        self.wrap("will", json!({}))
    }

    pub fn telemetry(&self, temperature: f64, humidity: f64) -> Value {
        self.wrap(
            "telemetry",
            json!({
                "readings": [
                    {"id": "t1", "value": temperature, "unit": "C"},
                    {"id": "h1", "value": humidity, "unit": "%"}
                ]
            }),
        )
    }

    pub fn ack(&self, correlation_id: &str, status: &str, actual_value: Option<Value>, error: Option<&str>) -> Value {
        let mut payload = json!({
            "correlationId": correlation_id,
            "status": status,
            "target": RELAY_ID,
        });
        if let Some(value) = actual_value {
            payload["actualValue"] = value;
        }
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        let mut envelope = self.wrap("ack", payload);
        envelope["correlationId"] = json!(correlation_id);
        envelope
    }
}

/// Headerless payload as sent by old firmware.
pub fn legacy(temperature: f64, humidity: f64) -> Value {
    json!({
        "tempC": temperature,
        "humidity": humidity,
        "ts": Utc::now().timestamp_millis(),
    })
}
