use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metric id (or sensor type) to numeric value.
pub type Metrics = BTreeMap<String, f64>;

/// Attributed to readings that arrive without any device identity.
pub const UNKNOWN_DEVICE: &str = "unknown";

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One telemetry sample as stored in the hot tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub device_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub values: Metrics,
    /// Topic the reading arrived on.
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Last observed state, updated in place by executed acks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
    #[serde(default)]
    pub actuators: Vec<ActuatorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub location: String,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub firmware: Option<String>,
    pub telemetry_interval_ms: Option<u64>,
    pub capabilities: Capabilities,
    /// User labels keyed by actuator id. Survives capability replacement.
    pub custom_names: BTreeMap<String, String>,
    pub online: bool,
    pub last_seen: i64,
}

impl Device {
    /// Custom name if set, else the declared name, else the actuator id.
    pub fn actuator_display_name(&self, actuator: &ActuatorSpec) -> String {
        self.custom_names
            .get(&actuator.id)
            .or(actuator.name.as_ref())
            .cloned()
            .unwrap_or_else(|| actuator.id.clone())
    }

    /// Name a reading id is stored under: the declared sensor type when it is
    /// unambiguous on this device, the raw id otherwise.
    pub fn metric_key(&self, reading_id: &str) -> String {
        let sensors = &self.capabilities.sensors;
        match sensors.iter().find(|s| s.id == reading_id) {
            Some(sensor) if sensors.iter().filter(|s| s.kind == sensor.kind).count() == 1 => {
                sensor.kind.clone()
            }
            _ => reading_id.to_string(),
        }
    }
}

/// Flattened actuator row annotated with its owning device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorView {
    pub device_id: String,
    pub actuator_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    pub declared_name: Option<String>,
    pub custom_name: Option<String>,
    pub state: Option<Value>,
    pub location: String,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Acked,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acked => "acked",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
        }
    }
}

/// Ledger entry for one actuator command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub correlation_id: String,
    pub device_id: String,
    pub actuator_id: String,
    pub action: String,
    pub value: Value,
    pub source: String,
    pub reason: Option<String>,
    pub ttl_ms: i64,
    pub status: CommandStatus,
    pub created_at: i64,
    pub ack_ts: Option<i64>,
    pub ack_payload: Option<Value>,
}

impl Command {
    pub fn deadline(&self) -> i64 {
        self.created_at.saturating_add(self.ttl_ms)
    }
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: i64,
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with(sensors: &[(&str, &str)]) -> Device {
        Device {
            id: "dev".to_string(),
            location: "garage".to_string(),
            name: None,
            platform: None,
            firmware: None,
            telemetry_interval_ms: None,
            capabilities: Capabilities {
                sensors: sensors
                    .iter()
                    .map(|(id, kind)| SensorSpec {
                        id: id.to_string(),
                        kind: kind.to_string(),
                        unit: None,
                        extra: BTreeMap::new(),
                    })
                    .collect(),
                actuators: vec![ActuatorSpec {
                    id: "relay1".to_string(),
                    kind: "switch".to_string(),
                    name: Some("Garage Light".to_string()),
                    state: None,
                    extra: BTreeMap::new(),
                }],
            },
            custom_names: BTreeMap::new(),
            online: true,
            last_seen: 0,
        }
    }

    #[test]
    fn test_display_name_precedence() {
        let mut device = device_with(&[]);
        let actuator = device.capabilities.actuators[0].clone();
        assert_eq!(device.actuator_display_name(&actuator), "Garage Light");

        device
            .custom_names
            .insert("relay1".to_string(), "Porch".to_string());
        assert_eq!(device.actuator_display_name(&actuator), "Porch");

        device.custom_names.clear();
        let unnamed = ActuatorSpec {
            name: None,
            ..actuator
        };
        assert_eq!(device.actuator_display_name(&unnamed), "relay1");
    }

    #[test]
    fn test_metric_key_uses_unique_sensor_type() {
        let device = device_with(&[("t1", "temperature"), ("h1", "humidity")]);
        assert_eq!(device.metric_key("t1"), "temperature");
        assert_eq!(device.metric_key("x9"), "x9");

        let ambiguous = device_with(&[("t1", "temperature"), ("t2", "temperature")]);
        assert_eq!(ambiguous.metric_key("t1"), "t1");
    }

    #[test]
    fn test_actuator_spec_keeps_extra_fields() {
        let spec: ActuatorSpec = serde_json::from_value(serde_json::json!({
            "id": "dim1", "type": "dimmer", "name": "Lamp", "min": 0, "max": 100
        }))
        .unwrap();
        assert_eq!(spec.extra.get("max"), Some(&serde_json::json!(100)));
        assert!(spec.state.is_none());
    }
}
