use crate::envelope::{Envelope, Message, PROTOCOL_VERSION};
use crate::errors::{Error, Result};
use std::collections::HashSet;

const TTL_MIN_MS: i64 = 1;
const TTL_MAX_MS: i64 = 3_600_000;

/// Validates a decoded envelope
pub fn validate(envelope: &Envelope) -> Result<()> {
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Validation(format!(
            "Unsupported protocol version {}",
            envelope.protocol_version
        )));
    }

    // Headerless payloads are allowed to arrive without identity
    if !envelope.legacy && envelope.device_id.as_deref().map_or(true, str::is_empty) {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    match &envelope.message {
        Message::Telemetry(telemetry) => {
            if telemetry.readings.is_empty() {
                return Err(Error::Validation("Telemetry has no numeric readings".to_string()));
            }
            for reading in &telemetry.readings {
                if reading.id.is_empty() {
                    return Err(Error::Validation("Reading ID cannot be empty".to_string()));
                }
                if !reading.value.is_finite() {
                    return Err(Error::Validation(format!(
                        "Reading {} is not a finite number",
                        reading.id
                    )));
                }
            }
        }
        Message::Command(command) => {
            if command.target.is_empty() || command.action.is_empty() {
                return Err(Error::Validation(
                    "Command target and action are required".to_string(),
                ));
            }
            if let Some(ttl) = command.ttl {
                validate_ttl(ttl)?;
            }
        }
        Message::Ack(ack) => {
            if ack.correlation_id.is_empty() {
                return Err(Error::Validation("Ack correlation ID cannot be empty".to_string()));
            }
        }
        Message::Birth(birth) => {
            let mut seen = HashSet::new();
            for id in birth
                .capabilities
                .sensors
                .iter()
                .map(|s| &s.id)
                .chain(birth.capabilities.actuators.iter().map(|a| &a.id))
            {
                if id.is_empty() {
                    return Err(Error::Validation("Capability ID cannot be empty".to_string()));
                }
                if !seen.insert(id) {
                    return Err(Error::Validation(format!("Duplicate capability ID {}", id)));
                }
            }
        }
        Message::Will => {}
    }

    Ok(())
}

pub fn validate_ttl(ttl_ms: i64) -> Result<()> {
    if !(TTL_MIN_MS..=TTL_MAX_MS).contains(&ttl_ms) {
        return Err(Error::Validation(format!(
            "TTL {}ms out of range [{}, {}]",
            ttl_ms, TTL_MIN_MS, TTL_MAX_MS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AckPayload, AckStatus, CommandPayload, Reading, TelemetryPayload};

    fn telemetry(device_id: Option<&str>, value: f64) -> Envelope {
        Envelope {
            protocol_version: 1,
            ts: 1000,
            device_id: device_id.map(str::to_string),
            location: Some("garage".to_string()),
            correlation_id: None,
            source: None,
            message: Message::Telemetry(TelemetryPayload {
                readings: vec![Reading {
                    id: "t1".to_string(),
                    value,
                    unit: None,
                }],
            }),
            legacy: false,
        }
    }

    #[test]
    fn test_valid_telemetry() {
        assert!(validate(&telemetry(Some("dev-1"), 22.5)).is_ok());
    }

    #[test]
    fn test_wrong_version() {
        let mut env = telemetry(Some("dev-1"), 22.5);
        env.protocol_version = 2;
        assert!(validate(&env).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate(&telemetry(Some(""), 22.5)).is_err());
        assert!(validate(&telemetry(None, 22.5)).is_err());

        let mut legacy = telemetry(None, 22.5);
        legacy.legacy = true;
        assert!(validate(&legacy).is_ok());
    }

    #[test]
    fn test_non_finite_reading() {
        assert!(validate(&telemetry(Some("dev-1"), f64::NAN)).is_err());
    }

    #[test]
    fn test_command_ttl_bounds() {
        let mut env = telemetry(Some("dev-1"), 0.0);
        env.message = Message::Command(CommandPayload {
            target: "relay1".to_string(),
            action: "set".to_string(),
            value: serde_json::json!(true),
            reason: None,
            ttl: Some(0),
        });
        assert!(validate(&env).is_err());

        if let Message::Command(c) = &mut env.message {
            c.ttl = Some(30_000);
        }
        assert!(validate(&env).is_ok());
    }

    #[test]
    fn test_ack_requires_correlation_id() {
        let mut env = telemetry(Some("dev-1"), 0.0);
        env.message = Message::Ack(AckPayload {
            correlation_id: String::new(),
            status: AckStatus::Executed,
            target: None,
            actual_value: None,
            error: None,
        });
        assert!(validate(&env).is_err());
    }
}
