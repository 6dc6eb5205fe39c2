//! Inbound worker: decodes transport messages and dispatches them by type.

use crate::broadcast::Delta;
use crate::envelope::{
    decode, AckPayload, AckStatus, BirthPayload, CommandPayload, Envelope, Message, MessageType,
    TelemetryPayload,
};
use crate::errors::Error;
use crate::hub::{
    command_summary, Hub, EVENT_COMMAND_OBSERVED, EVENT_COMMAND_RESOLVED, EVENT_DEVICE_BIRTH,
    EVENT_DEVICE_OFFLINE,
};
use crate::ledger::{terminal_status, Resolution, ResolveOutcome};
use crate::metrics::{DROPPED_MESSAGES_TOTAL, TELEMETRY_INGESTED_TOTAL};
use crate::model::{Metrics, SensorReading, UNKNOWN_DEVICE};
use crate::registry::Birth;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A raw publish as received from the transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: i64,
}

/// Label used on the dropped-messages counter.
fn drop_reason(error: &Error) -> &'static str {
    match error {
        Error::Decode(_) | Error::Json(_) => "decode",
        Error::UnknownMessageType(_) => "unknown_type",
        Error::Validation(_) => "validation",
        _ => "other",
    }
}

/// Decodes and dispatches one inbound message. Malformed input is logged,
/// counted and dropped; it never stops the worker.
pub fn handle_inbound(hub: &Hub, inbound: &Inbound) -> Option<MessageType> {
    match decode(&inbound.topic, &inbound.payload, inbound.received_at) {
        Ok(envelope) => {
            let kind = envelope.message.message_type();
            dispatch(hub, envelope, &inbound.topic, inbound.received_at);
            Some(kind)
        }
        Err(e) => {
            let reason = drop_reason(&e);
            DROPPED_MESSAGES_TOTAL.with_label_values(&[reason]).inc();
            match e {
                Error::UnknownMessageType(_) => debug!("Dropping message on {}: {}", inbound.topic, e),
                _ => warn!("Dropping message on {}: {}", inbound.topic, e),
            }
            None
        }
    }
}

fn dispatch(hub: &Hub, envelope: Envelope, topic: &str, now: i64) {
    let Envelope {
        ts,
        device_id,
        location,
        correlation_id,
        source,
        message,
        ..
    } = envelope;
    let device_id = device_id.unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

    match message {
        Message::Telemetry(payload) => on_telemetry(hub, device_id, ts, payload, topic),
        Message::Command(payload) => {
            on_command(hub, &device_id, correlation_id, source, &payload, now)
        }
        Message::Ack(payload) => on_ack(hub, &device_id, ts, payload),
        Message::Birth(payload) => on_birth(hub, &device_id, location, ts, payload),
        Message::Will => on_will(hub, &device_id, ts),
    }
}

fn on_telemetry(hub: &Hub, device_id: String, ts: i64, payload: TelemetryPayload, topic: &str) {
    let device = hub.registry.get(&device_id);
    let values: Metrics = payload
        .readings
        .into_iter()
        .map(|r| {
            let key = match &device {
                Some(device) => device.metric_key(&r.id),
                None => r.id,
            };
            (key, r.value)
        })
        .collect();

    let reading = SensorReading {
        device_id,
        timestamp: ts,
        values,
        origin: topic.to_string(),
    };
    debug!(
        "Telemetry from {} at {}: {} metrics",
        reading.device_id,
        reading.timestamp,
        reading.values.len()
    );

    hub.hot.insert(reading.clone());
    hub.registry.touch(&reading.device_id, ts);
    TELEMETRY_INGESTED_TOTAL.inc();
    hub.broadcast.publish(Delta::Telemetry { reading });
}

fn on_command(
    hub: &Hub,
    device_id: &str,
    correlation_id: Option<String>,
    source: Option<String>,
    payload: &CommandPayload,
    now: i64,
) {
    let Some(correlation_id) = correlation_id.filter(|c| !c.is_empty()) else {
        warn!("Ignoring command for {} without correlation ID", device_id);
        DROPPED_MESSAGES_TOTAL.with_label_values(&["validation"]).inc();
        return;
    };

    if let Some(command) = hub
        .ledger
        .observe(&correlation_id, device_id, payload, source.as_deref(), now)
    {
        hub.record_event(
            now,
            device_id,
            EVENT_COMMAND_OBSERVED,
            command_summary(&command),
            &command.source,
        );
        hub.publish_command(command);
    }
}

fn on_ack(hub: &Hub, device_id: &str, ts: i64, ack: AckPayload) {
    if let Some(owner) = hub.ledger.get(&ack.correlation_id).map(|c| c.device_id) {
        if owner != device_id {
            warn!(
                "Ignoring ack for {} from {}: command belongs to {}",
                ack.correlation_id, device_id, owner
            );
            DROPPED_MESSAGES_TOTAL.with_label_values(&["validation"]).inc();
            return;
        }
    }

    if let Some(status) = terminal_status(ack.status) {
        let resolution = Resolution {
            status,
            ack_ts: ts,
            ack_payload: serde_json::to_value(&ack).ok(),
        };
        match hub.ledger.resolve(&ack.correlation_id, resolution) {
            Ok(ResolveOutcome::Resolved(command)) => {
                hub.record_event(
                    ts,
                    device_id,
                    EVENT_COMMAND_RESOLVED,
                    command_summary(&command),
                    device_id,
                );
                hub.publish_command(command);
            }
            // The ledger logs both.
            Ok(ResolveOutcome::AlreadyTerminal(_)) | Ok(ResolveOutcome::Unknown) => {}
            Err(e) => warn!("Failed to resolve {}: {}", ack.correlation_id, e),
        }
    } else {
        debug!("Progress ack for {} ignored", ack.correlation_id);
    }

    if ack.status != AckStatus::Executed {
        return;
    }
    if let (Some(target), Some(value)) = (ack.target, ack.actual_value) {
        match hub.registry.sync_actuator_state(device_id, &target, value) {
            Ok(device) => hub.publish_device(device),
            Err(e) => debug!("Actuator state not synced: {}", e),
        }
    }
}

fn on_birth(hub: &Hub, device_id: &str, location: Option<String>, ts: i64, payload: BirthPayload) {
    let birth = Birth {
        location,
        name: payload.name,
        platform: payload.platform,
        firmware: payload.firmware,
        capabilities: payload.capabilities,
        telemetry_interval_ms: payload.telemetry_interval_ms,
    };
    let device = hub.registry.upsert_from_birth(device_id, birth, ts);
    info!(
        "Device {} online at {} ({} sensors, {} actuators)",
        device.id,
        device.location,
        device.capabilities.sensors.len(),
        device.capabilities.actuators.len()
    );

    hub.record_event(
        ts,
        device_id,
        EVENT_DEVICE_BIRTH,
        json!({
            "location": device.location,
            "platform": device.platform,
            "firmware": device.firmware,
            "sensors": device.capabilities.sensors.len(),
            "actuators": device.capabilities.actuators.len(),
        }),
        device_id,
    );
    hub.publish_device(device);
}

fn on_will(hub: &Hub, device_id: &str, ts: i64) {
    match hub.registry.mark_offline(device_id) {
        Ok(device) => {
            info!("Device {} went offline", device_id);
            hub.record_event(ts, device_id, EVENT_DEVICE_OFFLINE, json!({}), device_id);
            hub.publish_device(device);
        }
        Err(e) => debug!("Will for unregistered device: {}", e),
    }
}

/// Drains the inbound queue until every sender is gone.
pub async fn run_router(mut rx: mpsc::Receiver<Inbound>, hub: Arc<Hub>) {
    info!("Starting inbound router");
    let mut handled: u64 = 0;

    while let Some(inbound) = rx.recv().await {
        if handle_inbound(&hub, &inbound).is_some() {
            handled += 1;
        }
    }

    info!("Inbound router stopped after {} messages", handled);
}
