use crate::envelope::{legacy, Identity, RELAY_ID};
use rand::Rng;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub broker: String,
    pub port: u16,
    pub telemetry_interval: Duration,
    /// Every n-th telemetry message uses the legacy shape. 0 disables.
    pub legacy_every: u64,
}

/// Relay state plus the logic for answering commands.
#[derive(Debug)]
pub struct SimDevice {
    pub identity: Identity,
    pub relay_on: bool,
}

impl SimDevice {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            relay_on: false,
        }
    }

    /// Applies a command envelope and returns the ack to publish, if any.
    pub fn handle_command(&mut self, payload: &[u8]) -> Option<Value> {
        let envelope: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: unreadable command: {}", self.identity.device_id, e);
                return None;
            }
        };
        let Some(correlation_id) = envelope["correlationId"].as_str() else {
            warn!("{}: command without correlation ID", self.identity.device_id);
            return None;
        };
        let command = &envelope["payload"];

        if command["target"].as_str() != Some(RELAY_ID) {
            return Some(self.identity.ack(correlation_id, "rejected", None, Some("unknown target")));
        }

        let next = match command["action"].as_str() {
            Some("set") => match &command["value"] {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
                _ => {
                    return Some(self.identity.ack(correlation_id, "error", None, Some("invalid value")));
                }
            },
            Some("toggle") => !self.relay_on,
            _ => {
                return Some(self.identity.ack(correlation_id, "rejected", None, Some("unsupported action")));
            }
        };

        self.relay_on = next;
        info!("{}: relay set to {}", self.identity.device_id, next);
        Some(self.identity.ack(correlation_id, "executed", Some(Value::Bool(next)), None))
    }
}

async fn publish(client: &AsyncClient, topic: String, payload: &Value) {
    if let Err(e) = client
        .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
        .await
    {
        warn!("Failed to publish: {}", e);
    }
}

pub async fn run_device(identity: Identity, options: DeviceOptions) {
    let client_id = format!("sim-{}-{}", identity.device_id, rand::thread_rng().gen::<u32>());
    let mut mqtt_options = MqttOptions::new(client_id, options.broker.clone(), options.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_last_will(LastWill::new(
        identity.registry_topic("will"),
        identity.will().to_string(),
        QoS::AtLeastOnce,
        false,
    ));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);
    let command_topic = identity.topic("command");
    let mut device = SimDevice::new(identity);
    let mut ticker = interval(options.telemetry_interval);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            notification = eventloop.poll() => match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("{}: connected, announcing birth", device.identity.device_id);
                    if let Err(e) = client.subscribe(command_topic.clone(), QoS::AtLeastOnce).await {
                        error!("{}: subscribe failed: {}", device.identity.device_id, e);
                    }
                    let birth = device
                        .identity
                        .birth(options.telemetry_interval.as_millis() as u64, device.relay_on);
                    publish(&client, device.identity.registry_topic("birth"), &birth).await;
                }
                Ok(Event::Incoming(Packet::Publish(msg))) if msg.topic == command_topic => {
                    if let Some(ack) = device.handle_command(&msg.payload) {
                        publish(&client, device.identity.topic("ack"), &ack).await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("{}: MQTT eventloop error: {}", device.identity.device_id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = ticker.tick() => {
                let (temperature, humidity) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(15.0..35.0), rng.gen_range(30.0..80.0))
                };
                sent += 1;
                if options.legacy_every > 0 && sent % options.legacy_every == 0 {
                    publish(&client, device.identity.legacy_topic(), &legacy(temperature, humidity)).await;
                } else {
                    let telemetry = device.identity.telemetry(temperature, humidity);
                    publish(&client, device.identity.topic("telemetry"), &telemetry).await;
                }
                if sent % 100 == 0 {
                    debug!("{}: published {} telemetry messages", device.identity.device_id, sent);
                }
            }
        }
    }
}
