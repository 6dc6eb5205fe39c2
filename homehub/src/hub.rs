//! Shared application state handed to the router, background loops and
//! the HTTP layer.
//!
//! Components are mutated through their own locks; the hub only sequences
//! "mutate, record, broadcast" so no component lock is held while a delta
//! is fanned out.

use crate::broadcast::{BroadcastHub, Delta, Snapshot, Subscription};
use crate::config::Config;
use crate::db::ColdStore;
use crate::errors::Result;
use crate::events::EventLog;
use crate::history::HistoryEngine;
use crate::hot::HotTier;
use crate::ledger::{CommandLedger, CommandPublisher, IssueRequest};
use crate::model::{Command, Device, Event};
use crate::registry::DeviceRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const EVENT_DEVICE_BIRTH: &str = "device_birth";
pub const EVENT_DEVICE_OFFLINE: &str = "device_offline";
pub const EVENT_COMMAND_ISSUED: &str = "command_issued";
pub const EVENT_COMMAND_OBSERVED: &str = "command_observed";
pub const EVENT_COMMAND_RESOLVED: &str = "command_resolved";
pub const EVENT_COMMAND_EXPIRED: &str = "command_expired";
pub const EVENT_ACTUATOR_RENAMED: &str = "actuator_renamed";

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub hot_ttl: Duration,
    pub default_command_ttl_ms: i64,
    pub default_location: String,
    pub recent_window: usize,
    pub subscriber_buffer: usize,
    /// Width of the buckets the aggregator writes to the cold tier.
    pub promotion_width_ms: i64,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            hot_ttl: Duration::from_secs(48 * 3600),
            default_command_ttl_ms: 30_000,
            default_location: "unknown".to_string(),
            recent_window: 50,
            subscriber_buffer: 256,
            promotion_width_ms: 300_000,
        }
    }
}

impl From<&Config> for HubOptions {
    fn from(config: &Config) -> Self {
        Self {
            hot_ttl: config.hot_ttl,
            default_command_ttl_ms: config.default_command_ttl_ms,
            default_location: config.default_location.clone(),
            recent_window: config.recent_window,
            subscriber_buffer: config.subscriber_buffer,
            promotion_width_ms: config.bucket_width_ms,
        }
    }
}

pub struct Hub {
    pub registry: DeviceRegistry,
    pub ledger: CommandLedger,
    pub hot: Arc<HotTier>,
    pub cold: Arc<dyn ColdStore>,
    pub events: EventLog,
    pub broadcast: BroadcastHub,
    pub history: HistoryEngine,
    recent_window: usize,
}

impl Hub {
    pub fn new(
        options: HubOptions,
        publisher: Arc<dyn CommandPublisher>,
        cold: Arc<dyn ColdStore>,
    ) -> Self {
        let hot = Arc::new(HotTier::new(options.hot_ttl));
        Self {
            registry: DeviceRegistry::new(options.default_location),
            ledger: CommandLedger::new(publisher, options.default_command_ttl_ms),
            history: HistoryEngine::new(hot.clone(), cold.clone(), options.promotion_width_ms),
            hot,
            cold,
            events: EventLog::new(),
            broadcast: BroadcastHub::new(options.subscriber_buffer),
            recent_window: options.recent_window,
        }
    }

    /// Issues a command to the device's current location.
    ///
    /// The pending delta goes out before the transport publish, so an ack
    /// handled while the publish is in flight always lands after it.
    pub fn issue_command(&self, request: IssueRequest, now: i64) -> Result<Command> {
        let location = self.registry.location_of(&request.device_id);
        let command = self.ledger.record(request, now)?;
        self.record_event(
            now,
            &command.device_id,
            EVENT_COMMAND_ISSUED,
            command_summary(&command),
            &command.source,
        );
        self.publish_command(command.clone());

        if let Err(e) = self.ledger.send(&command, &location, now) {
            if let Some(failed) = self.ledger.get(&command.correlation_id) {
                self.publish_command(failed);
            }
            return Err(e);
        }
        Ok(command)
    }

    /// Expires every overdue pending command and notifies subscribers.
    pub fn expire_commands(&self, now: i64) -> Vec<Command> {
        let expired = self.ledger.sweep(now);
        for command in &expired {
            self.record_event(
                now,
                &command.device_id,
                EVENT_COMMAND_EXPIRED,
                command_summary(command),
                "sweeper",
            );
            self.publish_command(command.clone());
        }
        expired
    }

    pub fn set_actuator_name(
        &self,
        device_id: &str,
        actuator_id: &str,
        name: String,
        now: i64,
    ) -> Result<Device> {
        let device = self.registry.set_custom_name(device_id, actuator_id, name.clone())?;
        info!("Actuator {}/{} renamed to {:?}", device_id, actuator_id, name);
        self.record_event(
            now,
            device_id,
            EVENT_ACTUATOR_RENAMED,
            json!({ "actuatorId": actuator_id, "name": name }),
            "api",
        );
        self.publish_device(device.clone());
        Ok(device)
    }

    pub fn clear_actuator_name(&self, device_id: &str, actuator_id: &str, now: i64) -> Result<Device> {
        let device = self.registry.clear_custom_name(device_id, actuator_id)?;
        info!("Actuator {}/{} custom name cleared", device_id, actuator_id);
        self.record_event(
            now,
            device_id,
            EVENT_ACTUATOR_RENAMED,
            json!({ "actuatorId": actuator_id, "name": Value::Null }),
            "api",
        );
        self.publish_device(device.clone());
        Ok(device)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            latest_readings: self.hot.latest_per_device(),
            devices: self.registry.all(),
            actuators: self.registry.actuators(None).unwrap_or_default(),
            recent_events: self.events.recent(self.recent_window),
            recent_commands: self.ledger.recent(self.recent_window),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcast.subscribe(|| self.snapshot())
    }

    /// Appends to the audit trail and pushes the event to subscribers.
    pub fn record_event(&self, timestamp: i64, device_id: &str, kind: &str, payload: Value, source: &str) -> Event {
        let event = self.events.record(Event {
            timestamp,
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            payload,
            source: source.to_string(),
        });
        self.broadcast.publish(Delta::Event { event: event.clone() });
        event
    }

    pub fn publish_command(&self, command: Command) {
        self.broadcast.publish(Delta::Command { command });
    }

    pub fn publish_device(&self, device: Device) {
        self.broadcast.publish(Delta::Device { device });
    }
}

pub(crate) fn command_summary(command: &Command) -> Value {
    json!({
        "correlationId": command.correlation_id,
        "actuatorId": command.actuator_id,
        "action": command.action,
        "value": command.value,
        "status": command.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryColdStore;
    use crate::ledger::tests::RecordingPublisher;
    use crate::model::CommandStatus;
    use crate::registry::Birth;
    use crate::router::{handle_inbound, Inbound};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::sync::Weak;

    /// Device that acks each command before `publish` returns.
    #[derive(Default)]
    struct EagerDevice {
        hub: Mutex<Weak<Hub>>,
    }

    impl CommandPublisher for EagerDevice {
        fn is_available(&self) -> bool {
            true
        }

        fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()> {
            let Some(hub) = self.hub.lock().upgrade() else {
                return Ok(());
            };
            let command: Value = serde_json::from_slice(&payload)?;
            let ack = json!({
                "v": 1, "ts": 50, "deviceId": command["deviceId"], "type": "ack",
                "payload": {"correlationId": command["correlationId"], "status": "executed"}
            });
            let inbound = Inbound {
                topic: topic.replace("/command", "/ack"),
                payload: serde_json::to_vec(&ack)?,
                received_at: 50,
            };
            handle_inbound(&hub, &inbound);
            Ok(())
        }
    }

    fn hub() -> (Arc<RecordingPublisher>, Hub) {
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = Hub::new(
            HubOptions::default(),
            publisher.clone(),
            Arc::new(MemoryColdStore::new()),
        );
        (publisher, hub)
    }

    fn relay_request(ttl_ms: i64) -> IssueRequest {
        IssueRequest {
            device_id: "esp32-1".to_string(),
            actuator_id: "relay1".to_string(),
            action: "set".to_string(),
            value: json!(true),
            source: "api".to_string(),
            reason: None,
            ttl_ms: Some(ttl_ms),
        }
    }

    #[test]
    fn test_issue_uses_registered_location() {
        let (publisher, hub) = hub();
        hub.registry.upsert_from_birth(
            "esp32-1",
            Birth {
                location: Some("kitchen".to_string()),
                ..Birth::default()
            },
            0,
        );

        hub.issue_command(relay_request(5000), 0).unwrap();
        let sent = publisher.sent.lock();
        assert_eq!(sent[0].0, "home/kitchen/esp32-1/command");
        assert_eq!(hub.events.recent(1)[0].kind, EVENT_COMMAND_ISSUED);
    }

    #[test]
    fn test_transport_down_reports_failure() {
        let (publisher, hub) = hub();
        publisher.down.store(true, Ordering::SeqCst);

        assert!(hub.issue_command(relay_request(5000), 0).is_err());
        assert!(hub.ledger.recent(10).is_empty());
        assert!(hub.events.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_reaches_subscribers() {
        let (_, hub) = hub();
        let command = hub.issue_command(relay_request(5000), 0).unwrap();
        let mut sub = hub.subscribe();

        assert!(hub.expire_commands(4999).is_empty());
        let expired = hub.expire_commands(5001);
        assert_eq!(expired.len(), 1);
        assert_eq!(
            hub.ledger.get(&command.correlation_id).unwrap().status,
            CommandStatus::Expired
        );

        match &*sub.rx.recv().await.unwrap() {
            Delta::Snapshot(snapshot) => assert_eq!(snapshot.recent_commands.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert!(matches!(&*sub.rx.recv().await.unwrap(), Delta::Event { .. }));
        match &*sub.rx.recv().await.unwrap() {
            Delta::Command { command } => assert_eq!(command.status, CommandStatus::Expired),
            other => panic!("expected command delta, got {:?}", other),
        }
    }

    #[test]
    fn test_rename_unknown_actuator_is_not_found() {
        let (_, hub) = hub();
        let err = hub
            .set_actuator_name("ghost", "relay1", "Lamp".to_string(), 0)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pending_delta_precedes_synchronous_ack() {
        let publisher = Arc::new(EagerDevice::default());
        let hub = Arc::new(Hub::new(
            HubOptions::default(),
            publisher.clone(),
            Arc::new(MemoryColdStore::new()),
        ));
        *publisher.hub.lock() = Arc::downgrade(&hub);
        let mut sub = hub.subscribe();

        let command = hub.issue_command(relay_request(5000), 0).unwrap();
        assert_eq!(
            hub.ledger.get(&command.correlation_id).unwrap().status,
            CommandStatus::Acked
        );

        let mut statuses = Vec::new();
        while let Ok(delta) = sub.rx.try_recv() {
            if let Delta::Command { command } = &*delta {
                statuses.push(command.status);
            }
        }
        assert_eq!(statuses, vec![CommandStatus::Pending, CommandStatus::Acked]);
    }

    #[test]
    fn test_failed_send_publishes_failed_state() {
        let (publisher, hub) = hub();
        publisher.fail.store(true, Ordering::SeqCst);
        let mut sub = hub.subscribe();

        assert!(hub.issue_command(relay_request(5000), 0).is_err());
        let mut statuses = Vec::new();
        while let Ok(delta) = sub.rx.try_recv() {
            if let Delta::Command { command } = &*delta {
                statuses.push(command.status);
            }
        }
        assert_eq!(statuses, vec![CommandStatus::Pending, CommandStatus::Failed]);
    }
}
