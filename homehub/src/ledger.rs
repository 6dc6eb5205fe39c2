//! Append-only command ledger and its expiration sweep.
//!
//! Entries move from `pending` to exactly one terminal status. Acks and the
//! sweep race for the same entry; the write lock makes whichever lands first
//! the winner and turns the other into a no-op.

use crate::envelope::{encode_command, AckStatus, CommandPayload};
use crate::errors::{Error, Result};
use crate::hub::Hub;
use crate::metrics::{COMMANDS_EXPIRED_TOTAL, COMMANDS_ISSUED_TOTAL, COMMANDS_RESOLVED_TOTAL};
use crate::model::{now_ms, Command, CommandStatus};
use crate::validate::validate_ttl;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Outbound side of the transport, as seen by the ledger.
pub trait CommandPublisher: Send + Sync {
    fn is_available(&self) -> bool;
    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub device_id: String,
    pub actuator_id: String,
    pub action: String,
    pub value: Value,
    pub source: String,
    pub reason: Option<String>,
    pub ttl_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub status: CommandStatus,
    pub ack_ts: i64,
    pub ack_payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The entry moved from pending to the given terminal status.
    Resolved(Command),
    /// The entry was already terminal; nothing changed.
    AlreadyTerminal(Command),
    Unknown,
}

/// Terminal ledger status for a device ack, `None` for progress reports.
pub fn terminal_status(status: AckStatus) -> Option<CommandStatus> {
    match status {
        AckStatus::Executed => Some(CommandStatus::Acked),
        AckStatus::Rejected | AckStatus::Error => Some(CommandStatus::Failed),
        AckStatus::Expired => Some(CommandStatus::Expired),
        AckStatus::Queued => None,
    }
}

#[derive(Default)]
struct LedgerInner {
    entries: Vec<Command>,
    index: HashMap<String, usize>,
    /// (deadline, entry index) of every pending entry.
    pending: BTreeSet<(i64, usize)>,
}

impl LedgerInner {
    fn insert(&mut self, command: Command) -> Command {
        let idx = self.entries.len();
        self.index.insert(command.correlation_id.clone(), idx);
        if command.status == CommandStatus::Pending {
            self.pending.insert((command.deadline(), idx));
        }
        self.entries.push(command.clone());
        command
    }

    /// Moves a pending entry to `status`. Returns `None` when it was already terminal.
    fn finish(&mut self, idx: usize, status: CommandStatus, ack_ts: Option<i64>, ack_payload: Option<Value>) -> Option<Command> {
        let entry = &mut self.entries[idx];
        if entry.status.is_terminal() {
            return None;
        }
        self.pending.remove(&(entry.deadline(), idx));
        entry.status = status;
        entry.ack_ts = ack_ts;
        entry.ack_payload = ack_payload;
        Some(entry.clone())
    }
}

pub struct CommandLedger {
    inner: RwLock<LedgerInner>,
    publisher: Arc<dyn CommandPublisher>,
    default_ttl_ms: i64,
}

impl CommandLedger {
    pub fn new(publisher: Arc<dyn CommandPublisher>, default_ttl_ms: i64) -> Self {
        Self {
            inner: RwLock::new(LedgerInner::default()),
            publisher,
            default_ttl_ms,
        }
    }

    /// Records a pending entry and publishes it to `location`.
    ///
    /// Fails with [`Error::TransportUnavailable`] without creating an entry
    /// when the transport is down. A publish that fails after insertion leaves
    /// the entry `failed`.
    pub fn issue(&self, request: IssueRequest, location: &str, now: i64) -> Result<Command> {
        let command = self.record(request, now)?;
        self.send(&command, location, now)?;
        Ok(command)
    }

    /// First half of [`issue`](Self::issue): validates and inserts the
    /// pending entry without touching the transport.
    pub fn record(&self, request: IssueRequest, now: i64) -> Result<Command> {
        let ttl_ms = request.ttl_ms.unwrap_or(self.default_ttl_ms);
        validate_ttl(ttl_ms)?;
        if request.device_id.is_empty() || request.actuator_id.is_empty() || request.action.is_empty() {
            return Err(Error::Validation(
                "Command device, actuator and action are required".to_string(),
            ));
        }
        if !self.publisher.is_available() {
            warn!(
                "Cannot issue command to {}/{}: transport unavailable",
                request.device_id, request.actuator_id
            );
            return Err(Error::TransportUnavailable);
        }

        let mut inner = self.inner.write();
        let correlation_id = allocate_id(&inner.index, &request.source);
        Ok(inner.insert(Command {
            correlation_id,
            device_id: request.device_id,
            actuator_id: request.actuator_id,
            action: request.action,
            value: request.value,
            source: request.source,
            reason: request.reason,
            ttl_ms,
            status: CommandStatus::Pending,
            created_at: now,
            ack_ts: None,
            ack_payload: None,
        }))
    }

    /// Second half of [`issue`](Self::issue): publishes a recorded entry.
    /// On failure the entry is marked `failed` and the error returned.
    pub fn send(&self, command: &Command, location: &str, now: i64) -> Result<()> {
        let published = encode_command(command, location, now)
            .and_then(|(topic, payload)| self.publisher.publish(topic, payload));
        if let Err(e) = published {
            warn!("Failed to publish command {}: {}", command.correlation_id, e);
            self.fail_unsent(&command.correlation_id, now, &e);
            return Err(e);
        }

        COMMANDS_ISSUED_TOTAL.inc();
        info!(
            "Issued command {} to {}/{} ({} = {}, ttl {}ms)",
            command.correlation_id,
            command.device_id,
            command.actuator_id,
            command.action,
            command.value,
            command.ttl_ms
        );
        Ok(())
    }

    /// Records a command published on the bus by another actor. Returns the
    /// new entry, or `None` when the correlation id is already known.
    pub fn observe(
        &self,
        correlation_id: &str,
        device_id: &str,
        payload: &CommandPayload,
        source: Option<&str>,
        now: i64,
    ) -> Option<Command> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(correlation_id) {
            debug!("Command {} already in ledger", correlation_id);
            return None;
        }
        let command = inner.insert(Command {
            correlation_id: correlation_id.to_string(),
            device_id: device_id.to_string(),
            actuator_id: payload.target.clone(),
            action: payload.action.clone(),
            value: payload.value.clone(),
            source: source.unwrap_or("bus").to_string(),
            reason: payload.reason.clone(),
            ttl_ms: payload.ttl.unwrap_or(self.default_ttl_ms),
            status: CommandStatus::Pending,
            created_at: now,
            ack_ts: None,
            ack_payload: None,
        });
        info!(
            "Observed command {} from {} for {}/{}",
            command.correlation_id, command.source, command.device_id, command.actuator_id
        );
        Some(command)
    }

    /// Applies an ack. Idempotent: a second ack against a terminal entry
    /// changes nothing.
    pub fn resolve(&self, correlation_id: &str, resolution: Resolution) -> Result<ResolveOutcome> {
        if !resolution.status.is_terminal() {
            return Err(Error::Validation(format!(
                "Cannot resolve {} to non-terminal status",
                correlation_id
            )));
        }

        let mut inner = self.inner.write();
        let Some(&idx) = inner.index.get(correlation_id) else {
            debug!("Ack for unknown command {}", correlation_id);
            return Ok(ResolveOutcome::Unknown);
        };

        match inner.finish(
            idx,
            resolution.status,
            Some(resolution.ack_ts),
            resolution.ack_payload,
        ) {
            Some(command) => {
                COMMANDS_RESOLVED_TOTAL
                    .with_label_values(&[command.status.as_str()])
                    .inc();
                info!("Command {} -> {}", correlation_id, command.status.as_str());
                Ok(ResolveOutcome::Resolved(command))
            }
            None => {
                let existing = inner.entries[idx].clone();
                info!(
                    "Duplicate ack for command {} ignored (already {})",
                    correlation_id,
                    existing.status.as_str()
                );
                Ok(ResolveOutcome::AlreadyTerminal(existing))
            }
        }
    }

    /// Expires every pending entry whose deadline has passed at `now`.
    pub fn sweep(&self, now: i64) -> Vec<Command> {
        let mut inner = self.inner.write();
        let due: Vec<usize> = inner
            .pending
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, idx)| *idx)
            .collect();

        let expired: Vec<Command> = due
            .into_iter()
            .filter_map(|idx| inner.finish(idx, CommandStatus::Expired, None, None))
            .collect();

        if !expired.is_empty() {
            COMMANDS_EXPIRED_TOTAL.inc_by(expired.len() as f64);
            info!("Expired {} pending commands", expired.len());
        }
        expired
    }

    pub fn get(&self, correlation_id: &str) -> Option<Command> {
        let inner = self.inner.read();
        inner
            .index
            .get(correlation_id)
            .map(|&idx| inner.entries[idx].clone())
    }

    /// Entries created in `[since, until]`, oldest first.
    pub fn range(&self, since: i64, until: i64) -> Vec<Command> {
        let inner = self.inner.read();
        let mut commands: Vec<Command> = inner
            .entries
            .iter()
            .filter(|c| c.created_at >= since && c.created_at <= until)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.created_at);
        commands
    }

    /// The `n` most recently created entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Command> {
        let inner = self.inner.read();
        let start = inner.entries.len().saturating_sub(n);
        inner.entries[start..].to_vec()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    fn fail_unsent(&self, correlation_id: &str, now: i64, error: &Error) {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(correlation_id) {
            let payload = serde_json::json!({ "error": error.to_string() });
            inner.finish(idx, CommandStatus::Failed, Some(now), Some(payload));
        }
    }
}

fn allocate_id(index: &HashMap<String, usize>, source: &str) -> String {
    let prefix: String = source
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(16)
        .collect();
    let prefix = if prefix.is_empty() { "cmd".to_string() } else { prefix };
    loop {
        let id = format!("{}-{}", prefix, uuid::Uuid::new_v4().simple());
        if !index.contains_key(&id) {
            return id;
        }
    }
}

/// Periodically expires overdue commands until the process stops.
pub async fn run_sweeper(hub: Arc<Hub>, period: Duration) {
    info!("Starting command sweeper with interval={:?}", period);
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;
        let expired = hub.expire_commands(now_ms());
        if !expired.is_empty() {
            debug!("Sweep expired {} commands", expired.len());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Publisher that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub down: AtomicBool,
        pub fail: AtomicBool,
        pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl CommandPublisher for RecordingPublisher {
        fn is_available(&self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }

        fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ChannelSend);
            }
            self.sent.lock().push((topic, payload));
            Ok(())
        }
    }

    fn request(ttl_ms: Option<i64>) -> IssueRequest {
        IssueRequest {
            device_id: "esp32-1".to_string(),
            actuator_id: "relay1".to_string(),
            action: "set".to_string(),
            value: json!(true),
            source: "dashboard".to_string(),
            reason: None,
            ttl_ms,
        }
    }

    fn ledger() -> (Arc<RecordingPublisher>, CommandLedger) {
        let publisher = Arc::new(RecordingPublisher::default());
        let ledger = CommandLedger::new(publisher.clone(), 30_000);
        (publisher, ledger)
    }

    fn executed(ack_ts: i64) -> Resolution {
        Resolution {
            status: CommandStatus::Acked,
            ack_ts,
            ack_payload: Some(json!({"actualValue": true})),
        }
    }

    #[test]
    fn test_issue_publishes_pending_entry() {
        let (publisher, ledger) = ledger();
        let command = ledger.issue(request(None), "garage", 0).unwrap();

        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.ttl_ms, 30_000);
        assert!(command.correlation_id.starts_with("dashboard-"));
        let sent = publisher.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "home/garage/esp32-1/command");
    }

    #[test]
    fn test_issue_reports_transport_unavailable() {
        let (publisher, ledger) = ledger();
        publisher.down.store(true, Ordering::SeqCst);

        let result = ledger.issue(request(None), "garage", 0);
        assert!(matches!(result, Err(Error::TransportUnavailable)));
        assert!(ledger.recent(10).is_empty());
    }

    #[test]
    fn test_failed_publish_marks_entry_failed() {
        let (publisher, ledger) = ledger();
        publisher.fail.store(true, Ordering::SeqCst);

        assert!(ledger.issue(request(None), "garage", 0).is_err());
        let entries = ledger.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, CommandStatus::Failed);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_expiry_never_early() {
        let (_, ledger) = ledger();
        let command = ledger.issue(request(Some(5000)), "garage", 0).unwrap();

        assert!(ledger.sweep(4999).is_empty());
        assert_eq!(ledger.get(&command.correlation_id).unwrap().status, CommandStatus::Pending);

        let expired = ledger.sweep(5001);
        assert_eq!(expired.len(), 1);
        assert_eq!(ledger.get(&command.correlation_id).unwrap().status, CommandStatus::Expired);
        assert!(ledger.sweep(10_000).is_empty());
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let (_, ledger) = ledger();
        let command = ledger.issue(request(None), "garage", 0).unwrap();
        let id = command.correlation_id;

        let first = ledger.resolve(&id, executed(100)).unwrap();
        assert!(matches!(first, ResolveOutcome::Resolved(ref c) if c.ack_ts == Some(100)));

        let second = ledger.resolve(&id, executed(200)).unwrap();
        assert!(matches!(second, ResolveOutcome::AlreadyTerminal(ref c) if c.ack_ts == Some(100)));
        assert_eq!(ledger.get(&id).unwrap().ack_ts, Some(100));
    }

    #[test]
    fn test_late_ack_after_expiry_is_noop() {
        let (_, ledger) = ledger();
        let command = ledger.issue(request(Some(1000)), "garage", 0).unwrap();
        ledger.sweep(2000);

        let outcome = ledger.resolve(&command.correlation_id, executed(2500)).unwrap();
        assert!(matches!(outcome, ResolveOutcome::AlreadyTerminal(ref c) if c.status == CommandStatus::Expired));
    }

    #[test]
    fn test_resolve_unknown_and_non_terminal() {
        let (_, ledger) = ledger();
        assert_eq!(ledger.resolve("nope", executed(1)).unwrap(), ResolveOutcome::Unknown);

        let command = ledger.issue(request(None), "garage", 0).unwrap();
        let pending = Resolution {
            status: CommandStatus::Pending,
            ack_ts: 1,
            ack_payload: None,
        };
        assert!(ledger.resolve(&command.correlation_id, pending).is_err());
    }

    #[test]
    fn test_observe_skips_known_ids() {
        let (_, ledger) = ledger();
        let payload = CommandPayload {
            target: "relay1".to_string(),
            action: "set".to_string(),
            value: json!(false),
            reason: Some("too warm".to_string()),
            ttl: Some(10_000),
        };
        let observed = ledger.observe("ai-1234", "esp32-1", &payload, Some("ai-orchestrator"), 50);
        assert_eq!(observed.unwrap().source, "ai-orchestrator");
        assert!(ledger.observe("ai-1234", "esp32-1", &payload, None, 60).is_none());

        let own = ledger.issue(request(None), "garage", 70).unwrap();
        assert!(ledger
            .observe(&own.correlation_id, "esp32-1", &payload, None, 80)
            .is_none());
        assert_eq!(ledger.range(0, 100).len(), 2);
    }

    #[test]
    fn test_terminal_status_mapping() {
        assert_eq!(terminal_status(AckStatus::Executed), Some(CommandStatus::Acked));
        assert_eq!(terminal_status(AckStatus::Rejected), Some(CommandStatus::Failed));
        assert_eq!(terminal_status(AckStatus::Error), Some(CommandStatus::Failed));
        assert_eq!(terminal_status(AckStatus::Expired), Some(CommandStatus::Expired));
        assert_eq!(terminal_status(AckStatus::Queued), None);
    }

    #[test]
    fn test_ack_racing_sweep_has_one_winner() {
        let (_, ledger) = ledger();
        let ids: Vec<String> = (0..64)
            .map(|_| ledger.issue(request(Some(1000)), "garage", 0).unwrap().correlation_id)
            .collect();

        let (resolved, expired) = std::thread::scope(|scope| {
            let acks = scope.spawn(|| {
                ids.iter()
                    .filter(|id| matches!(ledger.resolve(id, executed(1500)), Ok(ResolveOutcome::Resolved(_))))
                    .count()
            });
            let sweep = scope.spawn(|| ledger.sweep(2000).len());
            (acks.join().unwrap(), sweep.join().unwrap())
        });

        assert_eq!(resolved + expired, ids.len());
        assert_eq!(ledger.pending_count(), 0);
        let acked = ids
            .iter()
            .filter(|id| ledger.get(id).unwrap().status == CommandStatus::Acked)
            .count();
        assert_eq!(acked, resolved);
        assert!(ledger.sweep(5000).is_empty());
    }

    #[test]
    fn test_record_then_send() {
        let (publisher, ledger) = ledger();
        let command = ledger.record(request(None), 0).unwrap();
        assert!(publisher.sent.lock().is_empty());
        assert_eq!(ledger.get(&command.correlation_id).unwrap().status, CommandStatus::Pending);

        publisher.fail.store(true, Ordering::SeqCst);
        assert!(ledger.send(&command, "garage", 0).is_err());
        assert_eq!(ledger.get(&command.correlation_id).unwrap().status, CommandStatus::Failed);
    }
}
