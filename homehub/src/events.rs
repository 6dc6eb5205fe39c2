use crate::model::Event;
use parking_lot::RwLock;

/// Append-only audit trail.
#[derive(Default)]
pub struct EventLog {
    events: RwLock<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) -> Event {
        self.events.write().push(event.clone());
        event
    }

    /// The `n` most recently recorded events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let events = self.events.read();
        let start = events.len().saturating_sub(n);
        events[start..].to_vec()
    }

    pub fn range(&self, since: i64, until: i64) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp <= until)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}
