//! Real-time fan-out to connected subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing walks the subscriber set
//! under one lock, so every subscriber sees deltas in publish order. A
//! subscriber whose queue is full or closed is dropped on the spot.

use crate::metrics::{SUBSCRIBERS, SUBSCRIBERS_DROPPED_TOTAL};
use crate::model::{ActuatorView, Command, Device, Event, SensorReading};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// State a late joiner receives before any delta.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub latest_readings: Vec<SensorReading>,
    pub devices: Vec<Device>,
    pub actuators: Vec<ActuatorView>,
    pub recent_events: Vec<Event>,
    pub recent_commands: Vec<Command>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    Snapshot(Snapshot),
    Telemetry { reading: SensorReading },
    Device { device: Device },
    Command { command: Command },
    Event { event: Event },
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<Delta>>,
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<Delta>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            // The snapshot always needs a slot.
            buffer: buffer.max(1),
        }
    }

    /// Registers a subscriber whose first message is the snapshot built by
    /// `snapshot`. The snapshot is taken while no delta can be published, so
    /// nothing falls between it and the first delta.
    pub fn subscribe<F>(&self, snapshot: F) -> Subscription
    where
        F: FnOnce() -> Snapshot,
    {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock();
        // Fresh channel with capacity >= 1 cannot be full.
        let _ = tx.try_send(Arc::new(Delta::Snapshot(snapshot())));
        subscribers.insert(id, tx);
        SUBSCRIBERS.set(subscribers.len() as f64);
        info!("Subscriber {} connected ({} total)", id, subscribers.len());

        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.remove(&id).is_some() {
            info!("Subscriber {} disconnected", id);
        }
        SUBSCRIBERS.set(subscribers.len() as f64);
    }

    /// Delivers `delta` to every subscriber. Returns the number reached.
    pub fn publish(&self, delta: Delta) -> usize {
        let delta = Arc::new(delta);
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return 0;
        }

        let mut dropped = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(delta.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", id);
                    dropped.push(*id);
                }
            }
        }

        for id in &dropped {
            subscribers.remove(id);
        }
        if !dropped.is_empty() {
            SUBSCRIBERS_DROPPED_TOTAL.inc_by(dropped.len() as f64);
        }
        SUBSCRIBERS.set(subscribers.len() as f64);
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
