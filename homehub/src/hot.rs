//! Short-retention reading cache.
//!
//! Entries expire a fixed TTL after insertion. Each insert is stamped with a
//! sequence number so promotion can delete exactly what it scanned.

use crate::metrics::HOT_TIER_SIZE;
use crate::model::SensorReading;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HotKey {
    pub device_id: String,
    pub timestamp: i64,
}

impl HotKey {
    pub fn of(reading: &SensorReading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
        }
    }
}

struct HotEntry {
    reading: SensorReading,
    seq: u64,
    expires_at: Instant,
}

/// A reading as seen by one scan.
#[derive(Debug, Clone)]
pub struct Resident {
    pub key: HotKey,
    pub seq: u64,
    pub reading: SensorReading,
}

pub struct HotTier {
    entries: RwLock<BTreeMap<HotKey, HotEntry>>,
    ttl: Duration,
    next_seq: AtomicU64,
}

impl HotTier {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            ttl,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Stores a reading, replacing any reading with the same key.
    pub fn insert(&self, reading: SensorReading) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = HotEntry {
            reading,
            seq,
            expires_at: Instant::now() + self.ttl,
        };
        let mut entries = self.entries.write();
        entries.insert(HotKey::of(&entry.reading), entry);
        HOT_TIER_SIZE.set(entries.len() as f64);
        seq
    }

    /// Every live reading, in key order.
    pub fn scan(&self) -> Vec<Resident> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(key, e)| Resident {
                key: key.clone(),
                seq: e.seq,
                reading: e.reading.clone(),
            })
            .collect()
    }

    /// Deletes the scanned residents whose entry has not been replaced since.
    pub fn remove_scanned(&self, scanned: &[Resident]) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        for resident in scanned {
            if entries.get(&resident.key).is_some_and(|e| e.seq == resident.seq) {
                entries.remove(&resident.key);
                removed += 1;
            } else {
                debug!(
                    "Hot entry {}@{} changed during promotion, keeping it",
                    resident.key.device_id, resident.key.timestamp
                );
            }
        }
        HOT_TIER_SIZE.set(entries.len() as f64);
        removed
    }

    /// Live readings with `since <= ts <= until`, ordered by timestamp.
    pub fn range(&self, since: i64, until: i64, device_id: Option<&str>) -> Vec<SensorReading> {
        let now = Instant::now();
        let mut readings: Vec<SensorReading> = self
            .entries
            .read()
            .iter()
            .filter(|(key, e)| {
                e.expires_at > now
                    && key.timestamp >= since
                    && key.timestamp <= until
                    && device_id.map_or(true, |d| key.device_id == d)
            })
            .map(|(_, e)| e.reading.clone())
            .collect();
        readings.sort_by(|a, b| (a.timestamp, &a.device_id).cmp(&(b.timestamp, &b.device_id)));
        readings
    }

    /// Newest live reading of each device.
    pub fn latest_per_device(&self) -> Vec<SensorReading> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut latest: BTreeMap<&str, &SensorReading> = BTreeMap::new();
        for (key, e) in entries.iter().filter(|(_, e)| e.expires_at > now) {
            // Keys sort by timestamp within a device, so later wins.
            latest.insert(key.device_id.as_str(), &e.reading);
        }
        latest.into_values().cloned().collect()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        HOT_TIER_SIZE.set(entries.len() as f64);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
