//! Range queries over both storage tiers.
//!
//! Both tiers are always consulted. Promotion deletes what it writes to the
//! cold tier, so the same instant normally lives in exactly one of them. When
//! the hot tier still holds a key the cold tier already has (an overwrite that
//! raced a flush), the hot reading wins in both raw and bucketed answers.

use crate::aggregator::bucket_start;
use crate::db::{BucketRow, ColdStore};
use crate::errors::{Error, Result};
use crate::hot::HotTier;
use crate::model::{Metrics, SensorReading};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub const MAX_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub since: i64,
    pub until: i64,
    pub limit: usize,
    pub device_id: Option<String>,
    pub bucket_width_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// Earliest points were dropped.
    KeepLatest,
    /// Latest points were dropped.
    KeepEarliest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub ts: i64,
    pub device_id: String,
    pub values: Metrics,
    pub hot_samples: i64,
    pub cold_samples: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAnswer {
    pub points: Vec<HistoryPoint>,
    pub hot_samples: i64,
    pub cold_samples: i64,
    pub bucket_width_ms: Option<i64>,
    pub truncated: bool,
    pub truncation: Truncation,
}

pub struct HistoryEngine {
    hot: Arc<HotTier>,
    cold: Arc<dyn ColdStore>,
    promotion_width_ms: i64,
}

#[derive(Default)]
struct Acc {
    sums: BTreeMap<String, (f64, i64)>,
    hot: i64,
    cold: i64,
}

impl Acc {
    fn add(&mut self, values: &Metrics, sign: f64) {
        for (metric, value) in values {
            let slot = self.sums.entry(metric.clone()).or_insert((0.0, 0));
            slot.0 += sign * value;
            slot.1 += sign as i64;
        }
    }
}

impl HistoryEngine {
    /// `promotion_width_ms` is the bucket width the aggregator writes.
    pub fn new(hot: Arc<HotTier>, cold: Arc<dyn ColdStore>, promotion_width_ms: i64) -> Self {
        Self {
            hot,
            cold,
            promotion_width_ms,
        }
    }

    pub async fn answer(&self, query: &HistoryQuery) -> Result<HistoryAnswer> {
        if query.since > query.until {
            return Err(Error::Validation(format!(
                "since {} is after until {}",
                query.since, query.until
            )));
        }
        if query.limit == 0 || query.limit > MAX_LIMIT {
            return Err(Error::Validation(format!(
                "limit must be within [1, {}]",
                MAX_LIMIT
            )));
        }

        match query.bucket_width_ms {
            Some(width) if width <= 0 => Err(Error::Validation(
                "bucket width must be positive".to_string(),
            )),
            Some(width) => self.bucketed(query, width).await,
            None => self.raw(query).await,
        }
    }

    async fn raw(&self, query: &HistoryQuery) -> Result<HistoryAnswer> {
        let device = query.device_id.as_deref();
        let hot = self.hot.range(query.since, query.until, device);
        let cold = self
            .cold
            .raw_readings(query.since, query.until, device, query.limit)
            .await?;

        let hot_keys: HashSet<(&str, i64)> =
            hot.iter().map(|r| (r.device_id.as_str(), r.timestamp)).collect();
        let mut points: Vec<HistoryPoint> = cold
            .iter()
            .filter(|r| !hot_keys.contains(&(r.device_id.as_str(), r.timestamp)))
            .map(|r| raw_point(r, 0, 1))
            .chain(hot.iter().map(|r| raw_point(r, 1, 0)))
            .collect();
        points.sort_by(|a, b| (a.ts, &a.device_id).cmp(&(b.ts, &b.device_id)));

        let truncated = points.len() > query.limit;
        points.truncate(query.limit);
        debug!(
            "History raw answer: {} hot, {} cold, {} returned",
            hot.len(),
            cold.len(),
            points.len()
        );

        Ok(finish(points, None, truncated, Truncation::KeepEarliest))
    }

    async fn bucketed(&self, query: &HistoryQuery, width: i64) -> Result<HistoryAnswer> {
        let device = query.device_id.as_deref();
        let promotion = self.promotion_width_ms;
        // Widen to whole buckets so the first bucket is not partially filled.
        let since = bucket_start(query.since, width);
        let hot = self.hot.range(since, query.until, device);
        // A cold row starting before `since` can still cover it.
        let cold: Vec<BucketRow> = self
            .cold
            .buckets(since - promotion + 1, query.until, device)
            .await?
            .into_iter()
            .filter(|row| row.bucket_start + row.bucket_width_ms > since)
            .collect();
        let cold_key = |device_id: &str, row_start: i64| {
            (bucket_start(row_start.max(since), width), device_id.to_string())
        };

        let mut grid: BTreeMap<(i64, String), Acc> = BTreeMap::new();
        for row in &cold {
            let acc = grid.entry(cold_key(&row.device_id, row.bucket_start)).or_default();
            acc.cold += row.sample_count;
            for (metric, mean) in &row.means {
                let n = row.counts.get(metric).copied().unwrap_or(row.sample_count);
                let slot = acc.sums.entry(metric.clone()).or_insert((0.0, 0));
                slot.0 += mean * n as f64;
                slot.1 += n;
            }
        }

        // Hot readings inside an already promoted bucket may shadow a cold raw row.
        let promoted: HashSet<(&str, i64)> = cold
            .iter()
            .map(|row| (row.device_id.as_str(), row.bucket_start))
            .collect();
        let mut shadowed = Vec::new();
        for reading in hot.iter().filter(|r| {
            promoted.contains(&(r.device_id.as_str(), bucket_start(r.timestamp, promotion)))
        }) {
            shadowed.extend(
                self.cold
                    .raw_readings(reading.timestamp, reading.timestamp, Some(&reading.device_id), 1)
                    .await?,
            );
        }
        for stale in &shadowed {
            let key = cold_key(&stale.device_id, bucket_start(stale.timestamp, promotion));
            if let Some(acc) = grid.get_mut(&key) {
                acc.cold -= 1;
                acc.add(&stale.values, -1.0);
            }
        }
        if !shadowed.is_empty() {
            debug!("{} cold readings shadowed by newer hot entries", shadowed.len());
        }

        for reading in &hot {
            let acc = grid
                .entry((bucket_start(reading.timestamp, width), reading.device_id.clone()))
                .or_default();
            acc.hot += 1;
            acc.add(&reading.values, 1.0);
        }

        let mut points: Vec<HistoryPoint> = grid
            .into_iter()
            .filter(|(_, acc)| acc.hot + acc.cold > 0)
            .map(|((ts, device_id), acc)| HistoryPoint {
                ts,
                device_id,
                values: acc
                    .sums
                    .into_iter()
                    .filter(|(_, (_, n))| *n > 0)
                    .map(|(m, (sum, n))| (m, sum / n as f64))
                    .collect(),
                hot_samples: acc.hot,
                cold_samples: acc.cold,
            })
            .collect();

        let truncated = points.len() > query.limit;
        if truncated {
            points.drain(..points.len() - query.limit);
        }

        Ok(finish(points, Some(width), truncated, Truncation::KeepLatest))
    }
}

fn raw_point(reading: &SensorReading, hot: i64, cold: i64) -> HistoryPoint {
    HistoryPoint {
        ts: reading.timestamp,
        device_id: reading.device_id.clone(),
        values: reading.values.clone(),
        hot_samples: hot,
        cold_samples: cold,
    }
}

fn finish(
    points: Vec<HistoryPoint>,
    bucket_width_ms: Option<i64>,
    truncated: bool,
    truncation: Truncation,
) -> HistoryAnswer {
    HistoryAnswer {
        hot_samples: points.iter().map(|p| p.hot_samples).sum(),
        cold_samples: points.iter().map(|p| p.cold_samples).sum(),
        points,
        bucket_width_ms,
        truncated,
        truncation,
    }
}
