use crate::db::{BucketRow, ColdStore};
use crate::errors::Result;
use crate::hot::{HotTier, Resident};
use crate::metrics::{
    PROMOTION_FAILURES_TOTAL, PROMOTION_LATENCY_SECONDS, PROMOTION_RUNS_TOTAL,
    READINGS_PROMOTED_TOTAL,
};
use crate::model::{now_ms, SensorReading};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    pub buckets: usize,
    /// Readings left in the hot tier because their bucket is still open.
    pub open: usize,
}

/// Start of the bucket containing `ts`.
pub fn bucket_start(ts: i64, width_ms: i64) -> i64 {
    ts.div_euclid(width_ms) * width_ms
}

/// Folds readings into one row per (device, bucket) with per-metric means.
pub fn build_buckets<'a, I>(readings: I, width_ms: i64) -> Vec<BucketRow>
where
    I: IntoIterator<Item = &'a SensorReading>,
{
    #[derive(Default)]
    struct Acc {
        samples: i64,
        sums: BTreeMap<String, (f64, i64)>,
    }

    let mut groups: BTreeMap<(String, i64), Acc> = BTreeMap::new();
    for reading in readings {
        let acc = groups
            .entry((reading.device_id.clone(), bucket_start(reading.timestamp, width_ms)))
            .or_default();
        acc.samples += 1;
        for (metric, value) in &reading.values {
            let slot = acc.sums.entry(metric.clone()).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }

    groups
        .into_iter()
        .map(|((device_id, start), acc)| BucketRow {
            device_id,
            bucket_start: start,
            bucket_width_ms: width_ms,
            sample_count: acc.samples,
            means: acc
                .sums
                .iter()
                .map(|(m, (sum, n))| (m.clone(), sum / *n as f64))
                .collect(),
            counts: acc.sums.into_iter().map(|(m, (_, n))| (m, n)).collect(),
        })
        .collect()
}

/// One promotion cycle: moves every reading in a closed bucket to the cold
/// tier, then deletes exactly those entries from the hot tier. A failed cold
/// write leaves the hot tier untouched for the next cycle. Buckets that were
/// promoted before are rebuilt by the cold store, so late readings fold in.
pub async fn promote_once(
    hot: &HotTier,
    cold: &dyn ColdStore,
    width_ms: i64,
    now: i64,
) -> Result<PromotionReport> {
    let (closed, open): (Vec<Resident>, Vec<Resident>) = hot
        .scan()
        .into_iter()
        .partition(|r| bucket_start(r.reading.timestamp, width_ms) + width_ms <= now);

    if closed.is_empty() {
        debug!("Nothing to promote ({} readings in open buckets)", open.len());
        return Ok(PromotionReport {
            open: open.len(),
            ..PromotionReport::default()
        });
    }

    let readings: Vec<SensorReading> = closed.iter().map(|r| r.reading.clone()).collect();
    let buckets = build_buckets(&readings, width_ms);

    let start = Instant::now();
    flush(cold, &readings, &buckets).await?;
    PROMOTION_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

    let removed = hot.remove_scanned(&closed);
    READINGS_PROMOTED_TOTAL.inc_by(readings.len() as f64);
    info!(
        "Promoted {} readings into {} buckets ({} evicted, {} still open)",
        readings.len(),
        buckets.len(),
        removed,
        open.len()
    );

    Ok(PromotionReport {
        promoted: readings.len(),
        buckets: buckets.len(),
        open: open.len(),
    })
}

/// Single attempt per cycle; the cold store retries transient failures
/// itself and a failed cycle leaves everything hot for the next tick.
async fn flush(cold: &dyn ColdStore, readings: &[SensorReading], buckets: &[BucketRow]) -> Result<()> {
    if let Err(e) = cold.store_promotion(readings, buckets).await {
        error!(
            "Failed to flush promotion: {}. {} readings stay hot for the next cycle",
            e,
            readings.len()
        );
        PROMOTION_FAILURES_TOTAL.inc();
        return Err(e);
    }
    Ok(())
}

pub async fn run_aggregator(
    hot: Arc<HotTier>,
    cold: Arc<dyn ColdStore>,
    period: Duration,
    width_ms: i64,
) {
    info!(
        "Starting aggregator with interval={:?}, bucket_width_ms={}",
        period, width_ms
    );

    let mut ticker = interval(period);
    // Skip the immediate first tick; nothing has aged into a closed bucket yet.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        PROMOTION_RUNS_TOTAL.inc();

        let purged = hot.purge_expired();
        if purged > 0 {
            info!("Purged {} expired hot readings", purged);
        }

        if let Err(e) = promote_once(&hot, cold.as_ref(), width_ms, now_ms()).await {
            error!("Promotion cycle failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryColdStore;
    use crate::errors::Error;
    use crate::model::Metrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WIDTH: i64 = 300_000;

    fn reading(device_id: &str, timestamp: i64, metrics: &[(&str, f64)]) -> SensorReading {
        SensorReading {
            device_id: device_id.to_string(),
            timestamp,
            values: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect::<Metrics>(),
            origin: "test".to_string(),
        }
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ColdStore for FailingStore {
        async fn store_promotion(&self, _: &[SensorReading], _: &[BucketRow]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }

        async fn raw_readings(&self, _: i64, _: i64, _: Option<&str>, _: usize) -> Result<Vec<SensorReading>> {
            Ok(Vec::new())
        }

        async fn buckets(&self, _: i64, _: i64, _: Option<&str>) -> Result<Vec<BucketRow>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_bucket_start_handles_negative_timestamps() {
        assert_eq!(bucket_start(299_999, WIDTH), 0);
        assert_eq!(bucket_start(300_000, WIDTH), 300_000);
        assert_eq!(bucket_start(-1, WIDTH), -300_000);
    }

    #[test]
    fn test_two_readings_fold_into_one_bucket() {
        let readings = vec![
            reading("a", 100, &[("temperature", 20.0)]),
            reading("a", 200, &[("temperature", 23.0), ("humidity", 50.0)]),
        ];
        let buckets = build_buckets(&readings, WIDTH);

        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.sample_count, 2);
        assert!((bucket.means["temperature"] - 21.5).abs() < 1e-9);
        assert_eq!(bucket.means["humidity"], 50.0);
        assert_eq!(bucket.counts["humidity"], 1);
    }

    #[test]
    fn test_devices_bucket_separately() {
        let readings = vec![
            reading("a", 100, &[("t", 1.0)]),
            reading("b", 100, &[("t", 3.0)]),
            reading("a", WIDTH + 1, &[("t", 5.0)]),
        ];
        assert_eq!(build_buckets(&readings, WIDTH).len(), 3);
    }

    #[tokio::test]
    async fn test_promotion_moves_closed_buckets_only() {
        let hot = HotTier::new(Duration::from_secs(3600));
        let cold = MemoryColdStore::new();
        hot.insert(reading("a", 100, &[("temperature", 20.0)]));
        hot.insert(reading("a", 200, &[("temperature", 22.0)]));
        hot.insert(reading("a", WIDTH + 10, &[("temperature", 30.0)]));

        let report = promote_once(&hot, &cold, WIDTH, WIDTH + 20).await.unwrap();
        assert_eq!(report.promoted, 2);
        assert_eq!(report.buckets, 1);
        assert_eq!(report.open, 1);

        assert_eq!(hot.len(), 1);
        assert!(hot.range(0, WIDTH - 1, None).is_empty());
        let rows = cold.buckets(0, WIDTH, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 2);
        assert!((rows[0].means["temperature"] - 21.0).abs() < 1e-9);
        assert_eq!(cold.reading_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_hot_entries() {
        let hot = HotTier::new(Duration::from_secs(3600));
        let cold = FailingStore {
            calls: AtomicUsize::new(0),
        };
        hot.insert(reading("a", 100, &[("temperature", 20.0)]));

        assert!(promote_once(&hot, &cold, WIDTH, 10 * WIDTH).await.is_err());
        assert_eq!(cold.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hot.len(), 1);

        // Next cycle tries again.
        assert!(promote_once(&hot, &cold, WIDTH, 10 * WIDTH).await.is_err());
        assert_eq!(cold.calls.load(Ordering::SeqCst), 2);
        assert_eq!(hot.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_promotion_does_not_accumulate() {
        let hot = HotTier::new(Duration::from_secs(3600));
        let cold = MemoryColdStore::new();
        let r = reading("a", 100, &[("temperature", 20.0)]);

        hot.insert(r.clone());
        promote_once(&hot, &cold, WIDTH, WIDTH).await.unwrap();
        // Replayed promotion of the same reading.
        hot.insert(r);
        promote_once(&hot, &cold, WIDTH, WIDTH).await.unwrap();

        assert_eq!(cold.reading_count(), 1);
        assert_eq!(cold.bucket_count(), 1);
        assert_eq!(cold.buckets(0, 0, None).await.unwrap()[0].sample_count, 1);
    }

    #[tokio::test]
    async fn test_late_arrival_joins_promoted_bucket() {
        let hot = HotTier::new(Duration::from_secs(3600));
        let cold = MemoryColdStore::new();
        hot.insert(reading("a", 100, &[("temperature", 10.0)]));
        hot.insert(reading("a", 200, &[("temperature", 20.0)]));
        promote_once(&hot, &cold, WIDTH, WIDTH).await.unwrap();

        hot.insert(reading("a", 250, &[("temperature", 60.0)]));
        let report = promote_once(&hot, &cold, WIDTH, WIDTH + 1).await.unwrap();
        assert_eq!(report.promoted, 1);

        assert!(hot.is_empty());
        assert_eq!(cold.reading_count(), 3);
        let rows = cold.buckets(0, 0, Some("a")).await.unwrap();
        assert_eq!(rows[0].sample_count, 3);
        assert!((rows[0].means["temperature"] - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overwrite_during_flush_reaches_cold_next_cycle() {
        let hot = HotTier::new(Duration::from_secs(3600));
        let cold = MemoryColdStore::new();
        hot.insert(reading("a", 100, &[("temperature", 10.0)]));

        // A promotion cycle split around a concurrent overwrite.
        let scanned = hot.scan();
        let readings: Vec<SensorReading> = scanned.iter().map(|r| r.reading.clone()).collect();
        cold.store_promotion(&readings, &build_buckets(&readings, WIDTH))
            .await
            .unwrap();
        hot.insert(reading("a", 100, &[("temperature", 50.0)]));
        assert_eq!(hot.remove_scanned(&scanned), 0);

        promote_once(&hot, &cold, WIDTH, WIDTH).await.unwrap();
        assert!(hot.is_empty());
        let raw = cold.raw_readings(0, WIDTH, Some("a"), 10).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].values["temperature"], 50.0);
        let rows = cold.buckets(0, 0, Some("a")).await.unwrap();
        assert_eq!(rows[0].sample_count, 1);
        assert_eq!(rows[0].means["temperature"], 50.0);
    }
}
