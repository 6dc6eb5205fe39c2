//! Durable cold tier.
//!
//! Holds promoted raw readings and per-bucket aggregates. Raw rows are
//! last-write-wins on `(device, ts)`. Every bucket a promotion touches is
//! rebuilt from the raw rows it covers, so late arrivals fold in and a
//! replayed promotion changes nothing.

use crate::aggregator::build_buckets;
use crate::errors::{Error, Result};
use crate::metrics::COLD_FAILURES_TOTAL;
use crate::model::{Metrics, SensorReading};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// One aggregated bucket of a device's readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRow {
    pub device_id: String,
    pub bucket_start: i64,
    pub bucket_width_ms: i64,
    /// Readings folded into the bucket.
    pub sample_count: i64,
    /// Arithmetic mean per metric.
    pub means: Metrics,
    /// Samples per metric; a metric may be missing from some readings.
    pub counts: BTreeMap<String, i64>,
}

#[async_trait]
pub trait ColdStore: Send + Sync {
    /// Upserts raw readings, then recomputes the named buckets from every
    /// stored raw row they cover. One transaction.
    async fn store_promotion(&self, raw: &[SensorReading], buckets: &[BucketRow]) -> Result<()>;

    /// Raw rows with `since <= ts <= until`, earliest first, at most `limit`.
    async fn raw_readings(
        &self,
        since: i64,
        until: i64,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SensorReading>>;

    /// Bucket rows starting in `[since, until]`, earliest first.
    async fn buckets(&self, since: i64, until: i64, device_id: Option<&str>) -> Result<Vec<BucketRow>>;
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Clone)]
pub struct PgColdStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    device_id: String,
    ts: i64,
    origin: String,
    metrics: Json<Metrics>,
}

#[derive(sqlx::FromRow)]
struct BucketDbRow {
    device_id: String,
    bucket_start: i64,
    bucket_width_ms: i64,
    sample_count: i64,
    means: Json<Metrics>,
    counts: Json<BTreeMap<String, i64>>,
}

impl PgColdStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn store_inner(&self, raw: &[SensorReading], buckets: &[BucketRow]) -> Result<()> {
        let device_ids: Vec<&str> = raw.iter().map(|r| r.device_id.as_str()).collect();
        let timestamps: Vec<i64> = raw.iter().map(|r| r.timestamp).collect();
        let origins: Vec<&str> = raw.iter().map(|r| r.origin.as_str()).collect();
        let metrics: Vec<String> = raw
            .iter()
            .map(|r| serde_json::to_string(&r.values))
            .collect::<std::result::Result<_, _>>()?;

        let bucket_devices: Vec<&str> = buckets.iter().map(|b| b.device_id.as_str()).collect();
        let starts: Vec<i64> = buckets.iter().map(|b| b.bucket_start).collect();
        let widths: Vec<i64> = buckets.iter().map(|b| b.bucket_width_ms).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO readings (device_id, ts, origin, metrics)
            SELECT d, t, o, m::jsonb
            FROM UNNEST($1::text[], $2::int8[], $3::text[], $4::text[]) AS u(d, t, o, m)
            ON CONFLICT (device_id, ts) DO UPDATE
            SET origin = EXCLUDED.origin, metrics = EXCLUDED.metrics, promoted_at = now()
            WHERE readings.metrics IS DISTINCT FROM EXCLUDED.metrics
            "#,
        )
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&origins)
        .bind(&metrics)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            WITH keys AS (
                SELECT DISTINCT d, s, w
                FROM UNNEST($1::text[], $2::int8[], $3::int8[]) AS u(d, s, w)
            ),
            members AS (
                SELECT k.d, k.s, k.w, r.metrics
                FROM keys k
                JOIN readings r ON r.device_id = k.d AND r.ts >= k.s AND r.ts < k.s + k.w
            ),
            per_metric AS (
                SELECT m.d, m.s, m.w, e.key AS metric, avg(e.value::float8) AS mean, count(*) AS n
                FROM members m, jsonb_each_text(m.metrics) AS e(key, value)
                GROUP BY m.d, m.s, m.w, e.key
            ),
            per_bucket AS (
                SELECT d, s, w, count(*) AS c FROM members GROUP BY d, s, w
            )
            INSERT INTO reading_buckets (device_id, bucket_start, bucket_width_ms, sample_count, means, counts)
            SELECT b.d, b.s, b.w, b.c,
                   COALESCE(jsonb_object_agg(p.metric, p.mean) FILTER (WHERE p.metric IS NOT NULL), '{}'::jsonb),
                   COALESCE(jsonb_object_agg(p.metric, p.n) FILTER (WHERE p.metric IS NOT NULL), '{}'::jsonb)
            FROM per_bucket b
            LEFT JOIN per_metric p ON p.d = b.d AND p.s = b.s AND p.w = b.w
            GROUP BY b.d, b.s, b.w, b.c
            ON CONFLICT (device_id, bucket_start, bucket_width_ms) DO UPDATE
            SET sample_count = EXCLUDED.sample_count, means = EXCLUDED.means, counts = EXCLUDED.counts
            "#,
        )
        .bind(&bucket_devices)
        .bind(&starts)
        .bind(&widths)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ColdStore for PgColdStore {
    async fn store_promotion(&self, raw: &[SensorReading], buckets: &[BucketRow]) -> Result<()> {
        if raw.is_empty() && buckets.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.store_inner(raw, buckets).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err)) => {
                    COLD_FAILURES_TOTAL.inc();
                    if attempts >= max_attempts || !is_transient_error(&db_err) {
                        error!(
                            "Cold tier write failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Cold tier write failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Cold tier write failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn raw_readings(
        &self,
        since: i64,
        until: i64,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SensorReading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT device_id, ts, origin, metrics
            FROM readings
            WHERE ts >= $1 AND ts <= $2 AND ($3::text IS NULL OR device_id = $3)
            ORDER BY ts ASC, device_id ASC
            LIMIT $4
            "#,
        )
        .bind(since)
        .bind(until)
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SensorReading {
                device_id: row.device_id,
                timestamp: row.ts,
                values: row.metrics.0,
                origin: row.origin,
            })
            .collect())
    }

    async fn buckets(&self, since: i64, until: i64, device_id: Option<&str>) -> Result<Vec<BucketRow>> {
        let rows = sqlx::query_as::<_, BucketDbRow>(
            r#"
            SELECT device_id, bucket_start, bucket_width_ms, sample_count, means, counts
            FROM reading_buckets
            WHERE bucket_start >= $1 AND bucket_start <= $2 AND ($3::text IS NULL OR device_id = $3)
            ORDER BY bucket_start ASC, device_id ASC
            "#,
        )
        .bind(since)
        .bind(until)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BucketRow {
                device_id: row.device_id,
                bucket_start: row.bucket_start,
                bucket_width_ms: row.bucket_width_ms,
                sample_count: row.sample_count,
                means: row.means.0,
                counts: row.counts.0,
            })
            .collect())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

/// In-process cold tier for development and tests. Same upsert and rebuild
/// semantics as the Postgres store, no durability.
#[derive(Default)]
pub struct MemoryColdStore {
    readings: Mutex<BTreeMap<(i64, String), SensorReading>>,
    buckets: Mutex<BTreeMap<(i64, String, i64), BucketRow>>,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.lock().len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    async fn store_promotion(&self, raw: &[SensorReading], buckets: &[BucketRow]) -> Result<()> {
        let mut readings = self.readings.lock();
        let mut stored = self.buckets.lock();
        for reading in raw {
            readings.insert((reading.timestamp, reading.device_id.clone()), reading.clone());
        }
        for bucket in buckets {
            let start = bucket.bucket_start;
            let width = bucket.bucket_width_ms;
            let members = readings
                .range((start, String::new())..(start + width, String::new()))
                .map(|(_, r)| r)
                .filter(|r| r.device_id == bucket.device_id);
            if let Some(row) = build_buckets(members, width).into_iter().next() {
                stored.insert((start, bucket.device_id.clone(), width), row);
            }
        }
        Ok(())
    }

    async fn raw_readings(
        &self,
        since: i64,
        until: i64,
        device_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SensorReading>> {
        Ok(self
            .readings
            .lock()
            .range((since, String::new())..)
            .take_while(|((ts, _), _)| *ts <= until)
            .filter(|(_, r)| device_id.map_or(true, |d| r.device_id == d))
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn buckets(&self, since: i64, until: i64, device_id: Option<&str>) -> Result<Vec<BucketRow>> {
        Ok(self
            .buckets
            .lock()
            .range((since, String::new(), i64::MIN)..)
            .take_while(|((start, _, _), _)| *start <= until)
            .filter(|(_, b)| device_id.map_or(true, |d| b.device_id == d))
            .map(|(_, b)| b.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device_id: &str, timestamp: i64, value: f64) -> SensorReading {
        let mut values = Metrics::new();
        values.insert("temperature".to_string(), value);
        SensorReading {
            device_id: device_id.to_string(),
            timestamp,
            values,
            origin: "test".to_string(),
        }
    }

    fn bucket(device_id: &str, start: i64, mean: f64) -> BucketRow {
        let mut means = Metrics::new();
        means.insert("temperature".to_string(), mean);
        let mut counts = BTreeMap::new();
        counts.insert("temperature".to_string(), 1);
        BucketRow {
            device_id: device_id.to_string(),
            bucket_start: start,
            bucket_width_ms: 300_000,
            sample_count: 1,
            means,
            counts,
        }
    }

    #[tokio::test]
    async fn test_memory_store_latest_write_wins() {
        let store = MemoryColdStore::new();
        store
            .store_promotion(&[reading("a", 100, 1.0)], &[bucket("a", 0, 1.0)])
            .await
            .unwrap();
        store
            .store_promotion(&[reading("a", 100, 5.0)], &[bucket("a", 0, 5.0)])
            .await
            .unwrap();
        // Replay.
        store
            .store_promotion(&[reading("a", 100, 5.0)], &[bucket("a", 0, 5.0)])
            .await
            .unwrap();

        assert_eq!(store.reading_count(), 1);
        assert_eq!(store.bucket_count(), 1);
        let rows = store.buckets(0, 1000, None).await.unwrap();
        assert_eq!(rows[0].sample_count, 1);
        assert_eq!(rows[0].means["temperature"], 5.0);
    }

    #[tokio::test]
    async fn test_late_reading_is_folded_into_stored_bucket() {
        let store = MemoryColdStore::new();
        store
            .store_promotion(
                &[reading("a", 100, 10.0), reading("a", 200, 20.0), reading("b", 150, 99.0)],
                &[bucket("a", 0, 15.0), bucket("b", 0, 99.0)],
            )
            .await
            .unwrap();
        store
            .store_promotion(&[reading("a", 250, 60.0)], &[bucket("a", 0, 60.0)])
            .await
            .unwrap();

        let rows = store.buckets(0, 0, Some("a")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 3);
        assert_eq!(rows[0].counts["temperature"], 3);
        assert!((rows[0].means["temperature"] - 30.0).abs() < 1e-9);
        assert_eq!(store.buckets(0, 0, Some("b")).await.unwrap()[0].sample_count, 1);
    }

    #[tokio::test]
    async fn test_memory_store_range_and_limit() {
        let store = MemoryColdStore::new();
        let raw = vec![reading("a", 100, 1.0), reading("b", 200, 2.0), reading("a", 300, 3.0)];
        store.store_promotion(&raw, &[]).await.unwrap();

        let all = store.raw_readings(0, 1000, None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![100, 200, 300]);

        let limited = store.raw_readings(0, 1000, Some("a"), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].timestamp, 100);

        assert!(store.raw_readings(150, 250, Some("a"), 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }
}
