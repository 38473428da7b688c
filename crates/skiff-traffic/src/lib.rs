//! Traffic accounting.
//!
//! Agents submit batches of per-user counters; ingest is idempotent on
//! (node, batch id) so retried submissions cannot double-count. Aggregates
//! are always computed from the append-only samples — there is no mutable
//! running total anywhere. Timeline buckets align to calendar boundaries
//! in the configured service UTC offset.

#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, Duration, FixedOffset, LocalResult, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use skiff_proto::TrafficBatch;
use skiff_store::{Store, StoreError, TrafficSampleRecord};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    #[error("user '{0}' not found")]
    UserMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TrafficError>;

// ─── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TrafficOptions {
    /// How far in the past an agent-stamped sample may claim to be.
    pub tolerance: Duration,
    /// How far into the future (clock skew allowance).
    pub skew: Duration,
    /// Service time zone as a fixed UTC offset, for calendar bucketing.
    pub utc_offset_minutes: i32,
}

impl Default for TrafficOptions {
    fn default() -> Self {
        Self {
            tolerance: Duration::hours(1),
            skew: Duration::minutes(5),
            utc_offset_minutes: 0,
        }
    }
}

impl TrafficOptions {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }
}

// ─── Buckets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Hour,
    Day,
    Month,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub bucket_start: DateTime<Utc>,
    pub up_bytes: i64,
    pub down_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: u64,
    pub duplicate: bool,
}

// ─── Service ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TrafficIngest {
    store: Store,
    options: TrafficOptions,
}

impl TrafficIngest {
    pub fn new(store: Store, options: TrafficOptions) -> Self {
        Self { store, options }
    }

    /// Ingest one batch from an authenticated agent. A batch id already seen
    /// for this node writes nothing and reports `duplicate`.
    pub async fn ingest(&self, node_id: &str, batch: &TrafficBatch) -> Result<IngestOutcome> {
        let now = Utc::now();
        let samples: Vec<TrafficSampleRecord> = batch
            .samples
            .iter()
            .map(|s| TrafficSampleRecord {
                id: Uuid::new_v4().to_string(),
                user_id: s.user_id.clone(),
                node_id: node_id.to_string(),
                proxy_id: s.proxy_id.clone(),
                up_bytes: s.up_bytes as i64,
                down_bytes: s.down_bytes as i64,
                recorded_at: self.clamp_recorded_at(now, s.recorded_at),
            })
            .collect();

        let inserted = self
            .store
            .insert_traffic_batch(node_id, &batch.batch_id, &samples)
            .await?;
        if !inserted {
            warn!(node = %node_id, batch = %batch.batch_id, "duplicate traffic batch dropped");
            return Ok(IngestOutcome {
                accepted: 0,
                duplicate: true,
            });
        }
        debug!(node = %node_id, batch = %batch.batch_id, samples = samples.len(), "traffic batch ingested");
        Ok(IngestOutcome {
            accepted: samples.len() as u64,
            duplicate: false,
        })
    }

    /// Clamp an agent-stamped time into `[now − tolerance, now + skew]`.
    pub fn clamp_recorded_at(&self, now: DateTime<Utc>, recorded_at: DateTime<Utc>) -> DateTime<Utc> {
        let floor = now - self.options.tolerance;
        let ceil = now + self.options.skew;
        recorded_at.clamp(floor, ceil)
    }

    /// Authoritative per-user usage over `[t0, t1)`, computed on read.
    pub async fn usage_for_user(
        &self,
        user_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<u64> {
        let (up, down) = self.store.traffic_sum_for_user(user_id, t0, t1).await?;
        Ok((up + down).max(0) as u64)
    }

    /// Per-node usage over `[t0, t1)`.
    pub async fn usage_for_node(
        &self,
        node_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let (up, down) = self.store.traffic_sum_for_node(node_id, t0, t1).await?;
        Ok((up.max(0) as u64, down.max(0) as u64))
    }

    /// Ordered per-bucket sums for exactly one user. The user filter lives in
    /// the underlying query; crossing users here would be a contract
    /// violation, which the isolation tests fence.
    pub async fn timeline_by_user(
        &self,
        user_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<TimelineBucket>> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(TrafficError::UserMissing(user_id.to_string()));
        }

        let rows = self.store.traffic_rows_for_user(user_id, t0, t1).await?;
        let mut buckets: Vec<TimelineBucket> = Vec::new();
        for row in rows {
            let start = self.bucket_start(row.recorded_at, bucket);
            match buckets.last_mut() {
                Some(last) if last.bucket_start == start => {
                    last.up_bytes += row.up_bytes;
                    last.down_bytes += row.down_bytes;
                }
                _ => buckets.push(TimelineBucket {
                    bucket_start: start,
                    up_bytes: row.up_bytes,
                    down_bytes: row.down_bytes,
                }),
            }
        }
        Ok(buckets)
    }

    /// Start of the calendar bucket containing `t`, in the service offset.
    pub fn bucket_start(&self, t: DateTime<Utc>, bucket: Bucket) -> DateTime<Utc> {
        let offset = self.options.offset();
        let local = t.with_timezone(&offset);
        let date = local.date_naive();
        let naive = match bucket {
            Bucket::Hour => date
                .and_hms_opt(local.hour(), 0, 0)
                .unwrap_or_else(|| local.naive_local()),
            Bucket::Day => date.and_hms_opt(0, 0, 0).unwrap_or_else(|| local.naive_local()),
            Bucket::Month => date
                .with_day(1)
                .unwrap_or(date)
                .and_hms_opt(0, 0, 0)
                .unwrap_or_else(|| local.naive_local()),
        };
        match offset.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            // Fixed offsets never produce ambiguous locals; keep a sane
            // fallback anyway.
            _ => Utc.from_utc_datetime(&naive),
        }
    }
}
