//! Persistence capabilities.
//!
//! Handlers and background loops depend on these traits rather than on a
//! concrete database, and feature-detect the optional capabilities (range
//! queries, snapshot persistence, ops events) at wiring time.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{InsightsSnapshot, OpsEvent, SensorReading};

/// Default and ceiling for `latest` queries.
pub const DEFAULT_LATEST_LIMIT: i64 = 100;
/// Defaults and bounds for ops event queries.
pub const DEFAULT_OPS_EVENTS_LIMIT: i64 = 30;
pub const MAX_OPS_EVENTS_LIMIT: i64 = 200;

/// Durable reading persistence.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn add(&self, reading: &SensorReading) -> Result<()>;

    /// Atomic: either every reading in the batch commits or none does.
    /// Insertion order matches slice order.
    async fn add_batch(&self, readings: &[SensorReading]) -> Result<()>;

    /// Up to `limit` most recently inserted readings, returned oldest-first.
    /// Non-positive limits fall back to [`DEFAULT_LATEST_LIMIT`].
    async fn latest(&self, limit: i64) -> Result<Vec<SensorReading>>;

    /// Delete at most `batch_limit` readings with `timestamp <
    /// cutoff_timestamp`; returns how many rows went away.
    async fn delete_older_than(&self, cutoff_timestamp: i64, batch_limit: i64) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    /// Range queries are an optional capability; stores that lack it
    /// return `None` and the HTTP layer answers 501.
    fn range_support(&self) -> Option<&dyn ReadingRangeStore> {
        None
    }
}

/// Optional time-range query capability.
#[async_trait]
pub trait ReadingRangeStore: Send + Sync {
    /// Readings in the half-open interval `[from, to)`, ascending by
    /// timestamp, at most `max_points` of them.
    async fn range(&self, from: i64, to: i64, max_points: i64) -> Result<Vec<SensorReading>>;
}

/// Singleton insights snapshot persistence.
#[async_trait]
pub trait InsightsSnapshotStore: Send + Sync {
    /// Upsert on the singleton key.
    async fn save_insights_snapshot(&self, snapshot: &InsightsSnapshot) -> Result<()>;

    /// `None` when no snapshot has ever been persisted; not an error.
    async fn latest_insights_snapshot(&self) -> Result<Option<InsightsSnapshot>>;
}

/// Append-only operations event log.
#[async_trait]
pub trait OpsEventStore: Send + Sync {
    /// The store assigns the event id; the caller's `id` field is ignored.
    async fn add_ops_event(&self, event: &OpsEvent) -> Result<()>;

    /// Most recent events first, bounded to 1..=[`MAX_OPS_EVENTS_LIMIT`].
    async fn latest_ops_events(&self, limit: i64) -> Result<Vec<OpsEvent>>;
}

pub(crate) fn clamp_ops_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_OPS_EVENTS_LIMIT
    } else {
        limit.min(MAX_OPS_EVENTS_LIMIT)
    }
}
