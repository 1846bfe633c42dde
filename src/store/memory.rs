//! In-memory store used by the test suite in place of Postgres. Implements
//! every store capability with the same observable contracts.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::{InsightsSnapshot, OpsEvent, SensorReading};

use super::{
    clamp_ops_limit, InsightsSnapshotStore, OpsEventStore, ReadingRangeStore, ReadingStore,
    DEFAULT_LATEST_LIMIT,
};

#[derive(Default)]
struct MemoryInner {
    readings: Mutex<Vec<SensorReading>>,
    snapshot: Mutex<Option<InsightsSnapshot>>,
    ops_events: Mutex<Vec<OpsEvent>>,
    next_ops_id: Mutex<i64>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    supports_range: bool,
    fail_ping: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            supports_range: true,
            ..Self::default()
        }
    }

    /// A store that reports no range capability, for exercising the 501
    /// path.
    pub fn without_range() -> Self {
        Self {
            supports_range: false,
            ..Self::default()
        }
    }

    pub fn with_failing_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    pub fn reading_count(&self) -> usize {
        self.inner.readings.lock().len()
    }

    pub fn ops_events(&self) -> Vec<OpsEvent> {
        self.inner.ops_events.lock().clone()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn add(&self, reading: &SensorReading) -> Result<()> {
        self.inner.readings.lock().push(*reading);
        Ok(())
    }

    async fn add_batch(&self, readings: &[SensorReading]) -> Result<()> {
        self.inner.readings.lock().extend_from_slice(readings);
        Ok(())
    }

    async fn latest(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let limit = if limit <= 0 { DEFAULT_LATEST_LIMIT } else { limit } as usize;
        let readings = self.inner.readings.lock();
        let start = readings.len().saturating_sub(limit);
        Ok(readings[start..].to_vec())
    }

    async fn delete_older_than(&self, cutoff_timestamp: i64, batch_limit: i64) -> Result<u64> {
        let batch_limit = if batch_limit <= 0 { 1000 } else { batch_limit } as usize;
        let mut readings = self.inner.readings.lock();

        let mut deleted = 0;
        readings.retain(|reading| {
            if deleted < batch_limit && reading.timestamp < cutoff_timestamp {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted as u64)
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_ping {
            bail!("store unavailable");
        }
        Ok(())
    }

    fn range_support(&self) -> Option<&dyn ReadingRangeStore> {
        self.supports_range.then_some(self as &dyn ReadingRangeStore)
    }
}

#[async_trait]
impl ReadingRangeStore for MemoryStore {
    async fn range(&self, from: i64, to: i64, max_points: i64) -> Result<Vec<SensorReading>> {
        let mut matched: Vec<SensorReading> = self
            .inner
            .readings
            .lock()
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .copied()
            .collect();
        matched.sort_by_key(|r| r.timestamp);
        matched.truncate(max_points.max(0) as usize);
        Ok(matched)
    }
}

#[async_trait]
impl InsightsSnapshotStore for MemoryStore {
    async fn save_insights_snapshot(&self, snapshot: &InsightsSnapshot) -> Result<()> {
        *self.inner.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn latest_insights_snapshot(&self) -> Result<Option<InsightsSnapshot>> {
        Ok(self.inner.snapshot.lock().clone())
    }
}

#[async_trait]
impl OpsEventStore for MemoryStore {
    async fn add_ops_event(&self, event: &OpsEvent) -> Result<()> {
        let mut next_id = self.inner.next_ops_id.lock();
        *next_id += 1;
        self.inner.ops_events.lock().push(OpsEvent {
            id: *next_id,
            ..event.clone()
        });
        Ok(())
    }

    async fn latest_ops_events(&self, limit: i64) -> Result<Vec<OpsEvent>> {
        let limit = clamp_ops_limit(limit) as usize;
        let events = self.inner.ops_events.lock();
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_reading(timestamp: i64) -> SensorReading {
        SensorReading {
            timestamp,
            temperature: 20.0,
            pressure: 101_300.0,
            humidity: 50.0,
            oxidised: 1.0,
            reduced: 1.0,
            nh3: 0.5,
            pm1: 1.0,
            pm2: 2.0,
            pm10: 3.0,
        }
    }

    #[tokio::test]
    async fn latest_returns_oldest_first() {
        let store = MemoryStore::new();
        for ts in [10, 20, 30] {
            store.add(&make_reading(ts)).await.unwrap();
        }
        let latest = store.latest(2).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, 20);
        assert_eq!(latest[1].timestamp, 30);
    }

    #[tokio::test]
    async fn range_is_half_open_and_ascending() {
        let store = MemoryStore::new();
        for ts in [30, 10, 20, 40] {
            store.add(&make_reading(ts)).await.unwrap();
        }
        let range = store.range(10, 40, 100).await.unwrap();
        let timestamps: Vec<i64> = range.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn delete_older_than_is_bounded() {
        let store = MemoryStore::new();
        for ts in [1, 2, 3, 100] {
            store.add(&make_reading(ts)).await.unwrap();
        }
        assert_eq!(store.delete_older_than(50, 2).await.unwrap(), 2);
        assert_eq!(store.delete_older_than(50, 2).await.unwrap(), 1);
        assert_eq!(store.delete_older_than(50, 2).await.unwrap(), 0);
        assert_eq!(store.reading_count(), 1);
    }

    #[tokio::test]
    async fn ops_events_are_returned_most_recent_first() {
        let store = MemoryStore::new();
        for kind in ["a", "b", "c"] {
            store
                .add_ops_event(&OpsEvent {
                    id: 0,
                    timestamp: 1,
                    kind: kind.to_owned(),
                    title: String::new(),
                    detail: String::new(),
                })
                .await
                .unwrap();
        }
        let events = store.latest_ops_events(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "c");
        assert_eq!(events[1].kind, "b");
    }
}
