use std::{sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::{
    model::{InsightsSnapshot, RecomputeTrigger, SensorReading},
    store::{InsightsSnapshotStore, ReadingStore},
};

use super::{AlertAnalyzer, InsightsConfig, MAX_INSIGHTS};

const SNAPSHOT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the single "latest insights" snapshot and the recompute schedule.
///
/// Recomputes are serialized: at most one analyzer call is in flight, and
/// any number of triggers that arrive during one collapse into exactly one
/// follow-up run (`running` → `running+pending` → one more run).
///
/// Cloning shares the engine; all clones observe the same snapshot.
#[derive(Clone)]
pub struct InsightsEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn ReadingStore>,
    snapshot_store: Option<Arc<dyn InsightsSnapshotStore>>,
    analyzer: Arc<dyn AlertAnalyzer>,
    config: InsightsConfig,
    snapshot: RwLock<Option<InsightsSnapshot>>,
    scheduler: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    last_reading: Option<SensorReading>,
    last_event_trigger: Option<Instant>,
    running: bool,
    pending: bool,
}

impl InsightsEngine {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        snapshot_store: Option<Arc<dyn InsightsSnapshotStore>>,
        analyzer: Arc<dyn AlertAnalyzer>,
        config: InsightsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                snapshot_store,
                analyzer,
                config: config.sanitized(),
                snapshot: RwLock::new(None),
                scheduler: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Restore any persisted snapshot, kick off the startup recompute, and
    /// spawn the interval ticker.
    pub async fn start(&self) {
        self.restore_snapshot().await;
        self.request_recompute(RecomputeTrigger::Startup);

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(engine.inner.config.refresh_interval);
            // The first tick of a tokio interval completes immediately;
            // the startup recompute already covers it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.request_recompute(RecomputeTrigger::Interval);
            }
        });
    }

    /// A defensive copy of the current snapshot with its insights truncated
    /// to `limit`, or `None` while warming up.
    pub fn snapshot(&self, limit: usize) -> Option<InsightsSnapshot> {
        let mut snapshot = self.inner.snapshot.read().clone()?;
        if limit > 0 && snapshot.insights.len() > limit {
            snapshot.insights.truncate(limit);
        }
        Some(snapshot)
    }

    pub fn on_reading(&self, reading: &SensorReading) {
        if self.should_trigger(reading) {
            self.request_recompute(RecomputeTrigger::Event);
        }
    }

    pub fn on_batch(&self, readings: &[SensorReading]) {
        for reading in readings {
            if self.should_trigger(reading) {
                self.request_recompute(RecomputeTrigger::Event);
                return;
            }
        }
    }

    /// Compare `reading` against the previous one and decide whether it
    /// warrants an event-driven recompute. The first reading only seeds the
    /// comparison state; event triggers are throttled by
    /// `event_min_interval`.
    fn should_trigger(&self, reading: &SensorReading) -> bool {
        let now = Instant::now();
        let config = &self.inner.config;
        let mut state = self.inner.scheduler.lock();

        let Some(previous) = state.last_reading.replace(*reading) else {
            return false;
        };

        let pm2_crossed = previous.pm2 < config.pm2_threshold && reading.pm2 >= config.pm2_threshold;
        let pm10_crossed =
            previous.pm10 < config.pm10_threshold && reading.pm10 >= config.pm10_threshold;
        let pm2_jumped = (reading.pm2 - previous.pm2).abs() >= config.pm2_delta_trigger;
        let pm10_jumped = (reading.pm10 - previous.pm10).abs() >= config.pm10_delta_trigger;

        if !(pm2_crossed || pm10_crossed || pm2_jumped || pm10_jumped) {
            return false;
        }

        if let Some(last) = state.last_event_trigger {
            if now.duration_since(last) < config.event_min_interval {
                return false;
            }
        }

        state.last_event_trigger = Some(now);
        true
    }

    fn request_recompute(&self, trigger: RecomputeTrigger) {
        {
            let mut state = self.inner.scheduler.lock();
            if state.running {
                state.pending = true;
                return;
            }
            state.running = true;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.recompute_loop(trigger).await;
        });
    }

    async fn recompute_loop(&self, first_trigger: RecomputeTrigger) {
        let mut trigger = first_trigger;
        loop {
            self.recompute(trigger).await;

            let follow_up = {
                let mut state = self.inner.scheduler.lock();
                if state.pending {
                    state.pending = false;
                    true
                } else {
                    state.running = false;
                    false
                }
            };

            if !follow_up {
                return;
            }
            trigger = RecomputeTrigger::Pending;
        }
    }

    async fn recompute(&self, trigger: RecomputeTrigger) {
        let config = &self.inner.config;

        let analyzed = time::timeout(config.analyze_timeout, async {
            let readings = self.inner.store.latest(config.analysis_limit).await?;
            let alerts = self.inner.analyzer.analyze(&readings).await?;
            anyhow::Ok((readings, alerts))
        })
        .await;

        let (readings, mut alerts) = match analyzed {
            Err(_) => {
                warn!(trigger = %trigger, "insights recompute timed out");
                return;
            }
            Ok(Err(error)) => {
                warn!(trigger = %trigger, error = %error, "insights recompute failed");
                return;
            }
            Ok(Ok(result)) => result,
        };

        alerts.truncate(config.max_alerts.min(MAX_INSIGHTS));

        let snapshot = InsightsSnapshot {
            insights: alerts,
            source: self.inner.analyzer.source().to_owned(),
            generated_at: Utc::now().timestamp_millis(),
            analyzed_samples: readings.len() as i64,
            analysis_limit: config.analysis_limit,
            trigger,
        };

        *self.inner.snapshot.write() = Some(snapshot.clone());

        // Persistence is best-effort; the in-memory snapshot stands even if
        // the write fails.
        if let Some(snapshot_store) = &self.inner.snapshot_store {
            match time::timeout(
                SNAPSHOT_SAVE_TIMEOUT,
                snapshot_store.save_insights_snapshot(&snapshot),
            )
            .await
            {
                Err(_) => warn!("insights snapshot persist timed out"),
                Ok(Err(error)) => warn!(error = %error, "insights snapshot persist failed"),
                Ok(Ok(())) => {}
            }
        }

        info!(
            trigger = %snapshot.trigger,
            samples = snapshot.analyzed_samples,
            insights = snapshot.insights.len(),
            "insights recomputed"
        );
    }

    async fn restore_snapshot(&self) {
        let Some(snapshot_store) = &self.inner.snapshot_store else {
            return;
        };

        match time::timeout(SNAPSHOT_LOAD_TIMEOUT, snapshot_store.latest_insights_snapshot()).await
        {
            Err(_) => warn!("insights snapshot load timed out"),
            Ok(Err(error)) => warn!(error = %error, "insights snapshot load failed"),
            Ok(Ok(None)) => {}
            Ok(Ok(Some(snapshot))) => {
                info!(
                    source = %snapshot.source,
                    generated_at = snapshot.generated_at,
                    "insights snapshot restored"
                );
                *self.inner.snapshot.write() = Some(snapshot);
            }
        }
    }
}
