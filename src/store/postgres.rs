use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    postgres::PgPoolOptions,
    types::Json,
    PgPool, Row,
};

use crate::model::{Alert, InsightsSnapshot, OpsEvent, RecomputeTrigger, SensorReading};

use super::{
    clamp_ops_limit, InsightsSnapshotStore, OpsEventStore, ReadingRangeStore, ReadingStore,
    DEFAULT_LATEST_LIMIT,
};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

const INSERT_READING: &str = "\
INSERT INTO sensor_readings \
  (timestamp, temperature, pressure, humidity, oxidised, reduced, nh3, pm1, pm2, pm10) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

const READING_COLUMNS: &str =
    "timestamp, temperature, pressure, humidity, oxidised, reduced, nh3, pm1, pm2, pm10";

/// Postgres-backed store. Owns the connection pool; migrations run once at
/// startup and a failed migration fails startup.
pub struct PgStore {
    pool: PgPool,
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_reading<'q>(query: PgQuery<'q>, reading: &SensorReading) -> PgQuery<'q> {
    query
        .bind(reading.timestamp)
        .bind(reading.temperature)
        .bind(reading.pressure)
        .bind(reading.humidity)
        .bind(reading.oxidised)
        .bind(reading.reduced)
        .bind(reading.nh3)
        .bind(reading.pm1)
        .bind(reading.pm2)
        .bind(reading.pm10)
}

impl PgStore {
    pub async fn connect(database_url: &str, max_conns: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_conns.max(1))
            .connect(database_url)
            .await
            .with_context(|| format!("failed to connect to database {database_url:?}"))?;

        let store = Self { pool };
        store.ping().await.context("postgres ping failed")?;

        sqlx::migrate!("./migrations")
            .run(&store.pool)
            .await
            .context("schema migration failed")?;

        Ok(store)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn add(&self, reading: &SensorReading) -> Result<()> {
        bind_reading(sqlx::query(INSERT_READING), reading)
            .execute(&self.pool)
            .await
            .context("insert reading")?;
        Ok(())
    }

    async fn add_batch(&self, readings: &[SensorReading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("begin batch insert")?;
        for reading in readings {
            bind_reading(sqlx::query(INSERT_READING), reading)
                .execute(&mut *tx)
                .await
                .context("insert batch reading")?;
        }
        tx.commit().await.context("commit batch insert")?;
        Ok(())
    }

    async fn latest(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let limit = if limit <= 0 { DEFAULT_LATEST_LIMIT } else { limit };

        let query = format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings ORDER BY id DESC LIMIT $1"
        );
        let mut readings = sqlx::query_as::<_, SensorReading>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("load latest readings")?;

        // Selected newest-first for the index; callers want oldest-first.
        readings.reverse();
        Ok(readings)
    }

    async fn delete_older_than(&self, cutoff_timestamp: i64, batch_limit: i64) -> Result<u64> {
        let batch_limit = if batch_limit <= 0 { 1000 } else { batch_limit };

        let result = sqlx::query(
            "WITH expired AS ( \
               SELECT id FROM sensor_readings \
               WHERE timestamp < $1 \
               ORDER BY timestamp \
               LIMIT $2 \
             ) \
             DELETE FROM sensor_readings AS readings \
             USING expired \
             WHERE readings.id = expired.id",
        )
        .bind(cutoff_timestamp)
        .bind(batch_limit)
        .execute(&self.pool)
        .await
        .context("delete expired readings")?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .context("database ping timed out")?
            .context("database ping failed")?;
        Ok(())
    }

    fn range_support(&self) -> Option<&dyn ReadingRangeStore> {
        Some(self)
    }
}

#[async_trait]
impl ReadingRangeStore for PgStore {
    async fn range(&self, from: i64, to: i64, max_points: i64) -> Result<Vec<SensorReading>> {
        let query = format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings \
             WHERE timestamp >= $1 AND timestamp < $2 \
             ORDER BY timestamp ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, SensorReading>(&query)
            .bind(from)
            .bind(to)
            .bind(max_points)
            .fetch_all(&self.pool)
            .await
            .context("load readings range")
    }
}

#[async_trait]
impl InsightsSnapshotStore for PgStore {
    async fn save_insights_snapshot(&self, snapshot: &InsightsSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO insights_snapshots \
               (snapshot_key, insights, source, generated_at, analyzed_samples, analysis_limit, trigger) \
             VALUES ('latest', $1, $2, $3, $4, $5, $6) \
             ON CONFLICT (snapshot_key) DO UPDATE SET \
               insights = EXCLUDED.insights, \
               source = EXCLUDED.source, \
               generated_at = EXCLUDED.generated_at, \
               analyzed_samples = EXCLUDED.analyzed_samples, \
               analysis_limit = EXCLUDED.analysis_limit, \
               trigger = EXCLUDED.trigger, \
               updated_at = NOW()",
        )
        .bind(Json(&snapshot.insights))
        .bind(&snapshot.source)
        .bind(snapshot.generated_at)
        .bind(snapshot.analyzed_samples)
        .bind(snapshot.analysis_limit)
        .bind(snapshot.trigger.as_str())
        .execute(&self.pool)
        .await
        .context("save insights snapshot")?;
        Ok(())
    }

    async fn latest_insights_snapshot(&self) -> Result<Option<InsightsSnapshot>> {
        let row = sqlx::query(
            "SELECT insights, source, generated_at, analyzed_samples, analysis_limit, trigger \
             FROM insights_snapshots \
             WHERE snapshot_key = 'latest'",
        )
        .fetch_optional(&self.pool)
        .await
        .context("load insights snapshot")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let insights: Json<Vec<Alert>> = row.try_get("insights")?;
        let trigger: String = row.try_get("trigger")?;

        Ok(Some(InsightsSnapshot {
            insights: insights.0,
            source: row.try_get("source")?,
            generated_at: row.try_get("generated_at")?,
            analyzed_samples: row.try_get("analyzed_samples")?,
            analysis_limit: row.try_get("analysis_limit")?,
            trigger: RecomputeTrigger::parse(&trigger),
        }))
    }
}

#[async_trait]
impl OpsEventStore for PgStore {
    async fn add_ops_event(&self, event: &OpsEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO ops_events (timestamp, kind, title, detail) VALUES ($1, $2, $3, $4)",
        )
        .bind(event.timestamp)
        .bind(&event.kind)
        .bind(&event.title)
        .bind(&event.detail)
        .execute(&self.pool)
        .await
        .context("insert ops event")?;
        Ok(())
    }

    async fn latest_ops_events(&self, limit: i64) -> Result<Vec<OpsEvent>> {
        let limit = clamp_ops_limit(limit);

        let rows = sqlx::query(
            "SELECT id, timestamp, kind, title, detail \
             FROM ops_events \
             ORDER BY id DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("load ops events")?;

        rows.into_iter()
            .map(|row| {
                Ok(OpsEvent {
                    id: row.try_get("id")?,
                    timestamp: row.try_get("timestamp")?,
                    kind: row.try_get("kind")?,
                    title: row.try_get("title")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }
}
