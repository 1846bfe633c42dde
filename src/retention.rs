use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time;
use tracing::{error, info};

use crate::store::ReadingStore;

const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub retention_days: i64,
    pub batch_size: i64,
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 60,
            batch_size: 5000,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetentionConfig {
    pub fn sanitized(mut self) -> Self {
        if self.retention_days < 1 {
            self.retention_days = 60;
        }
        if self.batch_size < 1 {
            self.batch_size = 5000;
        }
        if self.interval < Duration::from_secs(60) {
            self.interval = Duration::from_secs(60);
        }
        self
    }
}

/// Deletes readings older than the retention cutoff in bounded batches.
pub struct RetentionWorker {
    store: Arc<dyn ReadingStore>,
    config: RetentionConfig,
}

impl RetentionWorker {
    pub fn new(store: Arc<dyn ReadingStore>, config: RetentionConfig) -> Self {
        Self {
            store,
            config: config.sanitized(),
        }
    }

    /// Runs one cleanup immediately, then on every interval tick.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self) {
        info!(
            days = self.config.retention_days,
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "retention cleanup enabled"
        );

        let mut ticker = time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            self.cleanup_once().await;
        }
    }

    /// Delete in batches until a pass comes back empty or fails; a failure
    /// abandons this pass and the next tick retries.
    pub async fn cleanup_once(&self) {
        let cutoff_timestamp =
            Utc::now().timestamp() - self.config.retention_days * 24 * 60 * 60;

        loop {
            let deleted = match time::timeout(
                DELETE_TIMEOUT,
                self.store
                    .delete_older_than(cutoff_timestamp, self.config.batch_size),
            )
            .await
            {
                Err(_) => {
                    error!("retention cleanup timed out");
                    return;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "retention cleanup failed");
                    return;
                }
                Ok(Ok(deleted)) => deleted,
            };

            if deleted == 0 {
                return;
            }

            info!(
                deleted,
                cutoff_timestamp, "retention cleanup deleted expired readings"
            );
        }
    }
}
