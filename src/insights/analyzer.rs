use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Alert, SensorReading};

/// Capability the insights engine consumes. Implementations receive the
/// analysis window oldest-first and return already-normalized alerts.
#[async_trait]
pub trait AlertAnalyzer: Send + Sync {
    async fn analyze(&self, readings: &[SensorReading]) -> Result<Vec<Alert>>;

    /// Free-form identifier recorded in the snapshot, e.g. `"openai"`.
    fn source(&self) -> &str;
}
