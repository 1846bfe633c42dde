use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::{Alert, InsightsSnapshot, OpsEvent, RecomputeTrigger, SensorReading};

use super::errors::ApiError;

/// Query parameters for `GET /api/readings`. Raw strings, validated by
/// hand so the 400 messages match the API contract exactly.
#[derive(Debug, Default, Deserialize)]
pub struct ReadingsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<String>,
    pub max_points: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadingsResponse {
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpsEventsResponse {
    pub events: Vec<OpsEvent>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InsightsResponse {
    pub insights: Vec<Alert>,
    pub source: String,
    pub generated_at: i64,
    pub analyzed_samples: i64,
    pub analysis_limit: i64,
    pub trigger: RecomputeTrigger,
}

impl From<InsightsSnapshot> for InsightsResponse {
    fn from(snapshot: InsightsSnapshot) -> Self {
        Self {
            insights: snapshot.insights,
            source: snapshot.source,
            generated_at: snapshot.generated_at,
            analyzed_samples: snapshot.analyzed_samples,
            analysis_limit: snapshot.analysis_limit,
            trigger: snapshot.trigger,
        }
    }
}

/// Parse an optional positive bounded integer query parameter.
pub fn parse_limit(
    raw: Option<&str>,
    default: i64,
    max: i64,
    name: &str,
) -> Result<i64, ApiError> {
    let Some(text) = raw else {
        return Ok(default);
    };
    text.parse::<i64>()
        .ok()
        .filter(|value| (1..=max).contains(value))
        .ok_or_else(|| ApiError::BadRequest(format!("{name} must be between 1 and {max}")))
}

/// Parse a range bound. Dashboards send milliseconds while readings are
/// stored in unix seconds, so values at or past 10^12 are scaled down.
pub fn parse_range_timestamp(raw: &str, name: &str) -> Result<i64, ApiError> {
    let parsed: i64 = raw
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{name} must be a valid unix timestamp")))?;

    if parsed >= 1_000_000_000_000 {
        Ok(parsed / 1000)
    } else {
        Ok(parsed)
    }
}
