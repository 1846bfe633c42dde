use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// One timestamped vector of sensor metrics, exactly as received from the
/// edge device.
///
/// `timestamp` is whatever unit the device sent (unix seconds or
/// milliseconds); readings are stored as received, and only range-query
/// bounds are normalized at the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, FromRow, ToSchema)]
pub struct SensorReading {
    pub timestamp: i64,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub oxidised: f64,
    pub reduced: f64,
    pub nh3: f64,
    pub pm1: f64,
    pub pm2: f64,
    pub pm10: f64,
}

/// Category of an insight produced by the alert analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Alert,
    Insight,
    Tip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warn,
    Info,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::Alert => "alert",
            AlertKind::Insight => "insight",
            AlertKind::Tip => "tip",
        };
        f.write_str(s)
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::Warn => "warn",
            AlertSeverity::Info => "info",
        };
        f.write_str(s)
    }
}

/// One element of an insights snapshot.
///
/// Title is at most 60 characters and message at most 180; both are
/// guaranteed non-blank by [`crate::insights::normalize_alerts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
}

/// What caused an insights recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeTrigger {
    Startup,
    Interval,
    Event,
    Pending,
}

impl RecomputeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecomputeTrigger::Startup => "startup",
            RecomputeTrigger::Interval => "interval",
            RecomputeTrigger::Event => "event",
            RecomputeTrigger::Pending => "pending",
        }
    }

    /// Parse a persisted trigger string; unknown values fall back to
    /// `Startup` so a restored snapshot never fails to load.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "interval" => RecomputeTrigger::Interval,
            "event" => RecomputeTrigger::Event,
            "pending" => RecomputeTrigger::Pending,
            _ => RecomputeTrigger::Startup,
        }
    }
}

impl fmt::Display for RecomputeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The latest computed insights payload, persisted as a singleton row and
/// overwritten in place on every successful recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsSnapshot {
    pub insights: Vec<Alert>,
    pub source: String,
    /// Milliseconds since the unix epoch.
    pub generated_at: i64,
    pub analyzed_samples: i64,
    pub analysis_limit: i64,
    pub trigger: RecomputeTrigger,
}

/// A persisted record of a backend-observed operational transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OpsEvent {
    /// Assigned by the store on insert.
    pub id: i64,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub kind: String,
    pub title: String,
    pub detail: String,
}

pub const OPS_KIND_DEVICE_CONNECTED: &str = "device_connected";
pub const OPS_KIND_DEVICE_DISCONNECTED: &str = "device_disconnected";
pub const OPS_KIND_BACKEND_RESTARTED: &str = "backend_restarted";
