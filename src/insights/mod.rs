//! AI-generated air-quality insights: the recompute engine, the analyzer
//! capability it consumes, and the OpenAI-backed production analyzer.

pub mod analyzer;
pub mod engine;
pub mod openai;

use std::time::Duration;

use serde::Deserialize;

use crate::model::{Alert, AlertKind, AlertSeverity};

pub use analyzer::AlertAnalyzer;
pub use engine::InsightsEngine;

/// Hard cap on insights per snapshot, regardless of configuration or what
/// the analyzer returns.
pub const MAX_INSIGHTS: usize = 3;

#[derive(Debug, Clone)]
pub struct InsightsConfig {
    pub analysis_limit: i64,
    pub refresh_interval: Duration,
    pub event_min_interval: Duration,
    pub pm2_threshold: f64,
    pub pm10_threshold: f64,
    pub pm2_delta_trigger: f64,
    pub pm10_delta_trigger: f64,
    pub analyze_timeout: Duration,
    pub max_alerts: usize,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            analysis_limit: 900,
            refresh_interval: Duration::from_secs(60 * 60),
            event_min_interval: Duration::from_secs(10 * 60),
            pm2_threshold: 8.0,
            pm10_threshold: 30.0,
            pm2_delta_trigger: 5.0,
            pm10_delta_trigger: 15.0,
            analyze_timeout: Duration::from_secs(15),
            max_alerts: MAX_INSIGHTS,
        }
    }
}

impl InsightsConfig {
    /// Clamp out-of-range values back to the defaults so a misconfigured
    /// deployment degrades instead of spinning or stalling.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.analysis_limit < 30 {
            self.analysis_limit = defaults.analysis_limit;
        }
        if self.refresh_interval < Duration::from_secs(60) {
            self.refresh_interval = defaults.refresh_interval;
        }
        if self.event_min_interval < Duration::from_secs(1) {
            self.event_min_interval = defaults.event_min_interval;
        }
        if self.pm2_threshold <= 0.0 {
            self.pm2_threshold = defaults.pm2_threshold;
        }
        if self.pm10_threshold <= 0.0 {
            self.pm10_threshold = defaults.pm10_threshold;
        }
        if self.pm2_delta_trigger <= 0.0 {
            self.pm2_delta_trigger = defaults.pm2_delta_trigger;
        }
        if self.pm10_delta_trigger <= 0.0 {
            self.pm10_delta_trigger = defaults.pm10_delta_trigger;
        }
        if self.analyze_timeout.is_zero() {
            self.analyze_timeout = defaults.analyze_timeout;
        }
        self.max_alerts = self.max_alerts.clamp(1, MAX_INSIGHTS);
        self
    }
}

/// Alert as produced by an analyzer before normalization; all fields are
/// free-form strings since they may come straight from a language model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAlert {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// Normalize analyzer output: lowercase/trim kind and severity, derive a
/// missing kind from severity, drop blank entries, enforce the length
/// limits, and cap the list at `max`.
pub fn normalize_alerts(raw: Vec<RawAlert>, max: usize) -> Vec<Alert> {
    let mut output = Vec::with_capacity(raw.len().min(max));

    for alert in raw {
        let kind = match alert.kind.trim().to_lowercase().as_str() {
            "alert" => Some(AlertKind::Alert),
            "insight" => Some(AlertKind::Insight),
            "tip" => Some(AlertKind::Tip),
            _ => None,
        };

        let severity = match alert.severity.trim().to_lowercase().as_str() {
            "critical" => AlertSeverity::Critical,
            "warn" => AlertSeverity::Warn,
            _ => AlertSeverity::Info,
        };

        let kind = kind.unwrap_or(match severity {
            AlertSeverity::Critical | AlertSeverity::Warn => AlertKind::Alert,
            AlertSeverity::Info => AlertKind::Insight,
        });

        let title = alert.title.trim();
        let message = alert.message.trim();
        if title.is_empty() || message.is_empty() {
            continue;
        }

        output.push(Alert {
            kind,
            severity,
            title: trim_to_chars(title, 60),
            message: trim_to_chars(message, 180),
        });

        if output.len() >= max {
            break;
        }
    }

    output
}

/// Truncate to at most `max_chars` characters, never splitting a
/// character, and strip trailing whitespace left by the cut.
pub(crate) fn trim_to_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_owned();
    }
    let truncated: String = input.chars().take(max_chars).collect();
    truncated.trim_end().to_owned()
}
