//! OpenAI-backed alert analyzer. Posts a compact telemetry summary to the
//! responses endpoint with a strict JSON schema and parses the reply.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{Alert, AlertKind, AlertSeverity, SensorReading};

use super::{normalize_alerts, trim_to_chars, AlertAnalyzer, RawAlert};

#[derive(Debug, Clone)]
pub struct OpenAiAnalyzer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_alerts: usize,
}

impl OpenAiAnalyzer {
    pub fn new(api_key: &str, model: &str, base_url: &str, max_alerts: usize) -> Self {
        let model = model.trim();
        let base_url = base_url.trim();

        Self {
            inner: Arc::new(Inner {
                // The per-call deadline is owned by the engine, which wraps
                // analyze() in a timeout.
                http: Client::new(),
                base_url: if base_url.is_empty() {
                    "https://api.openai.com/v1".to_owned()
                } else {
                    base_url.trim_end_matches('/').to_owned()
                },
                api_key: api_key.trim().to_owned(),
                model: if model.is_empty() {
                    "gpt-5-mini".to_owned()
                } else {
                    model.to_owned()
                },
                max_alerts: max_alerts.clamp(1, super::MAX_INSIGHTS),
            }),
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are an indoor air quality analyst. Return up to {} concise actionable insights \
             for a home environment. Include a mix of alert, insight, and tip when useful. \
             Use severities critical, warn, or info. Always return at least one insight. \
             If conditions are stable, return one concise info insight describing stable conditions. \
             Keep title under 60 characters and message under 180 characters.",
            self.inner.max_alerts
        )
    }

    fn alert_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["alerts"],
            "properties": {
                "alerts": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": self.inner.max_alerts,
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["kind", "severity", "title", "message"],
                        "properties": {
                            "kind": { "type": "string", "enum": ["alert", "insight", "tip"] },
                            "severity": { "type": "string", "enum": ["critical", "warn", "info"] },
                            "title": { "type": "string", "minLength": 3, "maxLength": 60 },
                            "message": { "type": "string", "minLength": 6, "maxLength": 180 }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl AlertAnalyzer for OpenAiAnalyzer {
    async fn analyze(&self, readings: &[SensorReading]) -> Result<Vec<Alert>> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }

        let summary =
            serde_json::to_string(&build_summary(readings)).context("serialize summary")?;

        let payload = json!({
            "model": self.inner.model,
            "input": [
                {
                    "role": "system",
                    "content": [{ "type": "input_text", "text": self.system_prompt() }]
                },
                {
                    "role": "user",
                    "content": [{
                        "type": "input_text",
                        "text": format!(
                            "Analyze this telemetry summary and return insights only as JSON.\n{summary}"
                        )
                    }]
                }
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "enviro_alerts",
                    "strict": true,
                    "schema": self.alert_schema()
                }
            }
        });

        let response = self
            .inner
            .http
            .post(format!("{}/responses", self.inner.base_url))
            .bearer_auth(&self.inner.api_key)
            .json(&payload)
            .send()
            .await
            .context("openai request failed")?;

        let status = response.status();
        let body = response.text().await.context("read openai response")?;
        if !status.is_success() {
            bail!("openai status {}: {}", status.as_u16(), body.trim());
        }

        let model_response: ModelResponse =
            serde_json::from_str(&body).context("decode openai response")?;
        let text = model_response
            .into_text()
            .ok_or_else(|| anyhow!("openai response did not include text output"))?;

        let envelope = parse_alert_envelope(&text)?;
        let alerts = normalize_alerts(envelope.alerts, self.inner.max_alerts);
        if alerts.is_empty() {
            return Ok(vec![stable_conditions_alert(readings)]);
        }

        Ok(alerts)
    }

    fn source(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    output_text: String,
    #[serde(default)]
    output: Vec<ModelOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelOutput {
    #[serde(default)]
    content: Vec<ModelContent>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelContent {
    #[serde(default, rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

impl ModelResponse {
    fn into_text(self) -> Option<String> {
        let direct = self.output_text.trim();
        if !direct.is_empty() {
            return Some(direct.to_owned());
        }

        for output in self.output {
            for content in output.content {
                if content.content_type == "output_text" || content.content_type == "text" {
                    let text = content.text.trim();
                    if !text.is_empty() {
                        return Some(text.to_owned());
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct AlertEnvelope {
    #[serde(default)]
    alerts: Vec<RawAlert>,
}

/// Parse the model's JSON reply, tolerating prose wrapped around the
/// object.
fn parse_alert_envelope(text: &str) -> Result<AlertEnvelope> {
    match serde_json::from_str(text) {
        Ok(envelope) => Ok(envelope),
        Err(original) => {
            let extracted =
                extract_json_object(text).ok_or_else(|| anyhow!("invalid alert payload: {original}"))?;
            serde_json::from_str(extracted)
                .map_err(|retry| anyhow!("invalid alert payload: {retry}"))
        }
    }
}

fn extract_json_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (start < end).then(|| &input[start..=end])
}

/// Insight returned when the model produced nothing usable, so consumers
/// always see at least one entry after a successful analysis.
fn stable_conditions_alert(readings: &[SensorReading]) -> Alert {
    let summary = build_summary(readings);
    let message = format!(
        "Air is stable. PM2.5 {:.1} ug/m3, PM10 {:.1} ug/m3, humidity {:.0}%, temperature {:.1}C.",
        summary.latest.pm2, summary.latest.pm10, summary.latest.humidity, summary.latest.temperature,
    );

    Alert {
        kind: AlertKind::Insight,
        severity: AlertSeverity::Info,
        title: "Air quality stable".to_owned(),
        message: trim_to_chars(&message, 180),
    }
}

/// Compact summary sent to the model: latest values, aggregates, and
/// short-window deltas per metric. Timestamps are treated as milliseconds.
#[derive(Debug, Serialize)]
struct TelemetrySummary {
    sample_count: usize,
    window_minutes: i64,
    latest_timestamp: i64,
    latest: MetricSnapshot,
    averages: MetricSnapshot,
    minimums: MetricSnapshot,
    maximums: MetricSnapshot,
    delta_10m: MetricSnapshot,
    delta_60m: MetricSnapshot,
}

#[derive(Debug, Serialize)]
struct MetricSnapshot {
    pm2: f64,
    pm10: f64,
    temperature: f64,
    humidity: f64,
}

fn build_summary(readings: &[SensorReading]) -> TelemetrySummary {
    let latest = readings[readings.len() - 1];
    let oldest = readings[0];
    let window_minutes = if latest.timestamp > oldest.timestamp {
        (latest.timestamp - oldest.timestamp) / 60_000
    } else {
        0
    };

    TelemetrySummary {
        sample_count: readings.len(),
        window_minutes,
        latest_timestamp: latest.timestamp,
        latest: MetricSnapshot {
            pm2: round1(latest.pm2),
            pm10: round1(latest.pm10),
            temperature: round1(latest.temperature),
            humidity: round1(latest.humidity),
        },
        averages: snapshot_of(readings, avg_metric),
        minimums: snapshot_of(readings, min_metric),
        maximums: snapshot_of(readings, max_metric),
        delta_10m: delta_snapshot(readings, 10),
        delta_60m: delta_snapshot(readings, 60),
    }
}

fn snapshot_of(
    readings: &[SensorReading],
    aggregate: fn(&[SensorReading], fn(&SensorReading) -> f64) -> f64,
) -> MetricSnapshot {
    MetricSnapshot {
        pm2: round1(aggregate(readings, |r| r.pm2)),
        pm10: round1(aggregate(readings, |r| r.pm10)),
        temperature: round1(aggregate(readings, |r| r.temperature)),
        humidity: round1(aggregate(readings, |r| r.humidity)),
    }
}

fn delta_snapshot(readings: &[SensorReading], minutes: i64) -> MetricSnapshot {
    MetricSnapshot {
        pm2: round1(delta_at_minutes(readings, minutes, |r| r.pm2)),
        pm10: round1(delta_at_minutes(readings, minutes, |r| r.pm10)),
        temperature: round1(delta_at_minutes(readings, minutes, |r| r.temperature)),
        humidity: round1(delta_at_minutes(readings, minutes, |r| r.humidity)),
    }
}

fn avg_metric(readings: &[SensorReading], metric: fn(&SensorReading) -> f64) -> f64 {
    if readings.is_empty() {
        return 0.0;
    }
    readings.iter().map(metric).sum::<f64>() / readings.len() as f64
}

fn min_metric(readings: &[SensorReading], metric: fn(&SensorReading) -> f64) -> f64 {
    if readings.is_empty() {
        return 0.0;
    }
    readings.iter().map(metric).fold(f64::INFINITY, f64::min)
}

fn max_metric(readings: &[SensorReading], metric: fn(&SensorReading) -> f64) -> f64 {
    if readings.is_empty() {
        return 0.0;
    }
    readings.iter().map(metric).fold(f64::NEG_INFINITY, f64::max)
}

/// Change of `metric` between the latest reading and the newest reading at
/// least `minutes` older than it.
fn delta_at_minutes(
    readings: &[SensorReading],
    minutes: i64,
    metric: fn(&SensorReading) -> f64,
) -> f64 {
    if readings.len() < 2 {
        return 0.0;
    }

    let latest = readings[readings.len() - 1];
    let target = latest.timestamp - minutes * 60 * 1000;
    let reference = readings
        .iter()
        .rev()
        .find(|candidate| candidate.timestamp <= target)
        .unwrap_or(&readings[0]);

    metric(&latest) - metric(reference)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
