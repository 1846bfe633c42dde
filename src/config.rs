use std::time::Duration;

use anyhow::{Context, Result};

use crate::{insights::InsightsConfig, ops::OpsConfig, retention::RetentionConfig};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ingest_api_key: String,
    pub database_url: String,
    pub pg_max_conns: u32,
    /// Comma list of exact origins, or `*` for any.
    pub cors_allow_origin: String,
    pub trust_proxy_headers: bool,
    /// Requests per minute on the read endpoints; 0 disables limiting.
    pub read_rate_limit_per_min: u32,
    /// Insights are enabled iff this is non-empty.
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub insights: InsightsConfig,
    pub ops: OpsConfig,
    pub retention: RetentionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let insights = InsightsConfig {
            analysis_limit: int_or("OPENAI_INSIGHTS_ANALYSIS_LIMIT", 900),
            refresh_interval: duration_or("OPENAI_INSIGHTS_REFRESH_INTERVAL", Duration::from_secs(3600))?,
            event_min_interval: duration_or("OPENAI_INSIGHTS_EVENT_MIN_INTERVAL", Duration::from_secs(600))?,
            pm2_threshold: float_or("OPENAI_INSIGHTS_PM2_TRIGGER", 8.0),
            pm10_threshold: float_or("OPENAI_INSIGHTS_PM10_TRIGGER", 30.0),
            pm2_delta_trigger: float_or("OPENAI_INSIGHTS_PM2_DELTA_TRIGGER", 5.0),
            pm10_delta_trigger: float_or("OPENAI_INSIGHTS_PM10_DELTA_TRIGGER", 15.0),
            analyze_timeout: duration_or("OPENAI_INSIGHTS_ANALYZE_TIMEOUT", Duration::from_secs(15))?,
            max_alerts: int_or("OPENAI_INSIGHTS_MAX", 3).clamp(1, 3) as usize,
        };

        let ops = OpsConfig {
            device_offline_timeout: duration_or("OPS_DEVICE_OFFLINE_TIMEOUT", Duration::from_secs(45))?,
            monitor_interval: duration_or("OPS_MONITOR_INTERVAL", Duration::from_secs(5))?,
        };

        let retention = RetentionConfig {
            enabled: bool_or("RETENTION_ENABLED", true),
            retention_days: int_or("RETENTION_DAYS", 60),
            batch_size: int_or("RETENTION_BATCH_SIZE", 5000),
            interval: duration_or("RETENTION_INTERVAL", Duration::from_secs(24 * 3600))?,
        };

        Ok(Self {
            port: optional("PORT", "8080")
                .parse()
                .context("PORT must be a valid port number")?,
            ingest_api_key: required("INGEST_API_KEY")?,
            database_url: required("DATABASE_URL")?,
            pg_max_conns: int_or("PG_MAX_CONNS", 10).max(1) as u32,
            cors_allow_origin: optional("CORS_ALLOW_ORIGIN", "*"),
            trust_proxy_headers: bool_or("TRUST_PROXY_HEADERS", false),
            read_rate_limit_per_min: int_or("READ_RATE_LIMIT_PER_MIN", 30).max(0) as u32,
            openai_api_key: optional("OPENAI_API_KEY", "").trim().to_owned(),
            openai_model: optional("OPENAI_INSIGHTS_MODEL", "gpt-5-mini"),
            openai_base_url: optional("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            insights,
            ops,
            retention,
        })
    }

    pub fn insights_enabled(&self) -> bool {
        !self.openai_api_key.is_empty()
    }

    /// Exact origins to echo, or `None` for `*`.
    pub fn allowed_origins(&self) -> Option<Vec<String>> {
        parse_allowed_origins(&self.cors_allow_origin)
    }

    pub fn log_config(&self) {
        tracing::info!(
            port = self.port,
            pg_max_conns = self.pg_max_conns,
            trust_proxy_headers = self.trust_proxy_headers,
            read_rate_limit_per_min = self.read_rate_limit_per_min,
            insights_enabled = self.insights_enabled(),
            retention_enabled = self.retention.enabled,
            "configuration loaded"
        );
    }
}

/// Parse a comma list of origins. Empty, blank, or any `*` entry means any
/// origin.
fn parse_allowed_origins(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return None;
    }

    let origins: Vec<String> = trimmed
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect();

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return None;
    }
    Some(origins)
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn required(key: &str) -> Result<String> {
    let value = std::env::var(key).unwrap_or_default();
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("missing required env var: {key}");
    }
    Ok(value.to_owned())
}

fn optional(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_owned(),
        _ => default.to_owned(),
    }
}

fn int_or(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn float_or(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn bool_or(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn duration_or(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => parse_duration(value.trim())
            .with_context(|| format!("{key} must be a duration like 45s, 10m, or 1h")),
        _ => Ok(default),
    }
}

/// Parse `"250ms"`, `"45s"`, `"10m"`, `"1h"`, or a bare number of seconds.
fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();

    let (number, unit): (&str, &str) = if let Some(stripped) = raw.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = raw.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = raw.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = raw.strip_suffix('h') {
        (stripped, "h")
    } else {
        (raw, "s")
    };

    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {raw:?}"))?;

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => Duration::from_secs(value),
    })
}
