use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::api::{errors::ApiError, AppState};

/// Map size at which stale windows are compacted. A size threshold rather
/// than a timer, so the limiter needs no background task.
const CLEANUP_THRESHOLD: usize = 512;

/// Sliding fixed-window request counter keyed by client identity.
pub struct RequestLimiter {
    limit: u32,
    window: Duration,
    entries: Mutex<HashMap<String, RequestWindow>>,
}

#[derive(Clone, Copy)]
struct RequestWindow {
    start: Instant,
    count: u32,
}

impl RequestLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window: if window.is_zero() {
                Duration::from_secs(60)
            } else {
                window
            },
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request for `key` at `now`; returns false once the key
    /// has exhausted its window.
    pub fn allow(&self, key: &str, now: Instant) -> bool {
        let key = if key.is_empty() { "unknown" } else { key };

        let mut entries = self.entries.lock();
        let window = entries
            .get(key)
            .copied()
            .filter(|w| now.duration_since(w.start) < self.window)
            .unwrap_or(RequestWindow { start: now, count: 0 });

        if window.count >= self.limit {
            entries.insert(key.to_owned(), window);
            return false;
        }

        entries.insert(
            key.to_owned(),
            RequestWindow {
                start: window.start,
                count: window.count + 1,
            },
        );
        Self::cleanup(&mut entries, self.window, now);
        true
    }

    fn cleanup(entries: &mut HashMap<String, RequestWindow>, window: Duration, now: Instant) {
        if entries.len() < CLEANUP_THRESHOLD {
            return;
        }
        let expiry = window * 3;
        entries.retain(|_, w| now.duration_since(w.start) <= expiry);
    }
}

/// Resolve the identity a request is limited under: the first
/// `X-Forwarded-For` hop or `X-Real-IP` when proxy headers are trusted,
/// otherwise the peer address with the port stripped.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let first_hop = forwarded.split(',').next().unwrap_or("").trim();
            if !first_hop.is_empty() {
                return first_hop.to_owned();
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let trimmed = real_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Middleware guarding the read endpoints that serve dashboards.
pub async fn enforce_read_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(limiter) = state.read_limiter.as_ref() {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let identity = client_identity(request.headers(), peer, state.trust_proxy_headers);
        if !limiter.allow(&identity, Instant::now()) {
            return Err(ApiError::RateLimited);
        }
    }
    Ok(next.run(request).await)
}
