//! Device-liveness monitoring.
//!
//! The monitor is the sole owner of the device connectivity state. Ingest
//! arrivals mark the device connected; a ticker flips it to disconnected
//! once no telemetry has arrived for the configured timeout. Transitions
//! are persisted to the ops event log asynchronously; persistence failure
//! never rolls back the in-memory state.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::time;
use tracing::{info, warn};

use crate::{
    model::{
        OpsEvent, OPS_KIND_BACKEND_RESTARTED, OPS_KIND_DEVICE_CONNECTED,
        OPS_KIND_DEVICE_DISCONNECTED,
    },
    store::OpsEventStore,
};

const PERSIST_TIMEOUT: Duration = Duration::from_secs(3);
const INIT_TIMEOUT: Duration = Duration::from_secs(3);
/// How many recent events are scanned to seed the state at startup.
const INIT_SCAN_LIMIT: i64 = 20;

#[derive(Debug, Clone)]
pub struct OpsConfig {
    pub device_offline_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            device_offline_timeout: Duration::from_secs(45),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct DeviceState {
    known: bool,
    connected: bool,
    last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct OpsMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    store: Arc<dyn OpsEventStore>,
    config: OpsConfig,
    state: Mutex<DeviceState>,
}

impl OpsMonitor {
    /// Seed state from the most recent persisted events, record the
    /// restart, and start the disconnect ticker.
    pub async fn start(store: Arc<dyn OpsEventStore>, config: OpsConfig) -> Self {
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                store,
                config,
                state: Mutex::new(DeviceState::default()),
            }),
        };

        monitor.initialize_state().await;
        monitor.persist_event(
            OPS_KIND_BACKEND_RESTARTED,
            "Backend restarted",
            "Ops event monitoring is active.",
            Utc::now().timestamp_millis(),
        );

        if !monitor.inner.config.device_offline_timeout.is_zero()
            && !monitor.inner.config.monitor_interval.is_zero()
        {
            let ticker_monitor = monitor.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(ticker_monitor.inner.config.monitor_interval);
                loop {
                    ticker.tick().await;
                    ticker_monitor.evaluate_disconnect(Utc::now());
                }
            });
        }

        monitor
    }

    /// Called on every ingest arrival. Emits `device_connected` iff the
    /// device was not already known to be connected.
    pub fn on_ingest(&self, observed_at: DateTime<Utc>) {
        let should_log_connected = {
            let mut state = self.inner.state.lock();
            let newly_connected = !state.known || !state.connected;
            state.known = true;
            state.connected = true;
            state.last_seen_at = Some(observed_at);
            newly_connected
        };

        if should_log_connected {
            self.persist_event(
                OPS_KIND_DEVICE_CONNECTED,
                "Device connected",
                "Telemetry ingest resumed.",
                observed_at.timestamp_millis(),
            );
        }
    }

    fn evaluate_disconnect(&self, now: DateTime<Utc>) {
        let timeout = self.inner.config.device_offline_timeout;

        let should_log_disconnected = {
            let mut state = self.inner.state.lock();
            let expired = state.known
                && state.connected
                && state.last_seen_at.is_some_and(|seen| {
                    now.signed_duration_since(seen)
                        .to_std()
                        .is_ok_and(|elapsed| elapsed >= timeout)
                });
            if expired {
                state.connected = false;
            }
            expired
        };

        if should_log_disconnected {
            self.persist_event(
                OPS_KIND_DEVICE_DISCONNECTED,
                "Device disconnected",
                &format!("No telemetry received for {timeout:?}."),
                now.timestamp_millis(),
            );
        }
    }

    /// Adopt the newest connect/disconnect event, if any, so a restart does
    /// not re-announce an already-connected device.
    async fn initialize_state(&self) {
        let events = match time::timeout(
            INIT_TIMEOUT,
            self.inner.store.latest_ops_events(INIT_SCAN_LIMIT),
        )
        .await
        {
            Err(_) => {
                warn!("ops state initialization timed out");
                return;
            }
            Ok(Err(error)) => {
                warn!(error = %error, "ops state initialization failed");
                return;
            }
            Ok(Ok(events)) => events,
        };

        for event in events {
            let connected = match event.kind.as_str() {
                OPS_KIND_DEVICE_CONNECTED => true,
                OPS_KIND_DEVICE_DISCONNECTED => false,
                _ => continue,
            };

            let mut state = self.inner.state.lock();
            state.known = true;
            state.connected = connected;
            state.last_seen_at = Utc.timestamp_millis_opt(event.timestamp).single();
            info!(connected, "device state restored from ops events");
            return;
        }
    }

    fn persist_event(&self, kind: &str, title: &str, detail: &str, timestamp: i64) {
        let store = Arc::clone(&self.inner.store);
        let event = OpsEvent {
            id: 0,
            timestamp,
            kind: kind.to_owned(),
            title: title.to_owned(),
            detail: detail.to_owned(),
        };

        tokio::spawn(async move {
            match time::timeout(PERSIST_TIMEOUT, store.add_ops_event(&event)).await {
                Err(_) => warn!(kind = %event.kind, "ops event persist timed out"),
                Ok(Err(error)) => {
                    warn!(kind = %event.kind, error = %error, "ops event persist failed");
                }
                Ok(Ok(())) => {}
            }
        });
    }
}
