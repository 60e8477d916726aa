//! Shared runtime state for `xsync-daemon`.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself
//! beyond the heartbeat/scheduler background tasks it spawns.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use xsync_runtime::{Engine, JobSummary};

/// Messages broadcast over the internal event bus and surfaced as SSE events
/// (SPEC_FULL §B), grounded on the same event-bus shape as the daemon's
/// original heartbeat/status broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    RunStarted { sync_config_id: Uuid, triggered_by: &'static str },
    RunCompleted { sync_config_id: Uuid, status: &'static str, records_synced: u64 },
    LogLine { level: String, msg: String },
}

/// Static build metadata included in health/status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot of daemon state, returned by `GET /v1/status` and
/// carried inside SSE `status` events.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    /// "idle" while no scheduler pass is running, "scheduling" mid-pass.
    pub state: String,
    pub last_scheduler_summary: Option<JobSummary>,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status = StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            state: "idle".to_string(),
            last_scheduler_summary: None,
        };

        Self {
            bus,
            build: BuildInfo { service: "xsync-daemon", version: env!("CARGO_PKG_VERSION") },
            status: Arc::new(RwLock::new(initial_status)),
            engine,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}

/// Spawns a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// §4.8/SPEC_FULL §B: drives `Engine::run_scheduled` on `poll_interval`,
/// stopping once `shutdown` fires so an in-flight pass finishes its current
/// batch before the process exits.
pub fn spawn_scheduler_loop(state: Arc<AppState>, poll_interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_one_pass(&state).await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("scheduler loop shutting down");
                    return;
                }
            }
        }
    });
}

async fn run_one_pass(state: &Arc<AppState>) {
    {
        let mut s = state.status.write().await;
        s.state = "scheduling".to_string();
        s.daemon_uptime_secs = uptime_secs();
    }

    let result = state.engine.run_scheduled().await;

    let mut s = state.status.write().await;
    s.state = "idle".to_string();
    s.daemon_uptime_secs = uptime_secs();
    match result {
        Ok(summary) => {
            tracing::info!(?summary, "scheduler pass complete");
            s.last_scheduler_summary = Some(summary);
        }
        Err(e) => {
            tracing::warn!(error = %e, "scheduler pass failed");
            let _ = state.bus.send(BusMsg::LogLine { level: "ERROR".to_string(), msg: format!("scheduler pass failed: {e}") });
        }
    }
    let _ = state.bus.send(BusMsg::Status(s.clone()));
}
