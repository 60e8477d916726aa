//! Axum router and all HTTP handlers for `xsync-daemon`.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly. Route handlers only adapt HTTP
//! to `Engine` calls (§1: "the core exposes plain functions/methods") — no
//! business logic lives here.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    api_types::{
        ConnectionStatusResponse, ErrorResponse, HealthResponse, MarkReauthRequest,
        RunInitialRequest, RunManualRequest,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/sync-configs/:id/run-manual", post(run_manual))
        .route("/v1/sync-configs/:id/run-initial", post(run_initial))
        .route("/v1/run-scheduled", post(run_scheduled))
        .route("/v1/users/:id/connection-status", get(connection_status))
        .route(
            "/v1/users/:id/connections/:provider/mark-reauth",
            post(mark_reauth),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();
    let _ = st.bus.send(BusMsg::Status(snap.clone()));
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// POST /v1/sync-configs/:id/run-manual  — §6 RunManual
// ---------------------------------------------------------------------------

pub(crate) async fn run_manual(
    State(st): State<Arc<AppState>>,
    Path(sync_config_id): Path<Uuid>,
    Json(body): Json<RunManualRequest>,
) -> Response {
    let _ = st.bus.send(BusMsg::RunStarted { sync_config_id, triggered_by: "manual" });
    match st.engine.run_manual(sync_config_id, body.user_id).await {
        Ok(report) => {
            info!(%sync_config_id, status = ?report.status, "run-manual complete");
            let _ = st.bus.send(BusMsg::RunCompleted {
                sync_config_id,
                status: status_label(&report.status),
                records_synced: report.records_synced(),
            });
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/sync-configs/:id/run-initial  — §6 RunInitial
// ---------------------------------------------------------------------------

pub(crate) async fn run_initial(
    State(st): State<Arc<AppState>>,
    Path(sync_config_id): Path<Uuid>,
    Json(body): Json<RunInitialRequest>,
) -> Response {
    let _ = st.bus.send(BusMsg::RunStarted { sync_config_id, triggered_by: "initial" });
    match st.engine.run_initial(sync_config_id, body.user_id, body.dry_run).await {
        Ok(report) => {
            info!(%sync_config_id, status = ?report.status, dry_run = body.dry_run, "run-initial complete");
            let _ = st.bus.send(BusMsg::RunCompleted {
                sync_config_id,
                status: status_label(&report.status),
                records_synced: report.records_synced(),
            });
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/run-scheduled  — §6 RunScheduled (batch entry point)
// ---------------------------------------------------------------------------

pub(crate) async fn run_scheduled(State(st): State<Arc<AppState>>) -> Response {
    {
        let mut s = st.status.write().await;
        s.state = "scheduling".to_string();
    }
    let result = st.engine.run_scheduled().await;
    {
        let mut s = st.status.write().await;
        s.state = "idle".to_string();
        if let Ok(summary) = &result {
            s.last_scheduler_summary = Some(summary.clone());
        }
    }
    match result {
        Ok(summary) => {
            info!(?summary, "run-scheduled complete (manual trigger)");
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/users/:id/connection-status  — §6 ResolveConnectionStatus
// ---------------------------------------------------------------------------

pub(crate) async fn connection_status(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match st.engine.resolve_connection_status(user_id).await {
        Ok(pair) => (
            StatusCode::OK,
            Json(ConnectionStatusResponse { sor: pair.sor, grid: pair.grid }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/users/:id/connections/:provider/mark-reauth  — §6 MarkReauthRequired
// ---------------------------------------------------------------------------

pub(crate) async fn mark_reauth(
    State(st): State<Arc<AppState>>,
    Path((user_id, provider)): Path<(Uuid, String)>,
    Json(body): Json<MarkReauthRequest>,
) -> Response {
    let provider = match provider.as_str() {
        "sor" => xsync_schemas::Provider::Sor,
        "grid" => xsync_schemas::Provider::Grid,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse { error: format!("unknown provider '{other}'") }),
            )
                .into_response()
        }
    };

    match st.engine.mark_reauth_required(user_id, provider, &body.reason).await {
        Ok(()) => {
            let _ = st.bus.send(BusMsg::LogLine {
                level: "WARN".to_string(),
                msg: format!("{provider:?} connection for {user_id} marked needs_reauth: {}", body.reason),
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::RunStarted { .. } => "run_started",
                    BusMsg::RunCompleted { .. } => "run_completed",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

fn status_label(status: &xsync_schemas::SyncStatus) -> &'static str {
    match status {
        xsync_schemas::SyncStatus::Success => "success",
        xsync_schemas::SyncStatus::Partial => "partial",
        xsync_schemas::SyncStatus::Failed => "failed",
    }
}

/// Maps an `Engine` call's `anyhow::Error` to an HTTP response. The core
/// only distinguishes error kinds internally (§7); at the HTTP boundary
/// every failure surfaces as 500 with the error's display text, keeping
/// these handlers thin adapters over `Engine` rather than a second place
/// error kinds get interpreted (§1).
fn error_response(e: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() })).into_response()
}
