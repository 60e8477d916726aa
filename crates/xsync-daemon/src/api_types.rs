//! Request and response types for the `xsync-daemon` HTTP surface.
//!
//! `Serialize + Deserialize` so Axum can JSON-encode/decode them directly.
//! No business logic lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Body for every failed handler — wraps whatever `anyhow::Error` the
/// `Engine` call produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunManualRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunInitialRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkReauthRequest {
    pub reason: String,
}

/// §6: `ResolveConnectionStatus(userId) -> {sor, grid}`, JSON shape.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatusResponse {
    pub sor: xsync_schemas::ConnStatus,
    pub grid: xsync_schemas::ConnStatus,
}
