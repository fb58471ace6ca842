//! Host liveness endpoints.

use axum::{extract::State, Json};
use basalt_core::ModuleStatus;
use serde::Serialize;
use serde_json::json;

use super::ServerState;

/// Host status with the number of live modules.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub status: String,
    pub service: String,
    pub version: &'static str,
    pub uptime: u64,
    /// Modules currently enabled.
    pub modules: usize,
}

/// Basic health check handler (public endpoint).
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "basalt",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Uptime and enabled module count.
pub async fn health_status_handler(State(state): State<ServerState>) -> Json<HostStatus> {
    let uptime = chrono::Utc::now().timestamp() - state.started_at;

    Json(HostStatus {
        status: "healthy".to_string(),
        service: "basalt".to_string(),
        version: env!("CARGO_PKG_VERSION"),
        uptime: uptime.max(0) as u64,
        modules: state
            .registry
            .snapshot()
            .modules
            .values()
            .filter(|m| m.status == ModuleStatus::Enabled)
            .count(),
    })
}
