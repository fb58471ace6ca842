//! Extension administration handlers.
//!
//! Every handler here sits behind `require_admin`. They call the registry's
//! public API only; nothing reaches into module internals.

use axum::{
    extract::{Path, State},
    Json,
};
use basalt_core::extension::{
    ConfigOutcome, ExtensionFault, HealthStatus, MetricsSnapshot, MigrationRecord,
    MigrationReport, ModuleInfo, Template,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::common::{ok, HandlerResult};
use crate::models::error::ErrorResponse;
use crate::server::ServerState;

/// Module list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionSummaryDto {
    pub name: String,
    pub version: String,
    pub status: String,
    pub health: String,
    pub description: Option<String>,
    pub routes: usize,
    pub hooks: usize,
    pub last_error: Option<String>,
}

impl From<&ModuleInfo> for ExtensionSummaryDto {
    fn from(info: &ModuleInfo) -> Self {
        Self {
            name: info.name.clone(),
            version: info.version.to_string(),
            status: info.status.to_string(),
            health: info.health.to_string(),
            description: info.description.clone(),
            routes: info.routes.len(),
            hooks: info.hooks.len(),
            last_error: info.last_error.clone(),
        }
    }
}

/// Result of an enable/disable/config call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionActionDto {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollbackRequest {
    pub target: u32,
}

fn action(state: &ServerState, name: &str, config: Option<ConfigOutcome>) -> ExtensionActionDto {
    ExtensionActionDto {
        name: name.to_string(),
        status: state
            .registry
            .status(name)
            .map(|s| s.to_string())
            .unwrap_or_default(),
        config,
    }
}

fn require_module(state: &ServerState, name: &str) -> Result<ModuleInfo, ErrorResponse> {
    state
        .registry
        .get(name)
        .ok_or_else(|| ErrorResponse::not_found(format!("Module {}", name)))
}

/// GET /api/extensions
pub async fn list_extensions_handler(
    State(state): State<ServerState>,
) -> HandlerResult<Vec<ExtensionSummaryDto>> {
    let modules = state.registry.list();
    ok(modules.iter().map(ExtensionSummaryDto::from).collect())
}

/// GET /api/extensions/:name
pub async fn get_extension_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<ModuleInfo> {
    ok(require_module(&state, &name)?)
}

/// POST /api/extensions/:name/enable
pub async fn enable_extension_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<ExtensionActionDto> {
    state.registry.enable(&name).await?;
    info!(category = "extensions", module = %name, "Enabled via admin API");
    ok(action(&state, &name, None))
}

/// POST /api/extensions/:name/disable
pub async fn disable_extension_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<ExtensionActionDto> {
    state.registry.disable(&name).await?;
    info!(category = "extensions", module = %name, "Disabled via admin API");
    ok(action(&state, &name, None))
}

/// PUT /api/extensions/:name/config
///
/// Validated by the module; on rejection the last good config stays active.
pub async fn update_extension_config_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> HandlerResult<ExtensionActionDto> {
    let outcome = state.registry.apply_config(&name, config).await?;
    ok(action(&state, &name, Some(outcome)))
}

/// GET /api/extensions/:name/health
///
/// Runs a check now. The result is advisory and never changes the status.
pub async fn extension_health_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<HealthStatus> {
    ok(state.registry.check_health(&name).await?)
}

/// GET /api/extensions/:name/metrics
pub async fn extension_metrics_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<MetricsSnapshot> {
    require_module(&state, &name)?;
    let metrics = state
        .registry
        .metrics(&name)
        .ok_or_else(|| ErrorResponse::not_found(format!("Metrics for {}", name)))?;
    ok(metrics)
}

/// GET /api/extensions/:name/faults
pub async fn extension_faults_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<Vec<ExtensionFault>> {
    require_module(&state, &name)?;
    ok(state.registry.faults(&name))
}

/// GET /api/extensions/:name/migrations
pub async fn extension_migrations_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<Vec<MigrationRecord>> {
    ok(state.registry.migration_history(&name).await?)
}

/// POST /api/extensions/:name/migrations/rollback
pub async fn rollback_migrations_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> HandlerResult<MigrationReport> {
    let report = state
        .registry
        .rollback_migrations(&name, request.target)
        .await?;
    ok(report)
}

/// GET /api/extensions/:name/templates
pub async fn extension_templates_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> HandlerResult<Vec<Template>> {
    require_module(&state, &name)?;
    ok(state.registry.templates(&name))
}
