//! The fixed capability set every module implements.
//!
//! Modules are compiled into the host and registered as values implementing
//! [`Extension`]. All methods take `&self`; a module keeps any mutable state
//! behind its own locks or atomics.
//!
//! Lifecycle callbacks (`initialize`, `start`, `stop`, `health`) are called by
//! the registry inside the fault isolation boundary with a deadline.
//! Declaration accessors (`routes`, `hooks`, `templates`, ...) are called
//! once per enable, after `initialize` succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::config_schema::ConfigSchema;
use super::hooks::HookRegistrar;
use super::migration::Migration;
use super::permission::Permission;
use super::routing::ModuleRouter;
use super::services::ExtensionServices;
use super::types::{ExtensionError, HealthReport, ModuleDescriptor, Result};

/// Deadline-carrying context for lifecycle callbacks.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    module: String,
    deadline: Instant,
}

impl LifecycleContext {
    pub fn new(module: impl Into<String>, timeout: Duration) -> Self {
        Self {
            module: module.into(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the registry gives up on the call.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// A named template a module contributes, e.g. an email body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub content: String,
}

impl Template {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A file served at `/<namespace>/<module>/static/<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAsset {
    pub path: String,
    pub content_type: String,
    pub body: Arc<[u8]>,
}

impl StaticAsset {
    pub fn new(path: impl Into<String>, content_type: impl Into<String>, body: &[u8]) -> Self {
        Self {
            path: path.into(),
            content_type: content_type.into(),
            body: Arc::from(body),
        }
    }

    /// Relative asset path: `/`-separated, no traversal.
    pub fn is_valid_path(path: &str) -> bool {
        !path.is_empty()
            && !path.starts_with('/')
            && path
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
    }
}

/// Default schema name for a module: `ext_<name>` with `-` mapped to `_`.
pub fn default_schema_name(module: &str) -> String {
    format!("ext_{}", module.replace('-', "_"))
}

/// Contract implemented by every module.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Static descriptor. Must return the same value on every call.
    fn descriptor(&self) -> ModuleDescriptor;

    /// One-time setup. Must fail fast and leave no side effects on error.
    /// The façade is the module's only access to host services.
    async fn initialize(&self, ctx: &LifecycleContext, services: ExtensionServices) -> Result<()>;

    async fn start(&self, _ctx: &LifecycleContext) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &LifecycleContext) -> Result<()> {
        Ok(())
    }

    /// Quick, non-blocking health probe. Advisory only.
    async fn health(&self, _ctx: &LifecycleContext) -> Result<HealthReport> {
        Ok(HealthReport::healthy())
    }

    /// Declare HTTP routes and middleware.
    fn routes(&self, _router: &mut ModuleRouter) {}

    /// Declare hook handlers.
    fn hooks(&self, _hooks: &mut HookRegistrar) {}

    fn templates(&self) -> Vec<Template> {
        Vec::new()
    }

    fn static_assets(&self) -> Vec<StaticAsset> {
        Vec::new()
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::any()
    }

    /// Defaults to checking `config_schema`.
    fn validate_config(&self, config: &Value) -> Result<()> {
        self.config_schema()
            .validate(config)
            .map_err(|e| ExtensionError::InvalidConfig(e.to_string()))
    }

    /// Apply a validated configuration to the running module. Must be
    /// idempotent for identical input.
    async fn apply_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    /// Name of the persisted schema this module owns.
    fn schema_name(&self) -> String {
        default_schema_name(&self.descriptor().name)
    }

    fn migrations(&self) -> Vec<Migration> {
        Vec::new()
    }

    fn permissions(&self) -> Vec<Permission> {
        Vec::new()
    }
}

/// Shared handle to a registered module.
pub type DynExtension = Arc<dyn Extension>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_name() {
        assert_eq!(default_schema_name("analytics"), "ext_analytics");
        assert_eq!(default_schema_name("web-hooks"), "ext_web_hooks");
    }

    #[test]
    fn test_static_asset_paths() {
        assert!(StaticAsset::is_valid_path("app.js"));
        assert!(StaticAsset::is_valid_path("css/site.css"));
        for bad in ["", "/abs.js", "../x", "a//b", "a/./b"] {
            assert!(!StaticAsset::is_valid_path(bad), "{bad}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_context_deadline() {
        let ctx = LifecycleContext::new("analytics", Duration::from_secs(5));
        assert_eq!(ctx.module(), "analytics");
        assert_eq!(ctx.remaining(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctx.is_expired());
    }
}
