//! Runtime and bootstrap configuration for the extension runtime.
//!
//! Every field has a default so a host can start from an empty TOML table.
//! Durations are carried as integer milliseconds/seconds in the serialized
//! form and exposed as [`Duration`] through accessor methods.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::extension::hooks::ChainPolicy;

/// Default values shared by the config types and the CLI.
pub mod defaults {
    /// Path namespace every module route is mounted under.
    pub const NAMESPACE: &str = "ext";
    pub const HANDLER_TIMEOUT_MS: u64 = 5_000;
    pub const LIFECYCLE_TIMEOUT_MS: u64 = 30_000;
    pub const DRAIN_TIMEOUT_MS: u64 = 5_000;
    pub const HEALTH_INTERVAL_SECS: u64 = 30;
    pub const HEALTH_TIMEOUT_MS: u64 = 2_000;
    pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;
    pub const STORAGE_QUOTA_BYTES: u64 = 64 * 1024 * 1024;
    pub const FAULT_LOG_CAPACITY: usize = 50;
}

/// What the registry does when a module callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPolicy {
    /// Remove the module from the live tables and mark it failed.
    #[default]
    Disable,
    /// Record and log the fault, keep the module enabled.
    LogOnly,
}

/// Authentication the host applies to module routes that declare none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRouteAuth {
    #[default]
    Public,
    Authenticated,
}

/// Extension runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// First path segment of every module route (`/<namespace>/<module>/...`).
    pub namespace: String,
    /// Host version checked against each module's declared requirement.
    pub host_version: semver::Version,
    /// Hook chain policy.
    pub hook_policy: ChainPolicy,
    pub handler_timeout_ms: u64,
    pub lifecycle_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub health_interval_secs: u64,
    pub health_timeout_ms: u64,
    /// Consecutive failed health checks before a module is reported unhealthy.
    pub health_failure_threshold: u32,
    pub default_route_auth: DefaultRouteAuth,
    /// Host-declared hook points modules may attach to besides the built-in ones.
    pub custom_hook_points: Vec<String>,
    /// Blob storage quota per module.
    pub storage_quota_bytes: u64,
    /// Number of fault records kept per module.
    pub fault_log_capacity: usize,
    pub isolation_policy: IsolationPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: defaults::NAMESPACE.to_string(),
            host_version: host_version(),
            hook_policy: ChainPolicy::default(),
            handler_timeout_ms: defaults::HANDLER_TIMEOUT_MS,
            lifecycle_timeout_ms: defaults::LIFECYCLE_TIMEOUT_MS,
            drain_timeout_ms: defaults::DRAIN_TIMEOUT_MS,
            health_interval_secs: defaults::HEALTH_INTERVAL_SECS,
            health_timeout_ms: defaults::HEALTH_TIMEOUT_MS,
            health_failure_threshold: defaults::HEALTH_FAILURE_THRESHOLD,
            default_route_auth: DefaultRouteAuth::default(),
            custom_hook_points: Vec::new(),
            storage_quota_bytes: defaults::STORAGE_QUOTA_BYTES,
            fault_log_capacity: defaults::FAULT_LOG_CAPACITY,
            isolation_policy: IsolationPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Validate values that would make the runtime unusable.
    pub fn validate(&self) -> Result<(), String> {
        let ns = self.namespace.trim();
        if ns.is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        if !ns
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(format!("namespace is invalid: {ns}"));
        }
        if ns == "api" {
            return Err("namespace `api` is reserved for the host".to_string());
        }
        if self.handler_timeout_ms == 0 || self.lifecycle_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        if self.health_failure_threshold == 0 {
            return Err("health_failure_threshold must be at least 1".to_string());
        }
        for point in &self.custom_hook_points {
            if point.trim().is_empty() {
                return Err("custom hook point names must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Current host version, taken from the crate version.
pub fn host_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or(semver::Version::new(0, 0, 0))
}

/// Per-module bootstrap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    pub enabled: bool,
    /// Module configuration blob, validated against the module's schema.
    pub config: serde_json::Value,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            config: serde_json::Value::Null,
        }
    }
}

/// Bootstrap surface: which compiled-in modules to enable, in what order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Modules registered first, in this order. Remaining modules follow in
    /// dependency order.
    pub load_order: Vec<String>,
    pub modules: BTreeMap<String, ModuleSettings>,
}

impl ExtensionsConfig {
    pub fn settings(&self, name: &str) -> ModuleSettings {
        self.modules.get(name).cloned().unwrap_or_default()
    }
}
