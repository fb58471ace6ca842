//! Registry owning every module and the live dispatch tables.
//!
//! The registry provides:
//! - Registration with dependency and host version checks
//! - The enable/disable lifecycle, serialized by one async lock
//! - Lock-free route and hook dispatch over an immutable [`Snapshot`]
//! - Fault isolation: a panicking module is pulled out of the live tables
//!   from the dispatch path itself and torn down in the background
//! - Configuration updates, metrics, health and migration history
//!
//! Mutations take the state lock, change the slots and republish a fresh
//! snapshot built from them. Dispatch loads the current snapshot and never
//! waits on the lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::contract::{DynExtension, LifecycleContext, StaticAsset, Template};
use super::hooks::{
    run_chain, FaultSink, HookDeclaration, HookEntry, HookInput, HookOutcome, HookPoint,
    HookRegistrar, RequestInfo,
};
use super::metrics::{HealthStatus, HealthTracker, MetricsSnapshot, ModuleMetrics, ResourceCounts};
use super::migration::{MigrationRecord, MigrationReport, MigrationRunner, HOST_SCHEMA};
use super::permission::PermissionSet;
use super::routing::{
    bearer_token, compile_routes, error_response, extension_error_response, internal_error,
    method_not_allowed, not_found, split_extension_path, AuthRequirement, Middleware,
    ModuleRouter, ModuleRoutes, Next, PathParams, PathPattern, Request, Response,
    RouteDeclaration, RouteEntry, RouteMatch,
};
use super::safety::{guard_call, guard_sync, CallOutcome, ExtensionFault, FaultKind, FaultLog};
use super::services::{ExtensionServices, HostServices, UserInfo};
use super::snapshot::{HookSummary, ModuleHandle, ModuleInfo, ModuleRuntime, RouteSummary, Snapshot};
use super::store::validate_identifier;
use super::types::{
    ExtensionError, InitStage, ModuleDescriptor, ModuleStatus, RegistrationError, RegistryError,
};
use crate::config::{IsolationPolicy, RuntimeConfig};

/// Result of [`Registry::apply_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOutcome {
    /// The running module accepted the new configuration.
    Applied,
    /// Stored for the next enable; the module is not running.
    Stored,
    /// Identical to the last applied configuration; nothing was called.
    Unchanged,
}

// ============================================================================
// State
// ============================================================================

/// Everything that exists only while a module is enabled.
struct LiveModule {
    services: ExtensionServices,
    runtime: Arc<ModuleRuntime>,
    routes: Arc<ModuleRoutes>,
    hooks: Vec<Arc<HookEntry>>,
    templates: Arc<BTreeMap<String, Template>>,
    route_summaries: Vec<RouteSummary>,
}

struct ModuleSlot {
    descriptor: ModuleDescriptor,
    instance: DynExtension,
    schema: String,
    permissions: PermissionSet,
    status: ModuleStatus,
    registered_at: DateTime<Utc>,
    enabled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Last accepted configuration, normalized.
    config: Value,
    config_set: bool,
    metrics: Arc<ModuleMetrics>,
    health: Arc<HealthTracker>,
    live: Option<LiveModule>,
}

#[derive(Default)]
struct RegistryState {
    modules: BTreeMap<String, ModuleSlot>,
    /// Names in the order they were enabled; shutdown walks it backwards.
    enable_order: Vec<String>,
}

/// What a module declared during one enable.
struct Declared {
    routes: Vec<(RouteDeclaration, PathPattern)>,
    middleware: Vec<Middleware>,
    hooks: Vec<HookDeclaration>,
    templates: BTreeMap<String, Template>,
    assets: BTreeMap<String, StaticAsset>,
}

struct BroughtUp {
    live: LiveModule,
    metrics: Arc<ModuleMetrics>,
    health: Arc<HealthTracker>,
    config: Value,
}

struct RegistryInner {
    config: RuntimeConfig,
    host: HostServices,
    migrations: MigrationRunner,
    state: Mutex<RegistryState>,
    snapshot: ArcSwap<Snapshot>,
    versions: AtomicU64,
    hook_seq: AtomicU64,
    faults: FaultLog,
}

/// Registry for managing compiled-in modules.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespace", &self.inner.config.namespace)
            .field("snapshot_version", &self.inner.snapshot.load().version)
            .finish()
    }
}

impl Registry {
    /// Create a new registry over the given host services.
    pub fn new(config: RuntimeConfig, host: HostServices) -> Self {
        let migrations = MigrationRunner::new(host.store.clone());
        let faults = FaultLog::new(config.fault_log_capacity);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                host,
                migrations,
                state: Mutex::new(RegistryState::default()),
                snapshot: ArcSwap::from_pointee(Snapshot::default()),
                versions: AtomicU64::new(0),
                hook_seq: AtomicU64::new(0),
                faults,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a module. It starts out `registered` and serves nothing
    /// until enabled.
    pub async fn register(&self, instance: DynExtension) -> Result<(), RegistrationError> {
        let invalid = |e: ExtensionError| RegistrationError::InvalidDescriptor(e.to_string());
        let descriptor = guard_sync(|| instance.descriptor())
            .into_result()
            .map_err(invalid)?;
        descriptor.validate()?;

        let schema = guard_sync(|| instance.schema_name())
            .into_result()
            .map_err(invalid)?;
        if validate_identifier(&schema).is_err() || schema == HOST_SCHEMA {
            return Err(RegistrationError::InvalidDescriptor(format!(
                "module `{}` declares invalid schema name `{schema}`",
                descriptor.name
            )));
        }
        let permissions: PermissionSet = guard_sync(|| instance.permissions())
            .into_result()
            .map_err(invalid)?
            .into_iter()
            .collect();

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.modules.contains_key(&descriptor.name) {
            return Err(RegistrationError::Duplicate(descriptor.name));
        }
        if let Some(missing) = descriptor
            .dependencies
            .iter()
            .find(|dep| !state.modules.contains_key(*dep))
        {
            return Err(RegistrationError::MissingDependency {
                module: descriptor.name.clone(),
                dependency: missing.clone(),
            });
        }
        let host_version = &self.inner.config.host_version;
        if !descriptor.host_requirement.matches(host_version) {
            return Err(RegistrationError::IncompatibleHost {
                module: descriptor.name.clone(),
                required: descriptor.host_requirement.clone(),
                host: host_version.clone(),
            });
        }
        if let Some((owner, _)) = state.modules.iter().find(|(_, s)| s.schema == schema) {
            return Err(RegistrationError::InvalidDescriptor(format!(
                "schema `{schema}` is already owned by module `{owner}`"
            )));
        }

        let name = descriptor.name.clone();
        info!(
            category = "extensions",
            module = %name,
            version = %descriptor.version,
            "Registered module"
        );
        state.modules.insert(
            name.clone(),
            ModuleSlot {
                health: Arc::new(HealthTracker::new(
                    &name,
                    self.inner.config.health_failure_threshold,
                )),
                descriptor,
                instance,
                schema,
                permissions,
                status: ModuleStatus::Registered,
                registered_at: Utc::now(),
                enabled_at: None,
                last_error: None,
                config: Value::Null,
                config_set: false,
                metrics: Arc::new(ModuleMetrics::new(ResourceCounts::default())),
                live: None,
            },
        );
        self.publish(state);
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enable a registered, failed or disabled module.
    ///
    /// Runs config validation, migrations, `initialize`, declaration
    /// collection and `start`. Nothing becomes reachable unless every step
    /// succeeds; on failure the module is left `failed` with the error.
    pub async fn enable(&self, name: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let (instance, descriptor, schema, permissions, config) = {
            let slot = state
                .modules
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if !slot.status.can_enable() {
                return Err(RegistryError::InvalidState {
                    module: name.to_string(),
                    action: "enable",
                    status: slot.status,
                });
            }
            (
                slot.instance.clone(),
                slot.descriptor.clone(),
                slot.schema.clone(),
                slot.permissions.clone(),
                slot.config.clone(),
            )
        };
        for dependency in &descriptor.dependencies {
            let running = state.modules.get(dependency).is_some_and(|dep| {
                dep.status == ModuleStatus::Enabled
                    && dep.live.as_ref().is_some_and(|l| l.runtime.is_active())
            });
            if !running {
                return Err(RegistryError::DependencyNotEnabled {
                    module: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        if let Some(slot) = state.modules.get_mut(name) {
            slot.status = ModuleStatus::Initializing;
            slot.last_error = None;
        }
        self.publish(state);
        info!(category = "extensions", module = name, "Enabling module");

        let result = self
            .bring_up(name, &instance, &schema, permissions, &config)
            .await;

        let slot = state
            .modules
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        match result {
            Ok(up) => {
                slot.live = Some(up.live);
                slot.metrics = up.metrics;
                slot.health = up.health;
                slot.config = up.config;
                slot.config_set = true;
                slot.status = ModuleStatus::Enabled;
                slot.enabled_at = Some(Utc::now());
                state.enable_order.push(name.to_string());
                self.publish(state);
                info!(category = "extensions", module = name, "Module enabled");
                Ok(())
            }
            Err(err) => {
                slot.status = ModuleStatus::Failed;
                slot.last_error = Some(err.to_string());
                self.publish(state);
                self.inner.faults.record(ExtensionFault::new(
                    name,
                    FaultKind::Lifecycle,
                    err.to_string(),
                    "enable",
                ));
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        name: &str,
        instance: &DynExtension,
        schema: &str,
        permissions: PermissionSet,
        stored_config: &Value,
    ) -> Result<BroughtUp, RegistryError> {
        let cfg = &self.inner.config;
        let failed = |stage: InitStage, message: String| RegistryError::Initialization {
            module: name.to_string(),
            stage,
            message,
        };

        let config = check_config(instance, stored_config)
            .map_err(|e| failed(InitStage::Config, e.to_string()))?;

        let migrations = guard_sync(|| instance.migrations())
            .into_result()
            .map_err(|e| failed(InitStage::Migrations, e.to_string()))?;
        let migration_count = migrations.len();
        let runner = self.inner.migrations.clone();
        let (module, owned_schema) = (name.to_string(), schema.to_string());
        let report = tokio::task::spawn_blocking(move || {
            runner.apply_pending(&module, &owned_schema, &migrations)
        })
        .await
        .map_err(|e| failed(InitStage::Migrations, e.to_string()))?
        .map_err(|e| failed(InitStage::Migrations, e.to_string()))?;
        if !report.applied.is_empty() {
            debug!(
                category = "extensions",
                module = name,
                applied = ?report.applied,
                "Migrations applied during enable"
            );
        }

        let permission_count = permissions.len();
        let services = ExtensionServices::new(
            name,
            schema,
            permissions,
            self.inner.host.clone(),
            config.clone(),
            cfg.storage_quota_bytes,
        );

        let ctx = LifecycleContext::new(name, cfg.lifecycle_timeout());
        if let Err(e) = guard_call(cfg.lifecycle_timeout(), instance.initialize(&ctx, services.clone()))
            .await
            .into_result()
        {
            services.revoke();
            return Err(failed(InitStage::Initialize, e.to_string()));
        }

        let declared = match self.collect_declarations(instance) {
            Ok(declared) => declared,
            Err(message) => {
                self.stop_quietly(name, instance).await;
                services.revoke();
                return Err(failed(InitStage::Registration, message));
            }
        };

        let ctx = LifecycleContext::new(name, cfg.lifecycle_timeout());
        if let Err(e) = guard_call(cfg.lifecycle_timeout(), instance.start(&ctx))
            .await
            .into_result()
        {
            self.stop_quietly(name, instance).await;
            services.revoke();
            return Err(failed(InitStage::Start, e.to_string()));
        }

        let resources = ResourceCounts {
            routes: declared.routes.len(),
            middleware: declared.middleware.len(),
            hooks: declared.hooks.len(),
            migrations: migration_count,
            templates: declared.templates.len(),
            static_assets: declared.assets.len(),
            permissions: permission_count,
        };
        let metrics = Arc::new(ModuleMetrics::new(resources));
        let health = Arc::new(HealthTracker::new(name, cfg.health_failure_threshold));
        let live = self.assemble(name, services, declared, &metrics);
        Ok(BroughtUp {
            live,
            metrics,
            health,
            config,
        })
    }

    /// Call every declaration accessor and validate the result.
    fn collect_declarations(&self, instance: &DynExtension) -> Result<Declared, String> {
        let (routes, middleware) = guard_sync(|| {
            let mut router = ModuleRouter::new();
            instance.routes(&mut router);
            router.into_parts()
        })
        .into_result()
        .map_err(|e| e.to_string())?;
        let routes = compile_routes(routes)?;

        let hooks = guard_sync(|| {
            let mut registrar = HookRegistrar::new();
            instance.hooks(&mut registrar);
            registrar.into_declarations()
        })
        .into_result()
        .map_err(|e| e.to_string())?;
        for hook in &hooks {
            if let HookPoint::Custom(point) = &hook.point {
                if !self.inner.config.custom_hook_points.contains(point) {
                    return Err(format!("hook point `{point}` is not declared by the host"));
                }
            }
        }

        let mut templates = BTreeMap::new();
        for template in guard_sync(|| instance.templates())
            .into_result()
            .map_err(|e| e.to_string())?
        {
            if template.name.trim().is_empty() {
                return Err("template names must not be empty".to_string());
            }
            if templates.contains_key(&template.name) {
                return Err(format!("duplicate template `{}`", template.name));
            }
            templates.insert(template.name.clone(), template);
        }

        let mut assets = BTreeMap::new();
        for asset in guard_sync(|| instance.static_assets())
            .into_result()
            .map_err(|e| e.to_string())?
        {
            if !StaticAsset::is_valid_path(&asset.path) {
                return Err(format!("invalid static asset path `{}`", asset.path));
            }
            if assets.contains_key(&asset.path) {
                return Err(format!("duplicate static asset `{}`", asset.path));
            }
            assets.insert(asset.path.clone(), asset);
        }

        Ok(Declared {
            routes,
            middleware,
            hooks,
            templates,
            assets,
        })
    }

    fn assemble(
        &self,
        name: &str,
        services: ExtensionServices,
        declared: Declared,
        metrics: &Arc<ModuleMetrics>,
    ) -> LiveModule {
        let runtime = Arc::new(ModuleRuntime::new(name));
        let namespace = &self.inner.config.namespace;

        let route_summaries = declared
            .routes
            .iter()
            .map(|(decl, pattern)| RouteSummary {
                method: decl.method.to_string(),
                path: full_path(namespace, name, pattern.as_str()),
                auth: decl.auth.clone(),
            })
            .collect();
        let routes = Arc::new(ModuleRoutes {
            module: name.to_string(),
            routes: declared
                .routes
                .into_iter()
                .map(|(decl, pattern)| RouteEntry {
                    method: decl.method,
                    pattern,
                    auth: decl.auth,
                    handler: decl.handler,
                })
                .collect(),
            middleware: declared.middleware.into(),
            assets: declared.assets,
            runtime: runtime.clone(),
            metrics: metrics.clone(),
        });
        let hooks = declared
            .hooks
            .into_iter()
            .map(|decl| {
                Arc::new(HookEntry {
                    module: name.to_string(),
                    point: decl.point,
                    priority: decl.priority,
                    seq: self.inner.hook_seq.fetch_add(1, Ordering::Relaxed),
                    handler: decl.handler,
                    services: services.clone(),
                    runtime: runtime.clone(),
                    metrics: metrics.clone(),
                })
            })
            .collect();

        LiveModule {
            services,
            runtime,
            routes,
            hooks,
            templates: Arc::new(declared.templates),
            route_summaries,
        }
    }

    /// Disable an enabled module.
    ///
    /// Its entries leave the live tables first; in-flight work is then given
    /// the drain timeout to finish before `stop` is called. The module ends
    /// `disabled` whatever `stop` returns.
    pub async fn disable(&self, name: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let slot = state
            .modules
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let live = match (slot.status, slot.live.take()) {
            (ModuleStatus::Enabled, Some(live)) => live,
            (status, live) => {
                slot.live = live;
                return Err(RegistryError::InvalidState {
                    module: name.to_string(),
                    action: "disable",
                    status,
                });
            }
        };
        let instance = slot.instance.clone();
        live.runtime.deactivate();
        state.enable_order.retain(|n| n != name);
        self.publish(state);

        let dependents: Vec<&str> = state
            .modules
            .values()
            .filter(|s| {
                s.status == ModuleStatus::Enabled
                    && s.descriptor.dependencies.iter().any(|d| d == name)
            })
            .map(|s| s.descriptor.name.as_str())
            .collect();
        if !dependents.is_empty() {
            warn!(
                category = "extensions",
                module = name,
                dependents = ?dependents,
                "Disabling a module other enabled modules depend on"
            );
        }

        self.teardown(name, &instance, live).await;

        if let Some(slot) = state.modules.get_mut(name) {
            slot.status = ModuleStatus::Disabled;
        }
        self.publish(state);
        info!(category = "extensions", module = name, "Module disabled");
        Ok(())
    }

    /// Drain, stop and revoke one live generation.
    async fn teardown(&self, name: &str, instance: &DynExtension, live: LiveModule) {
        let drain_timeout = self.inner.config.drain_timeout();
        if !live.runtime.drain(drain_timeout).await {
            warn!(
                category = "extensions",
                module = name,
                in_flight = live.runtime.in_flight(),
                "Drain timed out, stopping with requests in flight"
            );
        }
        self.stop_quietly(name, instance).await;
        live.services.revoke();
    }

    /// Call `stop`, recording a failure without propagating it.
    async fn stop_quietly(&self, name: &str, instance: &DynExtension) {
        let timeout = self.inner.config.lifecycle_timeout();
        let ctx = LifecycleContext::new(name, timeout);
        let outcome = guard_call(timeout, instance.stop(&ctx)).await;
        if let Err(e) = outcome.into_result() {
            self.inner.faults.record(ExtensionFault::new(
                name,
                FaultKind::Lifecycle,
                e.to_string(),
                "stop",
            ));
        }
    }

    /// Disable every enabled module, most recently enabled first.
    pub async fn shutdown(&self) {
        let order = self.inner.state.lock().await.enable_order.clone();
        for name in order.iter().rev() {
            if let Err(e) = self.disable(name).await {
                debug!(category = "extensions", module = %name, error = %e, "Skipped during shutdown");
            }
        }
        info!(category = "extensions", "Extension runtime shut down");
    }

    // ========================================================================
    // Fault isolation
    // ========================================================================

    /// Pull a faulted module out of the live tables without the state lock,
    /// then finish the teardown in the background.
    fn quarantine(&self, name: &str, runtime: &Arc<ModuleRuntime>) {
        if self.inner.config.isolation_policy == IsolationPolicy::LogOnly {
            return;
        }
        if !runtime.deactivate() {
            return;
        }
        self.inner.snapshot.rcu(|current| {
            let version = self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1;
            current.without_module(name, ModuleStatus::Failed, version)
        });
        warn!(category = "extensions", module = name, "Module disabled after a fault");

        let registry = self.clone();
        let runtime = runtime.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            registry.finalize_quarantine(&name, &runtime).await;
        });
    }

    async fn finalize_quarantine(&self, name: &str, runtime: &Arc<ModuleRuntime>) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(slot) = state.modules.get_mut(name) else {
            return;
        };
        let live = match slot.live.take() {
            Some(live) if Arc::ptr_eq(&live.runtime, runtime) => live,
            other => {
                // Already disabled or re-enabled since the fault.
                slot.live = other;
                return;
            }
        };
        slot.status = ModuleStatus::Failed;
        slot.last_error = Some("disabled after a fault".to_string());
        let instance = slot.instance.clone();
        state.enable_order.retain(|n| n != name);
        self.publish(state);

        self.teardown(name, &instance, live).await;
    }

    fn report_fault(&self, fault: ExtensionFault, runtime: &Arc<ModuleRuntime>) {
        let panicked = fault.kind == FaultKind::Panic;
        let module = fault.module.clone();
        self.inner.faults.record(fault);
        if panicked {
            self.quarantine(&module, runtime);
        }
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    fn publish(&self, state: &RegistryState) {
        let mut snapshot = Snapshot {
            version: self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1,
            ..Default::default()
        };
        let mut hooks: std::collections::HashMap<HookPoint, Vec<Arc<HookEntry>>> =
            Default::default();

        for (name, slot) in &state.modules {
            let live = slot.live.as_ref().filter(|l| l.runtime.is_active());
            let status = match (slot.status, live, &slot.live) {
                // Quarantined, waiting for the finalizer.
                (ModuleStatus::Enabled, None, Some(_)) => ModuleStatus::Failed,
                (status, _, _) => status,
            };

            if let Some(live) = live {
                snapshot.routes.insert(name.clone(), live.routes.clone());
                snapshot
                    .templates
                    .insert(name.clone(), live.templates.clone());
                for entry in &live.hooks {
                    hooks
                        .entry(entry.point.clone())
                        .or_default()
                        .push(entry.clone());
                }
            }
            snapshot.handles.insert(
                name.clone(),
                ModuleHandle {
                    instance: slot.instance.clone(),
                    metrics: slot.metrics.clone(),
                    health: slot.health.clone(),
                    runtime: live.map(|l| l.runtime.clone()),
                },
            );
            snapshot
                .modules
                .insert(name.clone(), module_info(slot, live, status));
        }

        snapshot.hooks = hooks
            .into_iter()
            .map(|(point, mut entries)| {
                entries.sort_by_key(|e| e.order_key());
                (point, entries.into())
            })
            .collect();
        self.inner.snapshot.store(Arc::new(snapshot));
    }

    /// The current dispatch tables.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, name: &str) -> Option<ModuleInfo> {
        let snapshot = self.inner.snapshot.load();
        let mut info = snapshot.modules.get(name)?.clone();
        if let Some(handle) = snapshot.handles.get(name) {
            info.health = handle.health.state();
        }
        Some(info)
    }

    /// All modules, ordered by name.
    pub fn list(&self) -> Vec<ModuleInfo> {
        let snapshot = self.inner.snapshot.load();
        snapshot
            .modules
            .values()
            .map(|info| {
                let mut info = info.clone();
                if let Some(handle) = snapshot.handles.get(&info.name) {
                    info.health = handle.health.state();
                }
                info
            })
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<ModuleStatus> {
        self.inner.snapshot.load().modules.get(name).map(|m| m.status)
    }

    /// Counters since the module was last enabled.
    pub fn metrics(&self, name: &str) -> Option<MetricsSnapshot> {
        self.inner
            .snapshot
            .load()
            .handles
            .get(name)
            .map(|h| h.metrics.snapshot())
    }

    /// Last recorded health check.
    pub fn health(&self, name: &str) -> Option<HealthStatus> {
        self.inner
            .snapshot
            .load()
            .handles
            .get(name)
            .and_then(|h| h.health.last())
    }

    /// Recorded faults for `name`, oldest first.
    pub fn faults(&self, name: &str) -> Vec<ExtensionFault> {
        self.inner.faults.for_module(name)
    }

    pub fn template(&self, module: &str, name: &str) -> Option<Template> {
        self.inner
            .snapshot
            .load()
            .templates
            .get(module)
            .and_then(|t| t.get(name).cloned())
    }

    pub fn templates(&self, module: &str) -> Vec<Template> {
        self.inner
            .snapshot
            .load()
            .templates
            .get(module)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Validate and apply a new module configuration.
    ///
    /// A rejected configuration changes nothing; the last accepted one stays
    /// in effect and the module stays enabled.
    pub async fn apply_config(
        &self,
        name: &str,
        config: Value,
    ) -> Result<ConfigOutcome, RegistryError> {
        let mut guard = self.inner.state.lock().await;
        let slot = guard
            .modules
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let config_error = |source: ExtensionError| RegistryError::Config {
            module: name.to_string(),
            source,
        };

        let normalized = check_config(&slot.instance, &config).map_err(config_error)?;
        if slot.config_set && slot.config == normalized {
            debug!(category = "extensions", module = name, "Configuration unchanged");
            return Ok(ConfigOutcome::Unchanged);
        }

        let live = slot.live.as_ref().filter(|l| l.runtime.is_active());
        let outcome = match live {
            Some(live) => {
                let timeout = self.inner.config.lifecycle_timeout();
                let result = guard_call(timeout, slot.instance.apply_config(&normalized)).await;
                if let CallOutcome::Panicked { message, location } = &result {
                    self.inner.faults.record(
                        ExtensionFault::new(name, FaultKind::Panic, message, "apply_config")
                            .with_location(location.clone()),
                    );
                }
                result.into_result().map_err(config_error)?;
                live.services.set_config(normalized.clone());
                ConfigOutcome::Applied
            }
            None => ConfigOutcome::Stored,
        };

        slot.config = normalized;
        slot.config_set = true;
        info!(category = "extensions", module = name, outcome = ?outcome, "Configuration updated");
        Ok(outcome)
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Run one health check. Failures are recorded, never acted on.
    pub async fn check_health(&self, name: &str) -> Result<HealthStatus, RegistryError> {
        let (handle, status) = {
            let snapshot = self.inner.snapshot.load();
            let info = snapshot
                .modules
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            (snapshot.handles.get(name).cloned(), info.status)
        };
        let not_running = || RegistryError::InvalidState {
            module: name.to_string(),
            action: "check health",
            status,
        };
        let handle = handle.ok_or_else(not_running)?;
        let runtime = handle.runtime.clone().ok_or_else(not_running)?;
        let Some(_in_flight) = runtime.enter() else {
            return Err(not_running());
        };

        let timeout = self.inner.config.health_timeout();
        let ctx = LifecycleContext::new(name, timeout);
        let health = match guard_call(timeout, handle.instance.health(&ctx)).await {
            CallOutcome::Completed(report) => handle.health.record_report(report),
            CallOutcome::Failed(e) => handle.health.record_failure(e.to_string()),
            CallOutcome::TimedOut(d) => {
                let message = format!("health check timed out after {d:?}");
                self.inner.faults.record(ExtensionFault::new(
                    name,
                    FaultKind::HealthCheck,
                    &message,
                    "health",
                ));
                handle.health.record_failure(message)
            }
            CallOutcome::Panicked { message, location } => {
                self.inner.faults.record(
                    ExtensionFault::new(name, FaultKind::HealthCheck, &message, "health")
                        .with_location(location),
                );
                handle.health.record_failure(format!("health check panicked: {message}"))
            }
        };
        Ok(health)
    }

    /// Poll every enabled module at the configured interval.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.inner.config.health_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let enabled: Vec<String> = registry
                    .inner
                    .snapshot
                    .load()
                    .routes
                    .keys()
                    .cloned()
                    .collect();
                let checks = enabled.iter().map(|name| registry.check_health(name));
                for result in futures::future::join_all(checks).await {
                    if let Err(e) = result {
                        debug!(category = "extensions", error = %e, "Health check skipped");
                    }
                }
            }
        })
    }

    // ========================================================================
    // Migrations
    // ========================================================================

    pub async fn migration_history(
        &self,
        name: &str,
    ) -> Result<Vec<MigrationRecord>, RegistryError> {
        if self.status(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let runner = self.inner.migrations.clone();
        let module = name.to_string();
        tokio::task::spawn_blocking(move || runner.history(&module))
            .await
            .map_err(|e| migration_error(name, e.to_string()))?
            .map_err(|e| migration_error(name, e.to_string()))
    }

    /// Revert a module's schema to `target`. The module must not be running.
    pub async fn rollback_migrations(
        &self,
        name: &str,
        target: u32,
    ) -> Result<MigrationReport, RegistryError> {
        let guard = self.inner.state.lock().await;
        let slot = guard
            .modules
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if matches!(
            slot.status,
            ModuleStatus::Enabled | ModuleStatus::Initializing
        ) {
            return Err(RegistryError::InvalidState {
                module: name.to_string(),
                action: "roll back migrations",
                status: slot.status,
            });
        }
        let migrations = guard_sync(|| slot.instance.migrations())
            .into_result()
            .map_err(|e| migration_error(name, e.to_string()))?;
        let runner = self.inner.migrations.clone();
        let (module, schema) = (name.to_string(), slot.schema.clone());
        let report = tokio::task::spawn_blocking(move || {
            runner.revert_to(&module, &schema, &migrations, target)
        })
        .await
        .map_err(|e| migration_error(name, e.to_string()))?
        .map_err(|e| migration_error(name, e.to_string()))?;
        info!(
            category = "extensions",
            module = name,
            from = report.from_version,
            to = report.to_version,
            "Migrations rolled back"
        );
        Ok(report)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run every live handler for `point`.
    pub async fn dispatch_hook(&self, point: HookPoint, input: HookInput) -> HookOutcome {
        let entries = self.inner.snapshot.load().hooks_for(&point);
        let Some(entries) = entries else {
            return HookOutcome::default();
        };
        let cfg = &self.inner.config;
        run_chain(
            &entries,
            &point,
            &input,
            cfg.hook_policy,
            cfg.handler_timeout(),
            self,
        )
        .await
    }

    /// Route a request under `/<namespace>/<module>/...` to its module.
    ///
    /// Unknown, disabled and failed modules answer 404. Everything a module
    /// runs for the request happens inside one guarded call.
    pub async fn dispatch_route(&self, mut req: Request) -> Response {
        let started = Instant::now();
        let path = req.uri().path().to_string();
        let Some((module, rel)) = split_extension_path(&self.inner.config.namespace, &path) else {
            return not_found();
        };
        let routes = {
            let snapshot = self.inner.snapshot.load();
            match snapshot.routes.get(module) {
                Some(routes) => routes.clone(),
                None => return not_found(),
            }
        };
        let Some(_in_flight) = routes.runtime.enter() else {
            return not_found();
        };
        let method = req.method().clone();

        if ModuleRoutes::is_static_path(&rel) {
            return serve_asset(&routes, &method, &rel);
        }

        let (route, params) = match routes.find(&method, &rel) {
            RouteMatch::Found(route, params) => (route, params),
            RouteMatch::MethodNotAllowed(allowed) => return method_not_allowed(&allowed),
            RouteMatch::NotFound => return not_found(),
        };

        let requirement = route.auth.effective(self.inner.config.default_route_auth);
        if !requirement.is_public() {
            let mut info = RequestInfo::new(method.as_str(), path.as_str());
            info.query = req.uri().query().map(str::to_string);
            let token = bearer_token(req.headers()).map(str::to_string);
            match self.authenticate(info, token, &requirement).await {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                }
                Err(response) => return response,
            }
        }
        req.extensions_mut().insert::<PathParams>(params);

        let context = format!("route {} {}", route.method, route.pattern);
        let next = Next::new(routes.middleware.clone(), route.handler.clone());
        let outcome = guard_call(self.inner.config.handler_timeout(), next.run(req)).await;

        let (response, is_error) = match outcome {
            CallOutcome::Completed(response) => {
                let is_error = response.status().is_server_error();
                (response, is_error)
            }
            CallOutcome::Failed(e) => {
                debug!(category = "extensions", module, %context, error = %e, "Handler returned an error");
                (extension_error_response(&e), true)
            }
            CallOutcome::TimedOut(d) => {
                routes.metrics.record_timeout();
                self.report_fault(
                    ExtensionFault::new(
                        module,
                        FaultKind::Timeout,
                        format!("timed out after {d:?}"),
                        &context,
                    ),
                    &routes.runtime,
                );
                let response = error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "TIMEOUT",
                    "Extension handler timed out",
                );
                (response, true)
            }
            CallOutcome::Panicked { message, location } => {
                routes.metrics.record_panic();
                self.report_fault(
                    ExtensionFault::new(module, FaultKind::Panic, message, &context)
                        .with_location(location),
                    &routes.runtime,
                );
                (internal_error(), true)
            }
        };
        routes.metrics.record_request(started.elapsed(), is_error);
        response
    }

    /// Host authentication for a non-public route.
    async fn authenticate(
        &self,
        mut info: RequestInfo,
        token: Option<String>,
        requirement: &AuthRequirement,
    ) -> Result<UserInfo, Response> {
        self.dispatch_hook(HookPoint::PreAuth, HookInput::new().with_request(info.clone()))
            .await;

        let unauthorized = || {
            error_response(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required",
            )
        };
        let token = token.ok_or_else(unauthorized)?;
        let user = match self.inner.host.identity.validate_token(&token).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(unauthorized()),
            Err(e) => {
                warn!(category = "extensions", error = %e, "Identity provider failed");
                return Err(unauthorized());
            }
        };
        if let AuthRequirement::Role(role) = requirement {
            if !user.has_role(role) {
                return Err(error_response(
                    StatusCode::FORBIDDEN,
                    "FORBIDDEN",
                    "Insufficient role",
                ));
            }
        }

        info.user = Some(user.clone());
        self.dispatch_hook(HookPoint::PostAuth, HookInput::new().with_request(info))
            .await;
        Ok(user)
    }
}

impl FaultSink for Registry {
    fn report(&self, fault: ExtensionFault, runtime: &Arc<ModuleRuntime>) {
        self.report_fault(fault, runtime);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Normalize `config` against the module's schema, then run its own check.
fn check_config(instance: &DynExtension, config: &Value) -> Result<Value, ExtensionError> {
    let normalized = guard_sync(|| instance.config_schema().normalize(config))
        .into_result()?
        .map_err(|e| ExtensionError::InvalidConfig(e.to_string()))?;
    guard_sync(|| instance.validate_config(&normalized))
        .into_result()
        .and_then(|r| r)?;
    Ok(normalized)
}

fn module_info(slot: &ModuleSlot, live: Option<&LiveModule>, status: ModuleStatus) -> ModuleInfo {
    let descriptor = &slot.descriptor;
    ModuleInfo {
        name: descriptor.name.clone(),
        version: descriptor.version.clone(),
        description: descriptor.description.clone(),
        tags: descriptor.tags.clone(),
        dependencies: descriptor.dependencies.clone(),
        status,
        health: slot.health.state(),
        schema: slot.schema.clone(),
        permissions: slot.permissions.iter().collect(),
        resources: slot.metrics.resources().clone(),
        routes: live.map(|l| l.route_summaries.clone()).unwrap_or_default(),
        hooks: live
            .map(|l| {
                l.hooks
                    .iter()
                    .map(|h| HookSummary {
                        point: h.point.clone(),
                        priority: h.priority,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        registered_at: slot.registered_at,
        enabled_at: slot.enabled_at,
        last_error: slot.last_error.clone(),
    }
}

fn full_path(namespace: &str, module: &str, rel: &str) -> String {
    if rel == "/" {
        format!("/{namespace}/{module}")
    } else {
        format!("/{namespace}/{module}{rel}")
    }
}

fn migration_error(module: &str, message: String) -> RegistryError {
    RegistryError::Migration {
        module: module.to_string(),
        message,
    }
}

fn serve_asset(routes: &ModuleRoutes, method: &Method, rel: &str) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed(&[Method::GET, Method::HEAD]);
    }
    let Some(asset) = routes.asset(rel) else {
        return not_found();
    };
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(asset.body.to_vec())
    };
    let mut response = Response::new(body);
    if let Ok(value) = HeaderValue::from_str(&asset.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
