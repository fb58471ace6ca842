//! Immutable dispatch tables and per-module in-flight tracking.
//!
//! The registry publishes a new [`Snapshot`] after every mutation; the
//! dispatch path loads the current one without taking any lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::contract::{DynExtension, Template};
use super::hooks::{HookEntry, HookPoint};
use super::metrics::{HealthTracker, ModuleMetrics, ResourceCounts};
use super::permission::Permission;
use super::routing::{AuthRequirement, ModuleRoutes};
use super::types::{HealthState, ModuleStatus};

/// Liveness gate of one enabled module generation.
///
/// A request enters only while the module is active; `drain` waits for the
/// entered requests to leave.
#[derive(Debug)]
pub struct ModuleRuntime {
    module: String,
    active: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ModuleRuntime {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Register one unit of in-flight work, `None` once deactivated.
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.active.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }
        Some(InFlightGuard {
            runtime: self.clone(),
        })
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Stop admitting work. Returns whether this call changed the state.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Wait until no work is in flight. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// Keeps a module's in-flight count raised while alive.
#[derive(Debug)]
pub struct InFlightGuard {
    runtime: Arc<ModuleRuntime>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.runtime.leave();
    }
}

/// A route as listed by `Registry::get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub method: String,
    pub path: String,
    pub auth: AuthRequirement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSummary {
    pub point: HookPoint,
    pub priority: i32,
}

/// Read-only view of one registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: semver::Version,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub status: ModuleStatus,
    pub health: HealthState,
    pub schema: String,
    pub permissions: Vec<Permission>,
    pub resources: ResourceCounts,
    pub routes: Vec<RouteSummary>,
    pub hooks: Vec<HookSummary>,
    pub registered_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Per-module state read without the registry lock.
#[derive(Clone)]
pub(crate) struct ModuleHandle {
    pub(crate) instance: DynExtension,
    pub(crate) metrics: Arc<ModuleMetrics>,
    pub(crate) health: Arc<HealthTracker>,
    /// Gate of the live generation, `None` unless enabled.
    pub(crate) runtime: Option<Arc<ModuleRuntime>>,
}

/// Everything the dispatch path reads.
#[derive(Default)]
pub struct Snapshot {
    /// Incremented on every publish.
    pub version: u64,
    pub modules: BTreeMap<String, ModuleInfo>,
    pub routes: HashMap<String, Arc<ModuleRoutes>>,
    /// Per point, sorted by `(priority, seq)`.
    pub hooks: HashMap<HookPoint, Arc<[Arc<HookEntry>]>>,
    pub templates: HashMap<String, Arc<BTreeMap<String, Template>>>,
    pub(crate) handles: HashMap<String, ModuleHandle>,
}

impl Snapshot {
    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name)
    }

    pub fn hooks_for(&self, point: &HookPoint) -> Option<Arc<[Arc<HookEntry>]>> {
        self.hooks.get(point).cloned()
    }

    /// Copy of this snapshot with `module`'s live entries removed and its
    /// status set to `status`.
    pub(crate) fn without_module(&self, module: &str, status: ModuleStatus, version: u64) -> Snapshot {
        let mut modules = self.modules.clone();
        if let Some(info) = modules.get_mut(module) {
            info.status = status;
            info.routes.clear();
            info.hooks.clear();
        }
        let mut routes = self.routes.clone();
        routes.remove(module);
        let mut templates = self.templates.clone();
        templates.remove(module);
        let hooks = self
            .hooks
            .iter()
            .map(|(point, entries)| {
                let kept: Arc<[Arc<HookEntry>]> = entries
                    .iter()
                    .filter(|e| e.module != module)
                    .cloned()
                    .collect();
                (point.clone(), kept)
            })
            .filter(|(_, entries)| !entries.is_empty())
            .collect();
        let mut handles = self.handles.clone();
        if let Some(handle) = handles.get_mut(module) {
            handle.runtime = None;
        }
        Snapshot {
            version,
            modules,
            routes,
            hooks,
            templates,
            handles,
        }
    }
}
