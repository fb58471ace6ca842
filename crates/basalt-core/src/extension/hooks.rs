//! Named extension points around core processing stages.
//!
//! Modules declare handlers through a [`HookRegistrar`]. The registry stamps
//! each declaration with a registry-wide sequence number and keeps the live
//! entries per point sorted by `(priority, seq)`, so the order is stable for
//! as long as the module set does not change.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::metrics::ModuleMetrics;
use super::safety::{guard_call, CallOutcome, ExtensionFault, FaultKind};
use super::services::{ExtensionServices, UserInfo};
use super::snapshot::ModuleRuntime;
use super::types::Result;

/// An extension point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HookPoint {
    PreRequest,
    PostRequest,
    PreAuth,
    PostAuth,
    PreDataAccess,
    PostDataAccess,
    /// Host-declared point; must be listed in `custom_hook_points`.
    Custom(String),
}

impl HookPoint {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreRequest => "pre_request",
            Self::PostRequest => "post_request",
            Self::PreAuth => "pre_auth",
            Self::PostAuth => "post_auth",
            Self::PreDataAccess => "pre_data_access",
            Self::PostDataAccess => "post_data_access",
            Self::Custom(name) => name,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

impl From<String> for HookPoint {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pre_request" => Self::PreRequest,
            "post_request" => Self::PostRequest,
            "pre_auth" => Self::PreAuth,
            "post_auth" => Self::PostAuth,
            "pre_data_access" => Self::PreDataAccess,
            "post_data_access" => Self::PostDataAccess,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for HookPoint {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<HookPoint> for String {
    fn from(value: HookPoint) -> Self {
        match value {
            HookPoint::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler error does to the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// Stop at the first failing handler.
    AbortOnError,
    /// Run every handler and report all failures.
    #[default]
    ContinueWithCollect,
}

// ============================================================================
// Context
// ============================================================================

/// Request being processed when a hook runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Response produced by the host, visible to post hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub elapsed_ms: u64,
}

/// Inputs shared by every handler of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct HookInput {
    pub request: Option<Arc<RequestInfo>>,
    pub response: Option<Arc<ResponseInfo>>,
    pub data: Arc<Mutex<Map<String, Value>>>,
}

impl HookInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = Some(Arc::new(request));
        self
    }

    pub fn with_response(mut self, response: ResponseInfo) -> Self {
        self.response = Some(Arc::new(response));
        self
    }

    /// Shared data after the chain ran.
    pub fn data(&self) -> Map<String, Value> {
        self.data.lock().clone()
    }
}

/// Context passed to one handler. Carries the handler's own module façade.
#[derive(Debug, Clone)]
pub struct HookContext {
    point: HookPoint,
    input: HookInput,
    services: ExtensionServices,
}

impl HookContext {
    pub(crate) fn new(point: HookPoint, input: HookInput, services: ExtensionServices) -> Self {
        Self {
            point,
            input,
            services,
        }
    }

    pub fn point(&self) -> &HookPoint {
        &self.point
    }

    pub fn request(&self) -> Option<&RequestInfo> {
        self.input.request.as_deref()
    }

    pub fn response(&self) -> Option<&ResponseInfo> {
        self.input.response.as_deref()
    }

    pub fn services(&self) -> &ExtensionServices {
        &self.services
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.input.data.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.input.data.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.input.data.lock().remove(key)
    }
}

// ============================================================================
// Declaration
// ============================================================================

pub type HookHandler = Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A handler as declared by a module.
#[derive(Clone)]
pub struct HookDeclaration {
    pub point: HookPoint,
    pub priority: i32,
    pub handler: HookHandler,
}

/// Collects a module's hook declarations.
#[derive(Default)]
pub struct HookRegistrar {
    declarations: Vec<HookDeclaration>,
}

impl HookRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` at `point`. Lower priorities run first.
    pub fn on<F, Fut>(&mut self, point: HookPoint, priority: i32, handler: F) -> &mut Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.declarations.push(HookDeclaration {
            point,
            priority,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &HookPoint> {
        self.declarations.iter().map(|d| &d.point)
    }

    pub(crate) fn into_declarations(self) -> Vec<HookDeclaration> {
        self.declarations
    }
}

/// A live handler in the snapshot.
pub struct HookEntry {
    pub module: String,
    pub point: HookPoint,
    pub priority: i32,
    pub seq: u64,
    pub(crate) handler: HookHandler,
    pub(crate) services: ExtensionServices,
    pub(crate) runtime: Arc<ModuleRuntime>,
    pub(crate) metrics: Arc<ModuleMetrics>,
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("module", &self.module)
            .field("point", &self.point)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

impl HookEntry {
    pub fn order_key(&self) -> (i32, u64) {
        (self.priority, self.seq)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailureKind {
    Error,
    Timeout,
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
    pub module: String,
    pub kind: HookFailureKind,
    pub message: String,
}

/// Result of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    /// Handlers that were called.
    pub invoked: usize,
    pub failures: Vec<HookFailure>,
    /// Chain stopped early under `AbortOnError`.
    pub aborted: bool,
}

impl HookOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Receives faults raised while running module callbacks.
pub(crate) trait FaultSink: Send + Sync {
    /// `runtime` is the gate of the module generation that faulted.
    fn report(&self, fault: ExtensionFault, runtime: &Arc<ModuleRuntime>);
}

/// Runs `entries` in order under the given policy.
///
/// Entries whose module is no longer active are skipped; this is how a
/// module quarantined earlier in the same chain stops receiving calls.
pub(crate) async fn run_chain(
    entries: &[Arc<HookEntry>],
    point: &HookPoint,
    input: &HookInput,
    policy: ChainPolicy,
    timeout: Duration,
    faults: &dyn FaultSink,
) -> HookOutcome {
    let mut outcome = HookOutcome::default();

    for entry in entries {
        let Some(_in_flight) = entry.runtime.enter() else {
            continue;
        };
        let ctx = HookContext::new(point.clone(), input.clone(), entry.services.clone());
        let result = guard_call(timeout, (entry.handler)(ctx)).await;
        outcome.invoked += 1;

        let failure = match result {
            CallOutcome::Completed(()) => {
                entry.metrics.record_hook(false);
                None
            }
            CallOutcome::Failed(e) => {
                entry.metrics.record_hook(true);
                warn!(
                    category = "extensions",
                    module = %entry.module,
                    hook = %point,
                    error = %e,
                    "Hook handler returned an error"
                );
                Some((HookFailureKind::Error, e.to_string()))
            }
            CallOutcome::TimedOut(d) => {
                entry.metrics.record_hook(true);
                entry.metrics.record_timeout();
                let message = format!("timed out after {d:?}");
                faults.report(
                    ExtensionFault::new(
                        &entry.module,
                        FaultKind::Timeout,
                        &message,
                        format!("hook {point}"),
                    ),
                    &entry.runtime,
                );
                Some((HookFailureKind::Timeout, message))
            }
            CallOutcome::Panicked { message, location } => {
                entry.metrics.record_hook(true);
                entry.metrics.record_panic();
                faults.report(
                    ExtensionFault::new(
                        &entry.module,
                        FaultKind::Panic,
                        &message,
                        format!("hook {point}"),
                    )
                    .with_location(location),
                    &entry.runtime,
                );
                Some((HookFailureKind::Panic, message))
            }
        };

        if let Some((kind, message)) = failure {
            outcome.failures.push(HookFailure {
                module: entry.module.clone(),
                kind,
                message,
            });
            if policy == ChainPolicy::AbortOnError {
                outcome.aborted = true;
                break;
            }
        }
    }

    outcome
}
