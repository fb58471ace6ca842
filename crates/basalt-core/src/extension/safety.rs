//! Fault isolation boundary for module callbacks.
//!
//! Every module-supplied future reachable from the dispatch path or the
//! lifecycle runs through [`guard_call`], which:
//! - catches panics (the process must be built with unwinding),
//! - bounds the call with a timeout,
//! - turns the result into a [`CallOutcome`].
//!
//! Faults are recorded as [`ExtensionFault`] values in a bounded per-module
//! [`FaultLog`] and logged at `error` level.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::types::ExtensionError;

const MAX_PANIC_MESSAGE_CHARS: usize = 512;

thread_local! {
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

/// Install a process-wide panic hook that logs through `tracing` and records
/// the panic location for the fault record. Idempotent.
pub fn install_extension_panic_hook() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
            LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location.clone());

            let thread = std::thread::current();
            error!(
                thread = thread.name().unwrap_or("unnamed"),
                location = location.as_deref().unwrap_or("unknown"),
                payload = %panic_message(info.payload()),
                "Panic detected"
            );

            // The default hook prints to stderr; only useful while developing.
            #[cfg(debug_assertions)]
            previous(info);
            #[cfg(not(debug_assertions))]
            let _ = &previous;
        }));
    });
}

fn take_panic_location() -> Option<String> {
    LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take())
}

/// Extracts a printable, length-capped message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    let raw = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    sanitize(&raw)
}

fn sanitize(value: &str) -> String {
    let normalized = value.replace(['\n', '\r'], " ");
    let mut truncated: String = normalized.chars().take(MAX_PANIC_MESSAGE_CHARS).collect();
    if normalized.chars().count() > MAX_PANIC_MESSAGE_CHARS {
        truncated.push_str("...");
    }
    truncated
}

/// Result of one guarded module call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Completed(T),
    /// The callback returned an error.
    Failed(ExtensionError),
    Panicked {
        message: String,
        location: Option<String>,
    },
    TimedOut(Duration),
}

impl<T> CallOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Collapse into a `Result`, describing faults as errors.
    pub fn into_result(self) -> Result<T, ExtensionError> {
        match self {
            Self::Completed(v) => Ok(v),
            Self::Failed(e) => Err(e),
            Self::Panicked { message, .. } => {
                Err(ExtensionError::ExecutionFailed(format!("panicked: {message}")))
            }
            Self::TimedOut(d) => Err(ExtensionError::Timeout(d)),
        }
    }
}

/// Run a module future inside the recovery boundary.
///
/// A timed-out future is dropped at its next await point; blocking code
/// inside it keeps running until it yields.
pub async fn guard_call<T, F>(timeout: Duration, fut: F) -> CallOutcome<T>
where
    F: Future<Output = Result<T, ExtensionError>>,
{
    take_panic_location();
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Err(_) => CallOutcome::TimedOut(timeout),
        Ok(Ok(Ok(value))) => CallOutcome::Completed(value),
        Ok(Ok(Err(e))) => CallOutcome::Failed(e),
        Ok(Err(payload)) => CallOutcome::Panicked {
            message: panic_message(payload.as_ref()),
            location: take_panic_location(),
        },
    }
}

/// Guard a synchronous module callback (declaration accessors and the like).
pub fn guard_sync<T>(f: impl FnOnce() -> T) -> CallOutcome<T> {
    take_panic_location();
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => CallOutcome::Completed(value),
        Err(payload) => CallOutcome::Panicked {
            message: panic_message(payload.as_ref()),
            location: take_panic_location(),
        },
    }
}

// ============================================================================
// Fault records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A callback panicked.
    Panic,
    /// A callback exceeded its time bound.
    Timeout,
    /// A lifecycle callback (initialize, start, stop) failed.
    Lifecycle,
    /// A health check panicked or timed out.
    HealthCheck,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::Lifecycle => "lifecycle",
            Self::HealthCheck => "health_check",
        };
        f.write_str(s)
    }
}

/// Immutable record of a module-sourced fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionFault {
    pub id: Uuid,
    pub module: String,
    pub kind: FaultKind,
    pub message: String,
    /// Where it happened, e.g. `route GET /ping` or `hook post_request`.
    pub context: String,
    pub location: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ExtensionFault {
    pub fn new(
        module: impl Into<String>,
        kind: FaultKind,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            kind,
            message: message.into(),
            context: context.into(),
            location: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }
}

/// Bounded per-module fault history. Oldest records are evicted first.
#[derive(Debug)]
pub struct FaultLog {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<ExtensionFault>>>,
}

impl FaultLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Log and store a fault.
    pub fn record(&self, fault: ExtensionFault) {
        error!(
            category = "extensions",
            module = %fault.module,
            fault_id = %fault.id,
            kind = %fault.kind,
            context = %fault.context,
            location = fault.location.as_deref().unwrap_or("unknown"),
            "Extension fault: {}",
            fault.message
        );
        let mut entries = self.entries.lock();
        let log = entries.entry(fault.module.clone()).or_default();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(fault);
    }

    /// Faults for `module`, oldest first.
    pub fn for_module(&self, module: &str) -> Vec<ExtensionFault> {
        self.entries
            .lock()
            .get(module)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, module: &str) -> usize {
        self.entries.lock().get(module).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_call_completed_and_failed() {
        let ok = guard_call(Duration::from_secs(1), async { Ok::<_, ExtensionError>(7) }).await;
        assert!(matches!(ok, CallOutcome::Completed(7)));

        let failed = guard_call(Duration::from_secs(1), async {
            Err::<(), _>(ExtensionError::NotFound("row".into()))
        })
        .await;
        assert!(matches!(failed, CallOutcome::Failed(ExtensionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_guard_call_catches_panic() {
        install_extension_panic_hook();
        let outcome = guard_call(Duration::from_secs(1), async {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), ExtensionError>(())
        })
        .await;
        match outcome {
            CallOutcome::Panicked { message, location } => {
                assert_eq!(message, "handler exploded");
                assert!(location.is_some_and(|l| l.contains("safety.rs")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_call_times_out() {
        let outcome = guard_call(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), ExtensionError>(())
        })
        .await;
        assert!(matches!(outcome, CallOutcome::TimedOut(d) if d == Duration::from_millis(50)));
        assert!(matches!(
            outcome.into_result(),
            Err(ExtensionError::Timeout(_))
        ));
    }

    #[test]
    fn test_guard_sync_catches_panic() {
        let outcome = guard_sync(|| -> Vec<u8> { panic!("{}", "bad\nline") });
        match outcome {
            CallOutcome::Panicked { message, .. } => assert_eq!(message, "bad line"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(guard_sync(|| 1).is_completed());
    }

    #[test]
    fn test_panic_message_is_capped() {
        let long = "x".repeat(MAX_PANIC_MESSAGE_CHARS + 10);
        let payload: Box<dyn Any + Send> = Box::new(long);
        let message = panic_message(payload.as_ref());
        assert!(message.ends_with("..."));
        assert_eq!(message.chars().count(), MAX_PANIC_MESSAGE_CHARS + 3);

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_fault_log_is_bounded_per_module() {
        let log = FaultLog::new(2);
        for i in 0..3 {
            log.record(ExtensionFault::new(
                "analytics",
                FaultKind::Panic,
                format!("fault {i}"),
                "route GET /ping",
            ));
        }
        log.record(ExtensionFault::new("billing", FaultKind::Timeout, "slow", "hook"));

        let faults = log.for_module("analytics");
        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].message, "fault 1");
        assert_eq!(log.count("billing"), 1);
        assert!(log.for_module("unknown").is_empty());
    }
}
