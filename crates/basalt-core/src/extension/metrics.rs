//! Per-module counters, latency estimate and health tracking.
//!
//! A fresh [`ModuleMetrics`] is created on every enable, so counters reset
//! only there. Everything else updates them monotonically.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{HealthReport, HealthState};

/// Samples kept by the latency reservoir.
pub const LATENCY_SAMPLES: usize = 1024;

/// Bounded ring of recent latencies, in microseconds.
#[derive(Debug)]
pub struct LatencyReservoir {
    samples: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    values: Vec<u64>,
    next: usize,
}

impl Default for LatencyReservoir {
    fn default() -> Self {
        Self {
            samples: Mutex::new(Ring {
                values: Vec::with_capacity(LATENCY_SAMPLES),
                next: 0,
            }),
        }
    }
}

impl LatencyReservoir {
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut ring = self.samples.lock();
        if ring.values.len() < LATENCY_SAMPLES {
            ring.values.push(micros);
        } else {
            let slot = ring.next;
            ring.values[slot] = micros;
        }
        ring.next = (ring.next + 1) % LATENCY_SAMPLES;
    }

    /// Nearest-rank percentiles over the retained samples.
    pub fn percentiles(&self) -> LatencyPercentiles {
        let mut values = self.samples.lock().values.clone();
        if values.is_empty() {
            return LatencyPercentiles::default();
        }
        values.sort_unstable();
        let rank = |p: f64| {
            let idx = ((p * values.len() as f64).ceil() as usize).clamp(1, values.len()) - 1;
            values[idx]
        };
        LatencyPercentiles {
            samples: values.len(),
            p50_us: rank(0.50),
            p95_us: rank(0.95),
            p99_us: rank(0.99),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub samples: usize,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Counters updated by the dispatch adapters.
#[derive(Debug)]
pub struct ModuleMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    hook_invocations: AtomicU64,
    hook_errors: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
    latency: LatencyReservoir,
    enabled_at: DateTime<Utc>,
    resources: ResourceCounts,
}

impl ModuleMetrics {
    pub fn new(resources: ResourceCounts) -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            hook_invocations: AtomicU64::new(0),
            hook_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            latency: LatencyReservoir::default(),
            enabled_at: Utc::now(),
            resources,
        }
    }

    /// Record one finished route request.
    pub fn record_request(&self, latency: Duration, is_error: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub fn record_hook(&self, is_error: bool) {
        self.hook_invocations.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.hook_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn resources(&self) -> &ResourceCounts {
        &self.resources
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests(),
            errors: self.errors(),
            hook_invocations: self.hook_invocations.load(Ordering::Relaxed),
            hook_errors: self.hook_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            latency: self.latency.percentiles(),
            resources: self.resources.clone(),
            enabled_at: self.enabled_at,
        }
    }
}

/// Serializable view of [`ModuleMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub hook_invocations: u64,
    pub hook_errors: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub latency: LatencyPercentiles,
    pub resources: ResourceCounts,
    pub enabled_at: DateTime<Utc>,
}

/// What a module declared, counted at enable time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub routes: usize,
    pub middleware: usize,
    pub hooks: usize,
    pub migrations: usize,
    pub templates: usize,
    pub static_assets: usize,
    pub permissions: usize,
}

// ============================================================================
// Health
// ============================================================================

/// Health of one module as seen by the poller. Advisory only.
#[derive(Debug)]
pub struct HealthTracker {
    module: String,
    threshold: u32,
    consecutive_failures: AtomicU32,
    last: Mutex<Option<HealthStatus>>,
}

/// Last recorded health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

impl HealthTracker {
    pub fn new(module: impl Into<String>, threshold: u32) -> Self {
        Self {
            module: module.into(),
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            last: Mutex::new(None),
        }
    }

    /// Record a check that ran to completion.
    pub fn record_report(&self, report: HealthReport) -> HealthStatus {
        match report.state {
            HealthState::Healthy | HealthState::Unknown => {
                let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous >= self.threshold {
                    info!(module = %self.module, "Module health recovered");
                }
                self.store(report.state, report.message, 0)
            }
            HealthState::Degraded | HealthState::Unhealthy => {
                self.record_failure(report.message.unwrap_or_else(|| report.state.to_string()))
            }
        }
    }

    /// Record a failed, panicked or timed-out check.
    pub fn record_failure(&self, message: impl Into<String>) -> HealthStatus {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let state = if failures >= self.threshold {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
        if failures == self.threshold {
            warn!(module = %self.module, failures, "Module unhealthy (threshold reached)");
        }
        self.store(state, Some(message.into()), failures)
    }

    fn store(&self, state: HealthState, message: Option<String>, failures: u32) -> HealthStatus {
        let status = HealthStatus {
            state,
            message,
            consecutive_failures: failures,
            checked_at: Utc::now(),
        };
        *self.last.lock() = Some(status.clone());
        status
    }

    pub fn state(&self) -> HealthState {
        self.last
            .lock()
            .as_ref()
            .map_or(HealthState::Unknown, |s| s.state)
    }

    pub fn last(&self) -> Option<HealthStatus> {
        self.last.lock().clone()
    }
}
