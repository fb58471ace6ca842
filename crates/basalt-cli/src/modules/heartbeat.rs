//! `heartbeat` module.
//!
//! Records a beat every `interval_secs` into its `beats` table and serves
//! the latest one at `GET /status`. Health degrades when beats stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use basalt_core::extension::{
    ConfigField, ConfigSchema, Extension, ExtensionServices, HealthReport, LifecycleContext,
    Migration, MigrationStep, ModuleDescriptor, ModuleRouter, Permission, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

const DEFAULT_INTERVAL_SECS: u64 = 60;
const BEATS_TABLE: &str = "beats";
const LATEST_KEY: &str = "latest";

#[derive(Debug)]
struct BeatState {
    beats: AtomicU64,
    interval_secs: AtomicU64,
    last_beat: Mutex<Option<DateTime<Utc>>>,
}

impl BeatState {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed).max(1))
    }

    fn snapshot(&self) -> Value {
        json!({
            "beats": self.beats.load(Ordering::Relaxed),
            "last_beat": *self.last_beat.lock(),
            "interval_secs": self.interval_secs.load(Ordering::Relaxed),
        })
    }

    /// Count one beat and persist it as the latest row.
    fn beat(&self, services: &ExtensionServices) -> Result<()> {
        let now = Utc::now();
        let count = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_beat.lock() = Some(now);
        services
            .data()
            .put(BEATS_TABLE, LATEST_KEY, &json!({ "count": count, "at": now }))
    }

    /// A beat is late once three intervals have passed without one.
    fn is_late(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = *self.last_beat.lock() else {
            return false;
        };
        let allowed = chrono::Duration::from_std(self.interval() * 3)
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - last > allowed
    }
}

fn interval_from(config: &Value) -> u64 {
    config
        .get("interval_secs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_INTERVAL_SECS)
}

#[derive(Debug)]
pub struct Heartbeat {
    state: Arc<BeatState>,
    services: Mutex<Option<ExtensionServices>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BeatState {
                beats: AtomicU64::new(0),
                interval_secs: AtomicU64::new(DEFAULT_INTERVAL_SECS),
                last_beat: Mutex::new(None),
            }),
            services: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Extension for Heartbeat {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("heartbeat", semver::Version::new(1, 0, 0))
            .with_description("Periodic liveness beats")
            .with_tag("ops")
    }

    async fn initialize(&self, _ctx: &LifecycleContext, services: ExtensionServices) -> Result<()> {
        let config = services.config().get()?;
        self.state
            .interval_secs
            .store(interval_from(&config), Ordering::Relaxed);
        *self.services.lock() = Some(services);
        Ok(())
    }

    async fn start(&self, _ctx: &LifecycleContext) -> Result<()> {
        let Some(services) = self.services.lock().clone() else {
            return Ok(());
        };
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let logger = services.logger();
            loop {
                tokio::time::sleep(state.interval()).await;
                if services.is_revoked() {
                    break;
                }
                if let Err(e) = state.beat(&services) {
                    logger.warn(&format!("failed to record beat: {e}"));
                }
            }
        });
        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self, _ctx: &LifecycleContext) -> Result<()> {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn health(&self, _ctx: &LifecycleContext) -> Result<HealthReport> {
        if self.state.is_late(Utc::now()) {
            return Ok(HealthReport::degraded("beats are late"));
        }
        Ok(HealthReport::healthy())
    }

    fn routes(&self, router: &mut ModuleRouter) {
        let state = self.state.clone();
        router.get("/status", move |_req| {
            let state = state.clone();
            async move { Ok(Json(state.snapshot())) }
        });
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field(
            ConfigField::integer("interval_secs")
                .bounds(1, 3600)
                .default_value(json!(DEFAULT_INTERVAL_SECS))
                .describe("Seconds between beats"),
        )
    }

    async fn apply_config(&self, config: &Value) -> Result<()> {
        self.state
            .interval_secs
            .store(interval_from(config), Ordering::Relaxed);
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![Migration::new(1, "create beats")
            .up(MigrationStep::create_table(BEATS_TABLE))
            .down(MigrationStep::drop_table(BEATS_TABLE))]
    }

    fn permissions(&self) -> Vec<Permission> {
        vec![
            Permission::DataRead,
            Permission::DataWrite,
            Permission::ConfigRead,
        ]
    }
}
