//! Shared fixtures for the extension runtime integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::Method;
use basalt_core::extension::{
    ConfigSchema, Extension, ExtensionError, ExtensionServices, HealthReport, HookRegistrar,
    HostServices, LifecycleContext, Migration, ModuleDescriptor, ModuleRouter, Permission,
    Registry, Request, Response, Result,
};
use basalt_core::RuntimeConfig;
use parking_lot::Mutex;
use serde_json::Value;

type RouteFn = Box<dyn Fn(&mut ModuleRouter) + Send + Sync>;
type HookFn = Box<dyn Fn(&mut HookRegistrar) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
}

/// Configurable module used across the tests.
pub struct TestModule {
    descriptor: ModuleDescriptor,
    init: Mutex<Behavior>,
    start: Behavior,
    stop: Behavior,
    health: Mutex<Behavior>,
    routes: Vec<RouteFn>,
    hooks: Vec<HookFn>,
    migrations: Mutex<Vec<Migration>>,
    permissions: Vec<Permission>,
    schema: ConfigSchema,
    apply: Mutex<Behavior>,
    pub services: Mutex<Option<ExtensionServices>>,
    pub inits: AtomicUsize,
    pub stops: AtomicUsize,
    pub applied: Mutex<Vec<Value>>,
}

impl TestModule {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name, semver::Version::new(1, 0, 0)),
            init: Mutex::new(Behavior::Succeed),
            start: Behavior::Succeed,
            stop: Behavior::Succeed,
            health: Mutex::new(Behavior::Succeed),
            routes: Vec::new(),
            hooks: Vec::new(),
            migrations: Mutex::new(Vec::new()),
            permissions: Vec::new(),
            schema: ConfigSchema::any(),
            apply: Mutex::new(Behavior::Succeed),
            services: Mutex::new(None),
            inits: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn with_descriptor(mut self, descriptor: ModuleDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_init(self, behavior: Behavior) -> Self {
        *self.init.lock() = behavior;
        self
    }

    pub fn with_start(mut self, behavior: Behavior) -> Self {
        self.start = behavior;
        self
    }

    pub fn with_stop(mut self, behavior: Behavior) -> Self {
        self.stop = behavior;
        self
    }

    pub fn with_routes(mut self, f: impl Fn(&mut ModuleRouter) + Send + Sync + 'static) -> Self {
        self.routes.push(Box::new(f));
        self
    }

    pub fn with_hooks(mut self, f: impl Fn(&mut HookRegistrar) + Send + Sync + 'static) -> Self {
        self.hooks.push(Box::new(f));
        self
    }

    pub fn with_migrations(self, migrations: Vec<Migration>) -> Self {
        *self.migrations.lock() = migrations;
        self
    }

    pub fn with_permissions(mut self, permissions: &[Permission]) -> Self {
        self.permissions = permissions.to_vec();
        self
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn set_init(&self, behavior: Behavior) {
        *self.init.lock() = behavior;
    }

    pub fn set_health(&self, behavior: Behavior) {
        *self.health.lock() = behavior;
    }

    pub fn set_apply(&self, behavior: Behavior) {
        *self.apply.lock() = behavior;
    }

    pub fn set_migrations(&self, migrations: Vec<Migration>) {
        *self.migrations.lock() = migrations;
    }

    pub fn services(&self) -> ExtensionServices {
        self.services.lock().clone().expect("module was initialized")
    }
}

fn run(behavior: Behavior, what: &str) -> Result<()> {
    match behavior {
        Behavior::Succeed => Ok(()),
        Behavior::Fail => Err(ExtensionError::ExecutionFailed(format!("{what} failed"))),
        Behavior::Panic => panic!("{what} exploded"),
    }
}

#[async_trait]
impl Extension for TestModule {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    async fn initialize(&self, _ctx: &LifecycleContext, services: ExtensionServices) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.init.lock();
        run(behavior, "initialize")?;
        *self.services.lock() = Some(services);
        Ok(())
    }

    async fn start(&self, _ctx: &LifecycleContext) -> Result<()> {
        run(self.start, "start")
    }

    async fn stop(&self, _ctx: &LifecycleContext) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        run(self.stop, "stop")
    }

    async fn health(&self, _ctx: &LifecycleContext) -> Result<HealthReport> {
        let behavior = *self.health.lock();
        run(behavior, "health")?;
        Ok(HealthReport::healthy())
    }

    fn routes(&self, router: &mut ModuleRouter) {
        for f in &self.routes {
            f(router);
        }
    }

    fn hooks(&self, hooks: &mut HookRegistrar) {
        for f in &self.hooks {
            f(hooks);
        }
    }

    fn config_schema(&self) -> ConfigSchema {
        self.schema.clone()
    }

    async fn apply_config(&self, config: &Value) -> Result<()> {
        let behavior = *self.apply.lock();
        run(behavior, "apply_config")?;
        self.applied.lock().push(config.clone());
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        self.migrations.lock().clone()
    }

    fn permissions(&self) -> Vec<Permission> {
        self.permissions.clone()
    }
}

pub fn registry() -> Registry {
    registry_with(RuntimeConfig::default())
}

pub fn registry_with(config: RuntimeConfig) -> Registry {
    Registry::new(config, HostServices::in_memory())
}

/// Register and enable `module`, returning the shared handle.
pub async fn install(registry: &Registry, module: TestModule) -> Arc<TestModule> {
    let module = Arc::new(module);
    registry.register(module.clone()).await.expect("register");
    registry
        .enable(&module.descriptor.name)
        .await
        .expect("enable");
    module
}

pub fn request(method: Method, uri: &str) -> Request {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("valid request")
}

pub fn get(uri: &str) -> Request {
    request(Method::GET, uri)
}

pub async fn body_string(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Poll `condition` until it holds; background teardown runs on spawned tasks.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Shared call log for ordering assertions.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Handler body that panics, usable wherever a module callback is expected.
pub async fn explode<T>(what: &'static str) -> Result<T> {
    panic!("{what} exploded")
}

/// Handler body that outlives short test timeouts.
pub async fn linger<T>(value: T) -> Result<T> {
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(value)
}
