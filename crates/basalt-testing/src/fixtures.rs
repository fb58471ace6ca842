//! Fixture modules for common scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::Json;
use basalt_core::extension::{
    Extension, ExtensionError, ExtensionServices, HookPoint, HookRegistrar, LifecycleContext,
    Migration, MigrationStep, ModuleDescriptor, ModuleRouter, Permission, Request, Result,
    UserInfo,
};
use parking_lot::Mutex;
use serde_json::json;

const ECHO_BODY_LIMIT: usize = 64 * 1024;

/// `analytics` module: an `events` table, `GET /ping`, and a post-request
/// hook that counts host requests and logs each one as an event row.
#[derive(Debug, Default)]
pub struct AnalyticsFixture {
    counter: Arc<AtomicUsize>,
    services: Mutex<Option<ExtensionServices>>,
}

impl AnalyticsFixture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests seen by the post-request hook.
    pub fn counter(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Façade handed over at the last initialize.
    pub fn services(&self) -> Option<ExtensionServices> {
        self.services.lock().clone()
    }
}

#[async_trait]
impl Extension for AnalyticsFixture {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("analytics", semver::Version::new(1, 0, 0))
            .with_description("Counts host requests")
    }

    async fn initialize(&self, _ctx: &LifecycleContext, services: ExtensionServices) -> Result<()> {
        *self.services.lock() = Some(services);
        Ok(())
    }

    fn routes(&self, router: &mut ModuleRouter) {
        router.get("/ping", |_req| async { Ok("pong") });
    }

    fn hooks(&self, hooks: &mut HookRegistrar) {
        let counter = self.counter.clone();
        hooks.on(HookPoint::PostRequest, 0, move |ctx| {
            let counter = counter.clone();
            async move {
                let seq = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let (path, status) = match (ctx.request(), ctx.response()) {
                    (Some(req), Some(res)) => (req.path.clone(), res.status),
                    (Some(req), None) => (req.path.clone(), 0),
                    _ => (String::new(), 0),
                };
                ctx.services().data().put(
                    "events",
                    &format!("{seq:010}"),
                    &json!({ "path": path, "status": status }),
                )
            }
        });
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![Migration::new(1, "create events")
            .up(MigrationStep::create_table("events"))
            .down(MigrationStep::drop_table("events"))]
    }

    fn permissions(&self) -> Vec<Permission> {
        vec![Permission::DataRead, Permission::DataWrite]
    }
}

/// Module with echo routes, named by the caller.
///
/// - `GET /echo` returns the path and query as JSON
/// - `POST /echo` returns the request body
/// - `GET /whoami` requires a user and returns its name
#[derive(Debug)]
pub struct EchoFixture {
    name: String,
}

impl EchoFixture {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

async fn echo_get(req: Request) -> Result<Json<serde_json::Value>> {
    Ok(Json(json!({
        "path": req.uri().path(),
        "query": req.uri().query(),
    })))
}

async fn echo_post(req: Request) -> Result<Vec<u8>> {
    let body = to_bytes(req.into_body(), ECHO_BODY_LIMIT)
        .await
        .map_err(|e| ExtensionError::InvalidInput(e.to_string()))?;
    Ok(body.to_vec())
}

async fn whoami(req: Request) -> Result<String> {
    req.extensions()
        .get::<UserInfo>()
        .map(|u| u.username.clone())
        .ok_or_else(|| ExtensionError::Unauthorized("no user".to_string()))
}

#[async_trait]
impl Extension for EchoFixture {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(self.name.clone(), semver::Version::new(1, 0, 0))
    }

    async fn initialize(&self, _ctx: &LifecycleContext, _services: ExtensionServices) -> Result<()> {
        Ok(())
    }

    fn routes(&self, router: &mut ModuleRouter) {
        router.get("/echo", echo_get);
        router.post("/echo", echo_post);
        router.get("/whoami", whoami).require_auth();
    }
}
