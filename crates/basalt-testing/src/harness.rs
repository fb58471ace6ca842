//! Isolated registry for module tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request};
use basalt_core::extension::{
    default_schema_name, ExtensionServices, HookInput, HookOutcome, HookPoint, HostServices,
    MemoryBlobStorage, MemoryStore, Permission, PermissionSet, Registry, RegistryError,
    StoreError, StoreOp,
};
use basalt_core::{Extension, RuntimeConfig};
use serde_json::Value;

use crate::identity::MockIdentity;
use crate::response::TestResponse;

/// A registry over memory-backed services and a [`MockIdentity`].
///
/// Each harness is independent, so tests can run in parallel.
pub struct TestHarness {
    registry: Registry,
    identity: Arc<MockIdentity>,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStorage>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_identity(config, MockIdentity::new())
    }

    pub fn with_identity(config: RuntimeConfig, identity: MockIdentity) -> Self {
        let identity = Arc::new(identity);
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStorage::new());
        let host = HostServices::new(store.clone(), identity.clone(), blobs.clone());
        Self {
            registry: Registry::new(config, host),
            identity,
            store,
            blobs,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<MockIdentity> {
        &self.identity
    }

    /// Backing table store, for asserting on physical state.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn blobs(&self) -> &MemoryBlobStorage {
        &self.blobs
    }

    /// Register and enable `module`.
    pub async fn install<E: Extension>(&self, module: Arc<E>) -> Result<(), RegistryError> {
        let name = module.descriptor().name;
        self.registry.register(module).await?;
        self.registry.enable(&name).await
    }

    /// Send a request through the module route surface.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        TestResponse::from_response(self.registry.dispatch_route(request).await).await
    }

    pub async fn request(&self, method: Method, path: &str) -> TestResponse {
        self.send(build(method, path, None, Body::empty())).await
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(Method::GET, path).await
    }

    pub async fn request_with_token(&self, method: Method, path: &str, token: &str) -> TestResponse {
        self.send(build(method, path, Some(token), Body::empty())).await
    }

    /// Send `body` as JSON.
    pub async fn request_json(&self, method: Method, path: &str, body: &Value) -> TestResponse {
        let mut request = build(method, path, None, Body::from(body.to_string()));
        if let Ok(value) = "application/json".parse() {
            request.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        self.send(request).await
    }

    pub async fn dispatch_hook(&self, point: HookPoint) -> HookOutcome {
        self.registry.dispatch_hook(point, HookInput::new()).await
    }

    pub async fn dispatch_hook_with(&self, point: HookPoint, input: HookInput) -> HookOutcome {
        self.registry.dispatch_hook(point, input).await
    }

    /// A standalone façade for `module` over this harness's services, for
    /// unit-testing module code without registering it.
    ///
    /// No tables exist yet; create them with [`TestHarness::create_table`]
    /// before making data calls.
    pub fn services_for(
        &self,
        module: &str,
        permissions: &[Permission],
    ) -> ExtensionServices {
        let host = HostServices::new(
            self.store.clone(),
            self.identity.clone(),
            self.blobs.clone(),
        );
        ExtensionServices::new(
            module,
            default_schema_name(module),
            permissions.iter().copied().collect::<PermissionSet>(),
            host,
            Value::Null,
            self.registry.config().storage_quota_bytes,
        )
    }

    /// Create `table` in `module`'s default schema, as a migration would.
    pub fn create_table(&self, module: &str, table: &str) -> Result<(), StoreError> {
        use basalt_core::extension::SchemaStore;

        let table = format!("{}.{}", default_schema_name(module), table);
        self.store.apply(vec![StoreOp::CreateTable { table }])
    }
}

/// Panics on a malformed `path`, so a typo fails the test that made it.
fn build(method: Method, path: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match builder.body(body) {
        Ok(request) => request,
        Err(e) => panic!("invalid test request {path:?}: {e}"),
    }
}
