//! Shared server state.

use std::sync::Arc;

use basalt_core::extension::{IdentityProvider, Registry};

/// Maximum request body size accepted by the host (10 MiB).
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Role required for the administrative surface.
pub const ADMIN_ROLE: &str = "admin";

/// State handed to every handler.
///
/// The registry is constructed once by host bootstrap and passed in here;
/// there is no process-wide instance.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Registry,

    /// Resolves bearer tokens for admin and request hook context.
    pub identity: Arc<dyn IdentityProvider>,

    /// Server start timestamp.
    pub started_at: i64,
}

impl ServerState {
    pub fn new(registry: Registry, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            registry,
            identity,
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("registry", &self.registry)
            .field("started_at", &self.started_at)
            .finish()
    }
}
