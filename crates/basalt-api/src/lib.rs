//! HTTP host wiring for the Basalt extension runtime.
//!
//! Mounts module routes under the runtime namespace, runs the request hook
//! chains around the host's own routes and exposes an admin surface over
//! the registry's public API.

pub mod handlers;
pub mod models;
pub mod server;

pub use models::{ApiResponse, ErrorResponse};
pub use server::{create_router, serve, ServerState};
