//! API handlers organized by domain.

pub mod basic;
pub mod common;
pub mod extensions;

// Re-export ServerState so handlers can use it
pub use crate::server::ServerState;

pub use basic::health_handler;
