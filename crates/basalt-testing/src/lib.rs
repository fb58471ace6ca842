//! Testing utilities for Basalt modules
//!
//! This crate provides:
//! - [`TestHarness`]: an isolated registry over memory-backed services
//! - [`MockIdentity`]: an identity provider with fixed users and tokens
//! - Synthetic request and hook helpers returning [`TestResponse`]
//! - Fixture modules for common scenarios

pub mod fixtures;
pub mod harness;
pub mod identity;
pub mod response;

pub use fixtures::{AnalyticsFixture, EchoFixture};
pub use harness::TestHarness;
pub use identity::MockIdentity;
pub use response::TestResponse;
