//! Core runtime for the Basalt backend platform.
//!
//! The crate hosts the extension runtime: compiled-in modules extend the
//! host's routing, request pipeline, configuration and persisted schema
//! through a [`Registry`](extension::Registry) that isolates them from the
//! host and from each other.

pub mod config;
pub mod extension;

pub use config::{ExtensionsConfig, IsolationPolicy, ModuleSettings, RuntimeConfig};
pub use extension::{
    Extension, ExtensionError, ExtensionServices, HookPoint, ModuleDescriptor, ModuleStatus,
    Registry, RegistryError,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn test_version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
