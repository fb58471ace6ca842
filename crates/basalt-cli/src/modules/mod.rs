//! Modules compiled into this build.
//!
//! Each module sits behind a cargo feature of the same name. Adding one
//! means adding the feature, the module file and a line in
//! [`compiled_modules`].

#[cfg(feature = "heartbeat")]
pub mod heartbeat;

use basalt_core::extension::DynExtension;

/// Fresh instances of every compiled-in module.
pub fn compiled_modules() -> Vec<DynExtension> {
    #[allow(unused_mut)]
    let mut modules: Vec<DynExtension> = Vec::new();
    #[cfg(feature = "heartbeat")]
    modules.push(std::sync::Arc::new(heartbeat::Heartbeat::new()));
    modules
}
