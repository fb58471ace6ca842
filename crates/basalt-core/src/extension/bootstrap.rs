//! Host bootstrap: register the compiled-in modules and enable the ones
//! the configuration asks for.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::contract::DynExtension;
use super::registry::Registry;
use super::safety::guard_sync;
use crate::config::ExtensionsConfig;

/// One module that could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapFailure {
    pub module: String,
    pub error: String,
}

/// What `bootstrap` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// Registration order.
    pub registered: Vec<String>,
    pub enabled: Vec<String>,
    /// Registered but left off by configuration.
    pub skipped: Vec<String>,
    pub failures: Vec<BootstrapFailure>,
    /// Names in `load_order` with no compiled-in module.
    pub unknown: Vec<String>,
}

impl BootstrapReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unknown.is_empty()
    }

    fn fail(&mut self, module: &str, error: impl ToString) {
        warn!(
            category = "extensions",
            module,
            error = %error.to_string(),
            "Module bootstrap failed"
        );
        self.failures.push(BootstrapFailure {
            module: module.to_string(),
            error: error.to_string(),
        });
    }
}

/// Register `modules` and enable those configured on.
///
/// Modules named in `load_order` go first, in that order; the rest follow
/// by name. Either way a module is moved after its dependencies. Failures
/// are collected in the report and never abort the host.
pub async fn bootstrap(
    registry: &Registry,
    modules: Vec<DynExtension>,
    config: &ExtensionsConfig,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();

    let mut by_name: BTreeMap<String, (DynExtension, Vec<String>)> = BTreeMap::new();
    for module in modules {
        match guard_sync(|| module.descriptor()).into_result() {
            Ok(descriptor) => {
                if by_name.contains_key(&descriptor.name) {
                    report.fail(&descriptor.name, "module is compiled in more than once");
                    continue;
                }
                by_name.insert(descriptor.name, (module, descriptor.dependencies));
            }
            Err(e) => report.fail("<unknown>", e),
        }
    }

    for name in &config.load_order {
        if !by_name.contains_key(name) {
            warn!(category = "extensions", module = %name, "Unknown module in load order");
            report.unknown.push(name.clone());
        }
    }

    let dependencies: BTreeMap<&str, &[String]> = by_name
        .iter()
        .map(|(name, (_, deps))| (name.as_str(), deps.as_slice()))
        .collect();
    let order = load_order(&config.load_order, &dependencies);

    for name in order {
        let Some((module, _)) = by_name.get(&name) else {
            continue;
        };
        if let Err(e) = registry.register(module.clone()).await {
            report.fail(&name, e);
            continue;
        }
        report.registered.push(name.clone());

        let settings = config.settings(&name);
        if !settings.config.is_null() {
            if let Err(e) = registry.apply_config(&name, settings.config).await {
                report.fail(&name, e);
                continue;
            }
        }
        if !settings.enabled {
            report.skipped.push(name);
            continue;
        }
        match registry.enable(&name).await {
            Ok(()) => report.enabled.push(name),
            Err(e) => report.fail(&name, e),
        }
    }

    info!(
        category = "extensions",
        registered = report.registered.len(),
        enabled = report.enabled.len(),
        failed = report.failures.len(),
        "Extension bootstrap complete"
    );
    report
}

/// Dependency-safe order preferring `preferred`, then name order.
///
/// Modules in a cycle or depending on something that is not compiled in
/// are appended last; registering them reports the problem.
fn load_order(preferred: &[String], dependencies: &BTreeMap<&str, &[String]>) -> Vec<String> {
    let mut candidates: Vec<&str> = Vec::with_capacity(dependencies.len());
    for name in preferred {
        if dependencies.contains_key(name.as_str()) && !candidates.contains(&name.as_str()) {
            candidates.push(name.as_str());
        }
    }
    for name in dependencies.keys() {
        if !candidates.contains(name) {
            candidates.push(*name);
        }
    }

    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(candidates.len());
    while order.len() < candidates.len() {
        let next = candidates.iter().find(|name| {
            !placed.contains(**name)
                && dependencies[**name]
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
        });
        match next {
            Some(name) => {
                placed.insert(name);
                order.push(name.to_string());
            }
            None => {
                for name in &candidates {
                    if placed.insert(name) {
                        order.push(name.to_string());
                    }
                }
            }
        }
    }
    order
}
