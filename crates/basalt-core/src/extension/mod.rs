//! Extension runtime.
//!
//! Modules are compiled into the host and implement [`Extension`]. The
//! [`Registry`] owns their lifecycle and exposes them to the host through
//! namespaced routes, prioritized hooks, templates and static assets. Each
//! module reaches host services only through its [`ExtensionServices`]
//! façade, scoped to its own schema, storage prefix and declared
//! permissions.
//!
//! Module code runs inside a fault boundary: a panic in a route handler,
//! middleware or hook handler disables the module instead of the host.

pub mod bootstrap;
pub mod config_schema;
pub mod contract;
pub mod hooks;
pub mod metrics;
pub mod migration;
pub mod permission;
pub mod registry;
pub mod routing;
pub mod safety;
pub mod services;
pub mod snapshot;
pub mod store;
pub mod types;

pub use bootstrap::{bootstrap, BootstrapReport};
pub use config_schema::{ConfigField, ConfigSchema, FieldKind, SchemaError};
pub use contract::{
    default_schema_name, DynExtension, Extension, LifecycleContext, StaticAsset, Template,
};
pub use hooks::{
    ChainPolicy, HookContext, HookFailure, HookFailureKind, HookInput, HookOutcome, HookPoint,
    HookRegistrar, RequestInfo, ResponseInfo,
};
pub use metrics::{HealthStatus, LatencyPercentiles, MetricsSnapshot, ResourceCounts};
pub use migration::{
    Migration, MigrationDirection, MigrationError, MigrationRecord, MigrationReport,
    MigrationRunner, MigrationStep,
};
pub use permission::{parse_permissions, Permission, PermissionError, PermissionSet};
pub use registry::{ConfigOutcome, Registry};
pub use routing::{
    bearer_token, AuthRequirement, ModuleRouter, Next, PathParams, Request, Response,
};
pub use safety::{install_extension_panic_hook, ExtensionFault, FaultKind};
pub use services::{
    ConfigAccess, DataAccess, ExtensionServices, HostServices, IdentityAccess, IdentityProvider,
    ModuleLogger, NoIdentity, ScopedStorage, UserInfo,
};
pub use snapshot::{HookSummary, ModuleInfo, RouteSummary, Snapshot};
pub use store::{
    BlobStorage, MemoryBlobStorage, MemoryStore, SchemaStore, StoreError, StoreOp,
};
pub use types::{
    ExtensionError, HealthReport, HealthState, InitStage, ModuleDescriptor, ModuleStatus,
    RegistrationError, RegistryError, Result,
};
