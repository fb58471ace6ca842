//! Persistence tests
//!
//! Module schemas, migration history and blobs survive a host restart when
//! the registry runs on the redb-backed stores.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use basalt_core::extension::{
    Extension, ExtensionServices, LifecycleContext, Migration, MigrationStep, ModuleDescriptor,
    NoIdentity, Permission, Registry, Result,
};
use basalt_core::RuntimeConfig;
use basalt_storage::{open_host_services, StorageConfig};
use parking_lot::Mutex;
use serde_json::json;

struct Journal {
    services: Mutex<Option<ExtensionServices>>,
}

impl Journal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(None),
        })
    }

    fn services(&self) -> ExtensionServices {
        self.services.lock().clone().unwrap()
    }
}

#[async_trait]
impl Extension for Journal {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("journal", semver::Version::new(1, 0, 0))
    }

    async fn initialize(&self, _ctx: &LifecycleContext, services: ExtensionServices) -> Result<()> {
        *self.services.lock() = Some(services);
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![
            Migration::new(1, "create entries")
                .up(MigrationStep::create_table("entries"))
                .down(MigrationStep::drop_table("entries")),
        ]
    }

    fn permissions(&self) -> Vec<Permission> {
        vec![
            Permission::DataRead,
            Permission::DataWrite,
            Permission::StorageRead,
            Permission::StorageWrite,
        ]
    }
}

async fn start_host(path: &Path) -> (Registry, Arc<Journal>) {
    let host = open_host_services(
        &StorageConfig::new(path.to_string_lossy().to_string()),
        Arc::new(NoIdentity),
    )
    .unwrap();
    let registry = Registry::new(RuntimeConfig::default(), host);
    let module = Journal::new();
    registry.register(module.clone()).await.unwrap();
    registry.enable("journal").await.unwrap();
    (registry, module)
}

#[tokio::test]
async fn test_module_data_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basalt.redb");

    {
        let (registry, module) = start_host(&path).await;
        let services = module.services();
        services
            .data()
            .put("entries", "2026-01-01", &json!({ "text": "hello" }))
            .unwrap();
        services.storage().put("exports/all.txt", b"hello").unwrap();
        registry.shutdown().await;
    }

    let (registry, module) = start_host(&path).await;
    let services = module.services();
    let entry: Option<serde_json::Value> = services.data().get("entries", "2026-01-01").unwrap();
    assert_eq!(entry, Some(json!({ "text": "hello" })));
    assert_eq!(
        services.storage().get("exports/all.txt").unwrap(),
        Some(b"hello".to_vec())
    );

    // The migration ran once, on the first start.
    let history = registry.migration_history("journal").await.unwrap();
    assert_eq!(history.len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_rollback_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basalt.redb");

    {
        let (registry, _module) = start_host(&path).await;
        registry.disable("journal").await.unwrap();
        let report = registry.rollback_migrations("journal", 0).await.unwrap();
        assert_eq!(report.to_version, 0);
        registry.shutdown().await;
    }

    let (registry, module) = start_host(&path).await;
    // Enabling again re-applied version 1 after the rollback.
    assert_eq!(registry.migration_history("journal").await.unwrap().len(), 3);
    assert!(module.services().data().table_exists("entries").unwrap());
    registry.shutdown().await;
}
