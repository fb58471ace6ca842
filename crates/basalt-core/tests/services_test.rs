//! Capability façade tests through the registry
//!
//! Each enabled module gets services scoped to its own schema, storage
//! prefix and declared permissions, revoked again when it is disabled.

mod common;

use basalt_core::extension::{
    ExtensionError, Migration, MigrationStep, Permission, UserInfo,
};
use basalt_core::RuntimeConfig;
use common::{install, registry, registry_with, TestModule};
use serde_json::json;

fn with_table(name: &str, table: &str, permissions: &[Permission]) -> TestModule {
    TestModule::new(name)
        .with_migrations(vec![
            Migration::new(1, "create table").up(MigrationStep::create_table(table))
        ])
        .with_permissions(permissions)
}

#[tokio::test]
async fn test_data_is_confined_to_own_schema() {
    let registry = registry();
    let rw = [Permission::DataRead, Permission::DataWrite];
    let analytics = install(&registry, with_table("analytics", "events", &rw)).await;
    let billing = install(&registry, with_table("billing", "invoices", &rw)).await;

    let data = analytics.services().data();
    assert_eq!(data.schema(), "ext_analytics");
    data.put("events", "e1", &json!({ "kind": "click" })).unwrap();

    assert!(!billing.services().data().table_exists("events").unwrap());
    assert!(!data.table_exists("invoices").unwrap());
    assert!(matches!(
        data.put("invoices", "i1", &json!(1)),
        Err(ExtensionError::NotFound(_))
    ));
    // Schema-qualified names are not accepted.
    assert!(data.get_value("ext_billing.invoices", "i1").is_err());

    let rows: Vec<(String, serde_json::Value)> = data.scan("events", "e", None).unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_undeclared_permissions_are_denied() {
    let registry = registry();
    let module = install(
        &registry,
        with_table("analytics", "events", &[Permission::DataRead]),
    )
    .await;
    let services = module.services();

    assert!(services.data().table_exists("events").unwrap());
    assert!(matches!(
        services.data().put("events", "k", &json!(1)),
        Err(ExtensionError::PermissionDenied(_))
    ));
    assert!(matches!(
        services.storage().put("report.csv", b"a,b"),
        Err(ExtensionError::PermissionDenied(_))
    ));
    assert!(matches!(
        services.config().get(),
        Err(ExtensionError::PermissionDenied(_))
    ));
    assert!(matches!(
        services.identity().user("u1").await,
        Err(ExtensionError::PermissionDenied(_))
    ));
    assert_eq!(
        registry.get("analytics").unwrap().permissions,
        vec![Permission::DataRead]
    );
}

#[tokio::test]
async fn test_storage_is_prefixed_per_module() {
    let registry = registry();
    let rw = [Permission::StorageRead, Permission::StorageWrite];
    let a = install(&registry, TestModule::new("a").with_permissions(&rw)).await;
    let b = install(&registry, TestModule::new("b").with_permissions(&rw)).await;

    let storage = a.services().storage();
    assert_eq!(storage.prefix(), "modules/a/");
    storage.put("reports/today.csv", b"1,2,3").unwrap();

    assert_eq!(storage.list("").unwrap(), vec!["reports/today.csv"]);
    assert!(b.services().storage().get("reports/today.csv").unwrap().is_none());
    assert!(b.services().storage().list("").unwrap().is_empty());
    assert!(matches!(
        storage.get("../b/secret"),
        Err(ExtensionError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_storage_quota_is_enforced() {
    let registry = registry_with(RuntimeConfig {
        storage_quota_bytes: 8,
        ..Default::default()
    });
    let module = install(
        &registry,
        TestModule::new("a").with_permissions(&[Permission::StorageRead, Permission::StorageWrite]),
    )
    .await;
    let storage = module.services().storage();

    storage.put("one", b"12345").unwrap();
    assert!(matches!(
        storage.put("two", b"12345"),
        Err(ExtensionError::QuotaExceeded { quota: 8, .. })
    ));
    // Replacing a blob only counts the difference.
    storage.put("one", b"12345678").unwrap();
    assert_eq!(storage.usage().unwrap(), 8);
}

#[tokio::test]
async fn test_services_are_revoked_on_disable() {
    let registry = registry();
    let module = install(
        &registry,
        with_table("analytics", "events", &[Permission::DataRead, Permission::ConfigRead]),
    )
    .await;
    let services = module.services();
    assert!(services.config().get().is_ok());

    registry.disable("analytics").await.unwrap();
    assert!(services.is_revoked());
    assert!(matches!(
        services.data().table_exists("events"),
        Err(ExtensionError::PermissionDenied(_))
    ));
    assert!(matches!(
        services.config().get(),
        Err(ExtensionError::PermissionDenied(_))
    ));

    // The next generation gets a fresh façade.
    registry.enable("analytics").await.unwrap();
    assert!(module.services().data().table_exists("events").unwrap());
    assert!(services.is_revoked());
}

#[tokio::test]
async fn test_identity_lookups_go_through_host_provider() {
    let registry = registry();
    let module = install(
        &registry,
        TestModule::new("profile").with_permissions(&[Permission::IdentityRead]),
    )
    .await;

    let identity = module.services().identity();
    let user: Option<UserInfo> = identity.user("u1").await.unwrap();
    assert!(user.is_none());
    assert!(identity.validate_token("nope").await.unwrap().is_none());
    assert!(!identity.has_permission("u1", "read").await.unwrap());
}
