//! Capability façade handed to a module at enable time.
//!
//! [`ExtensionServices`] closes over the module's name, schema and declared
//! permissions. Every view it hands out (data, identity, storage, config,
//! logging) is narrowed to that module; nothing here accepts a schema name
//! or an unprefixed storage key. After the module is disabled the registry
//! revokes the façade and every call fails with `PermissionDenied`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::permission::{Permission, PermissionSet};
use super::store::{
    qualify, BlobStorage, MemoryBlobStorage, MemoryStore, SchemaStore, StoreOp,
};
use super::types::{ExtensionError, Result};

// ============================================================================
// Identity collaborator
// ============================================================================

/// Authenticated user as seen by modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Read-only identity service provided by the host.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn user(&self, id: &str) -> Result<Option<UserInfo>>;

    /// Resolves a bearer token to its user, `None` when invalid.
    async fn validate_token(&self, token: &str) -> Result<Option<UserInfo>>;

    async fn has_permission(&self, user_id: &str, permission: &str) -> Result<bool>;
}

/// Identity provider that knows no users.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

#[async_trait]
impl IdentityProvider for NoIdentity {
    async fn user(&self, _id: &str) -> Result<Option<UserInfo>> {
        Ok(None)
    }

    async fn validate_token(&self, _token: &str) -> Result<Option<UserInfo>> {
        Ok(None)
    }

    async fn has_permission(&self, _user_id: &str, _permission: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Full-access host services. Only the registry holds this.
#[derive(Clone)]
pub struct HostServices {
    pub store: Arc<dyn SchemaStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub blobs: Arc<dyn BlobStorage>,
}

impl HostServices {
    pub fn new(
        store: Arc<dyn SchemaStore>,
        identity: Arc<dyn IdentityProvider>,
        blobs: Arc<dyn BlobStorage>,
    ) -> Self {
        Self {
            store,
            identity,
            blobs,
        }
    }

    /// Memory-backed services with no known users.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoIdentity),
            Arc::new(MemoryBlobStorage::new()),
        )
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }
}

// ============================================================================
// Façade
// ============================================================================

struct ServicesInner {
    module: String,
    schema: String,
    permissions: PermissionSet,
    host: HostServices,
    config: RwLock<Value>,
    storage_quota: u64,
    /// Held across the usage check and the write of a blob put.
    storage_writes: Mutex<()>,
    revoked: AtomicBool,
}

impl ServicesInner {
    fn check(&self, permission: Permission) -> Result<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ExtensionError::PermissionDenied(format!(
                "services of module `{}` have been revoked",
                self.module
            )));
        }
        if !self.permissions.contains(permission) {
            return Err(ExtensionError::PermissionDenied(format!(
                "module `{}` did not declare `{}`",
                self.module, permission
            )));
        }
        Ok(())
    }
}

/// Per-module, access-narrowed view of host services.
#[derive(Clone)]
pub struct ExtensionServices {
    inner: Arc<ServicesInner>,
}

impl std::fmt::Debug for ExtensionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionServices")
            .field("module", &self.inner.module)
            .field("schema", &self.inner.schema)
            .field("permissions", &self.inner.permissions)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl ExtensionServices {
    /// Build a façade for `module`. The registry does this once per enable.
    pub fn new(
        module: impl Into<String>,
        schema: impl Into<String>,
        permissions: PermissionSet,
        host: HostServices,
        config: Value,
        storage_quota: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ServicesInner {
                module: module.into(),
                schema: schema.into(),
                permissions,
                host,
                config: RwLock::new(config),
                storage_quota,
                storage_writes: Mutex::new(()),
                revoked: AtomicBool::new(false),
            }),
        }
    }

    pub fn module(&self) -> &str {
        &self.inner.module
    }

    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.inner.permissions
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> DataAccess {
        DataAccess {
            inner: self.inner.clone(),
        }
    }

    pub fn identity(&self) -> IdentityAccess {
        IdentityAccess {
            inner: self.inner.clone(),
        }
    }

    pub fn storage(&self) -> ScopedStorage {
        ScopedStorage {
            prefix: format!("modules/{}/", self.inner.module),
            inner: self.inner.clone(),
        }
    }

    pub fn config(&self) -> ConfigAccess {
        ConfigAccess {
            inner: self.inner.clone(),
        }
    }

    pub fn logger(&self) -> ModuleLogger {
        ModuleLogger {
            module: self.inner.module.clone(),
        }
    }

    pub(crate) fn set_config(&self, config: Value) {
        *self.inner.config.write() = config;
    }

    pub(crate) fn revoke(&self) {
        self.inner.revoked.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Data access
// ============================================================================

/// Row access confined to the module's own schema.
///
/// Tables are created and dropped by migrations only.
pub struct DataAccess {
    inner: Arc<ServicesInner>,
}

impl DataAccess {
    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    fn table(&self, table: &str) -> Result<String> {
        Ok(qualify(&self.inner.schema, table)?)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.inner.check(Permission::DataRead)?;
        let table = self.table(table)?;
        Ok(self.inner.host.store.table_exists(&table)?)
    }

    pub fn get_value(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.inner.check(Permission::DataRead)?;
        let table = self.table(table)?;
        Ok(self.inner.host.store.get(&table, key)?)
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        self.get_value(table, key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn scan<T: DeserializeOwned>(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, T)>> {
        self.inner.check(Permission::DataRead)?;
        let table = self.table(table)?;
        self.inner
            .host
            .store
            .scan(&table, prefix, limit)?
            .into_iter()
            .map(|(k, v)| -> Result<(String, T)> { Ok((k, serde_json::from_value(v)?)) })
            .collect()
    }

    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        self.inner.check(Permission::DataWrite)?;
        let table = self.table(table)?;
        let value = serde_json::to_value(value)?;
        self.inner.host.store.apply(vec![StoreOp::Put {
            table,
            key: key.to_string(),
            value,
        }])?;
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.inner.check(Permission::DataWrite)?;
        let table = self.table(table)?;
        self.inner.host.store.apply(vec![StoreOp::Delete {
            table,
            key: key.to_string(),
        }])?;
        Ok(())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Read-only identity lookups.
pub struct IdentityAccess {
    inner: Arc<ServicesInner>,
}

impl IdentityAccess {
    pub async fn user(&self, id: &str) -> Result<Option<UserInfo>> {
        self.inner.check(Permission::IdentityRead)?;
        self.inner.host.identity.user(id).await
    }

    pub async fn validate_token(&self, token: &str) -> Result<Option<UserInfo>> {
        self.inner.check(Permission::IdentityRead)?;
        self.inner.host.identity.validate_token(token).await
    }

    pub async fn has_permission(&self, user_id: &str, permission: &str) -> Result<bool> {
        self.inner.check(Permission::IdentityRead)?;
        self.inner
            .host
            .identity
            .has_permission(user_id, permission)
            .await
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Blob storage under `modules/<name>/`, bounded by a per-module quota.
pub struct ScopedStorage {
    prefix: String,
    inner: Arc<ServicesInner>,
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(ExtensionError::InvalidInput(format!(
            "invalid storage key: {key}"
        )));
    }
    Ok(())
}

impl ScopedStorage {
    /// Prefix all keys of this module live under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.check(Permission::StorageWrite)?;
        let key = self.full_key(key)?;
        let blobs = &self.inner.host.blobs;
        let _write = self.inner.storage_writes.lock();
        let existing = blobs.get(&key)?.map(|b| b.len() as u64).unwrap_or(0);
        let used = blobs.usage(&self.prefix)?.saturating_sub(existing);
        let quota = self.inner.storage_quota;
        if used + data.len() as u64 > quota {
            return Err(ExtensionError::QuotaExceeded {
                used: used + data.len() as u64,
                quota,
            });
        }
        blobs.put(&key, data)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.check(Permission::StorageRead)?;
        let key = self.full_key(key)?;
        Ok(self.inner.host.blobs.get(&key)?)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.inner.check(Permission::StorageWrite)?;
        let key = self.full_key(key)?;
        Ok(self.inner.host.blobs.delete(&key)?)
    }

    /// Keys relative to the module prefix.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.check(Permission::StorageRead)?;
        if prefix.contains("..") || prefix.starts_with('/') {
            return Err(ExtensionError::InvalidInput(format!(
                "invalid storage prefix: {prefix}"
            )));
        }
        let full = format!("{}{}", self.prefix, prefix);
        Ok(self
            .inner
            .host
            .blobs
            .list(&full)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    pub fn usage(&self) -> Result<u64> {
        self.inner.check(Permission::StorageRead)?;
        Ok(self.inner.host.blobs.usage(&self.prefix)?)
    }

    pub fn quota(&self) -> u64 {
        self.inner.storage_quota
    }
}

// ============================================================================
// Config & logging
// ============================================================================

/// Read access to the module's current configuration.
pub struct ConfigAccess {
    inner: Arc<ServicesInner>,
}

impl ConfigAccess {
    pub fn get(&self) -> Result<Value> {
        self.inner.check(Permission::ConfigRead)?;
        Ok(self.inner.config.read().clone())
    }

    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.get()?)?)
    }

    /// Value at a JSON pointer such as `/retention/days`.
    pub fn value_at(&self, pointer: &str) -> Result<Option<Value>> {
        self.inner.check(Permission::ConfigRead)?;
        Ok(self.inner.config.read().pointer(pointer).cloned())
    }
}

/// Logger that tags every event with the owning module.
#[derive(Debug, Clone)]
pub struct ModuleLogger {
    module: String,
}

impl ModuleLogger {
    pub fn debug(&self, message: &str) {
        tracing::debug!(category = "extension", module = %self.module, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(category = "extension", module = %self.module, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(category = "extension", module = %self.module, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(category = "extension", module = %self.module, "{}", message);
    }
}
