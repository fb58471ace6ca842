//! Host persistence collaborators.
//!
//! The runtime never talks to a database directly. It consumes a
//! [`SchemaStore`] (named tables of JSON rows with atomic batches) and a
//! [`BlobStorage`] (flat key space of byte blobs). Module code only reaches
//! them through the scoped views in [`super::services`].

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Maximum length of a schema or table identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Errors from the persistence collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("invalid identifier: {0}")]
    InvalidName(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    CreateTable { table: String },
    DropTable { table: String },
    Put { table: String, key: String, value: Value },
    Delete { table: String, key: String },
}

impl StoreOp {
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable { table }
            | Self::DropTable { table }
            | Self::Put { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }
}

/// Table-oriented store. Tables are addressed by their physical name.
///
/// `apply` must be atomic: either every op in the batch takes effect or
/// none does.
pub trait SchemaStore: Send + Sync + 'static {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Rows whose key starts with `prefix`, in key order.
    fn scan(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Physical table names starting with `prefix`.
    fn list_tables(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;
}

/// Flat blob store. Keys are `/`-separated paths.
pub trait BlobStorage: Send + Sync + 'static {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Total bytes stored under `prefix`.
    fn usage(&self, prefix: &str) -> Result<u64, StoreError>;
}

/// Checks a schema or table identifier: ascii letters, digits and `_`,
/// not starting with a digit.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Physical name of `table` inside `schema`.
pub fn qualify(schema: &str, table: &str) -> Result<String, StoreError> {
    validate_identifier(schema)?;
    validate_identifier(table)?;
    Ok(format!("{schema}.{table}"))
}

type Tables = BTreeMap<String, BTreeMap<String, Value>>;

/// In-memory [`SchemaStore`], used by tests and by hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_op(tables: &mut Tables, op: StoreOp) -> Result<(), StoreError> {
    match op {
        StoreOp::CreateTable { table } => {
            if tables.contains_key(&table) {
                return Err(StoreError::TableExists(table));
            }
            tables.insert(table, BTreeMap::new());
        }
        StoreOp::DropTable { table } => {
            if tables.remove(&table).is_none() {
                return Err(StoreError::TableNotFound(table));
            }
        }
        StoreOp::Put { table, key, value } => {
            let rows = tables
                .get_mut(&table)
                .ok_or(StoreError::TableNotFound(table.clone()))?;
            rows.insert(key, value);
        }
        StoreOp::Delete { table, key } => {
            let rows = tables
                .get_mut(&table)
                .ok_or(StoreError::TableNotFound(table.clone()))?;
            rows.remove(&key);
        }
    }
    Ok(())
}

impl SchemaStore for MemoryStore {
    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.tables.read().contains_key(table))
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn scan(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn list_tables(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .tables
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        // Stage on a copy so a failing op leaves the store untouched.
        let mut staged = tables.clone();
        for op in ops {
            apply_op(&mut staged, op)?;
        }
        *tables = staged;
        Ok(())
    }
}

/// In-memory [`BlobStorage`].
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.blobs.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn usage(&self, prefix: &str) -> Result<u64, StoreError> {
        Ok(self
            .blobs
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.len() as u64)
            .sum())
    }
}
