//! redb-backed [`SchemaStore`].
//!
//! Physical tables are not redb tables. Every row lives in one rows table
//! under a namespaced key (`"<table>:<key>"`), and a catalog table records
//! which physical tables exist. This keeps a whole migration batch inside a
//! single write transaction regardless of how many tables it touches.

use basalt_core::extension::{SchemaStore, StoreError, StoreOp};
use redb::{ReadableTable, Table, TableDefinition};
use serde_json::Value;

use crate::database::SharedDatabase;
use crate::error::{Error, Result};

// Catalog: key = physical table name, value = unused
const CATALOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_catalog");

// Rows: key = "table:key", value = JSON
const ROWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_rows");

/// Create a namespaced key for the rows table.
fn make_key(table: &str, key: &str) -> String {
    format!("{}:{}", table, key)
}

/// Physical names come from the runtime already qualified; only the row
/// key separator is reserved here.
fn check_table_name(table: &str) -> Result<()> {
    if table.is_empty() || table.contains(':') {
        return Err(Error::InvalidName(table.to_string()));
    }
    Ok(())
}

/// Persistent schema store.
#[derive(Debug, Clone)]
pub struct RedbStore {
    db: SharedDatabase,
}

impl RedbStore {
    pub fn new(db: SharedDatabase) -> Result<Self> {
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Ensure all required tables exist
    fn ensure_tables(&self) -> Result<()> {
        let write_txn = self.db.db().begin_write()?;
        {
            let _ = write_txn.open_table(CATALOG_TABLE)?;
            let _ = write_txn.open_table(ROWS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn exists(&self, table: &str) -> Result<bool> {
        let read_txn = self.db.db().begin_read()?;
        let catalog = read_txn.open_table(CATALOG_TABLE)?;
        Ok(catalog.get(table)?.is_some())
    }

    fn require(&self, table: &str) -> Result<()> {
        if self.exists(table)? {
            Ok(())
        } else {
            Err(Error::TableNotFound(table.to_string()))
        }
    }

    fn read_row(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.require(table)?;
        let read_txn = self.db.db().begin_read()?;
        let rows = read_txn.open_table(ROWS_TABLE)?;
        match rows.get(make_key(table, key).as_str())? {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    fn scan_rows(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>> {
        self.require(table)?;
        let start = make_key(table, prefix);
        let table_prefix_len = table.len() + 1; // "table:"

        let read_txn = self.db.db().begin_read()?;
        let rows = read_txn.open_table(ROWS_TABLE)?;

        let mut results = Vec::new();
        for item in rows.range(start.as_str()..)? {
            if limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            let (key, value) = item?;
            let key_str = key.value();
            if !key_str.starts_with(&start) {
                break;
            }
            if let Some(rest) = key_str.get(table_prefix_len..) {
                results.push((rest.to_string(), serde_json::from_slice(value.value())?));
            }
        }
        Ok(results)
    }

    fn table_names(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.db().begin_read()?;
        let catalog = read_txn.open_table(CATALOG_TABLE)?;

        let mut names = Vec::new();
        for item in catalog.range(prefix..)? {
            let (name, _) = item?;
            let name = name.value();
            if !name.starts_with(prefix) {
                break;
            }
            names.push(name.to_string());
        }
        Ok(names)
    }

    /// Apply a batch inside one write transaction. Any failing op aborts the
    /// transaction, so nothing in the batch becomes visible.
    fn apply_batch(&self, ops: Vec<StoreOp>) -> Result<()> {
        let write_txn = self.db.db().begin_write()?;
        let outcome = {
            let mut catalog = write_txn.open_table(CATALOG_TABLE)?;
            let mut rows = write_txn.open_table(ROWS_TABLE)?;
            let result = ops
                .into_iter()
                .try_for_each(|op| apply_op(&mut catalog, &mut rows, op));
            result
        };

        match outcome {
            Ok(()) => {
                write_txn.commit()?;
                Ok(())
            }
            Err(e) => {
                write_txn.abort()?;
                Err(e)
            }
        }
    }
}

type RawTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn ensure_exists(catalog: &RawTable<'_>, table: &str) -> Result<()> {
    if catalog.get(table)?.is_some() {
        Ok(())
    } else {
        Err(Error::TableNotFound(table.to_string()))
    }
}

fn apply_op(
    catalog: &mut RawTable<'_>,
    rows: &mut RawTable<'_>,
    op: StoreOp,
) -> Result<()> {
    match op {
        StoreOp::CreateTable { table } => {
            check_table_name(&table)?;
            if catalog.get(table.as_str())?.is_some() {
                return Err(Error::TableExists(table));
            }
            catalog.insert(table.as_str(), b"".as_slice())?;
        }
        StoreOp::DropTable { table } => {
            if catalog.remove(table.as_str())?.is_none() {
                return Err(Error::TableNotFound(table));
            }
            let start = make_key(&table, "");
            let mut keys = Vec::new();
            for item in rows.range(start.as_str()..)? {
                let (key, _) = item?;
                let key = key.value();
                if !key.starts_with(&start) {
                    break;
                }
                keys.push(key.to_string());
            }
            for key in keys {
                rows.remove(key.as_str())?;
            }
        }
        StoreOp::Put { table, key, value } => {
            ensure_exists(catalog, &table)?;
            let data = serde_json::to_vec(&value)?;
            rows.insert(make_key(&table, &key).as_str(), data.as_slice())?;
        }
        StoreOp::Delete { table, key } => {
            ensure_exists(catalog, &table)?;
            rows.remove(make_key(&table, &key).as_str())?;
        }
    }
    Ok(())
}

impl SchemaStore for RedbStore {
    fn table_exists(&self, table: &str) -> std::result::Result<bool, StoreError> {
        Ok(self.exists(table)?)
    }

    fn get(&self, table: &str, key: &str) -> std::result::Result<Option<Value>, StoreError> {
        Ok(self.read_row(table, key)?)
    }

    fn scan(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<(String, Value)>, StoreError> {
        Ok(self.scan_rows(table, prefix, limit)?)
    }

    fn list_tables(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        Ok(self.table_names(prefix)?)
    }

    fn apply(&self, ops: Vec<StoreOp>) -> std::result::Result<(), StoreError> {
        Ok(self.apply_batch(ops)?)
    }
}
