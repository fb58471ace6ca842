//! redb-backed [`BlobStorage`].

use basalt_core::extension::{BlobStorage, StoreError};
use redb::TableDefinition;

use crate::database::SharedDatabase;
use crate::error::Result;

// Blobs table: key = full blob path, value = raw bytes
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Persistent blob storage.
#[derive(Debug, Clone)]
pub struct RedbBlobStorage {
    db: SharedDatabase,
}

impl RedbBlobStorage {
    pub fn new(db: SharedDatabase) -> Result<Self> {
        let write_txn = db.db().begin_write()?;
        {
            let _ = write_txn.open_table(BLOBS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.db().begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.db().begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        Ok(table.get(key)?.map(|data| data.value().to_vec()))
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.db().begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            let existed = table.remove(key)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Visit every blob under `prefix` in key order.
    fn for_each_prefixed(&self, prefix: &str, mut f: impl FnMut(&str, &[u8])) -> Result<()> {
        let read_txn = self.db.db().begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        for item in table.range(prefix..)? {
            let (key, value) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            f(key, value.value());
        }
        Ok(())
    }
}

impl BlobStorage for RedbBlobStorage {
    fn put(&self, key: &str, data: &[u8]) -> std::result::Result<(), StoreError> {
        Ok(self.write(key, data)?)
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read(key)?)
    }

    fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
        Ok(self.remove(key)?)
    }

    fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.for_each_prefixed(prefix, |key, _| keys.push(key.to_string()))?;
        Ok(keys)
    }

    fn usage(&self, prefix: &str) -> std::result::Result<u64, StoreError> {
        let mut total = 0u64;
        self.for_each_prefixed(prefix, |_, data| total += data.len() as u64)?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> RedbBlobStorage {
        RedbBlobStorage::new(SharedDatabase::memory().unwrap()).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let blobs = blobs();
        blobs.put("modules/a/x", b"hello").unwrap();
        assert_eq!(blobs.get("modules/a/x").unwrap(), Some(b"hello".to_vec()));
        assert!(blobs.delete("modules/a/x").unwrap());
        assert!(!blobs.delete("modules/a/x").unwrap());
        assert_eq!(blobs.get("modules/a/x").unwrap(), None);
    }

    #[test]
    fn test_list_and_usage_by_prefix() {
        let blobs = blobs();
        blobs.put("modules/a/y", b"!").unwrap();
        blobs.put("modules/a/x", b"hello").unwrap();
        blobs.put("modules/ab/x", b"other").unwrap();

        assert_eq!(
            blobs.list("modules/a/").unwrap(),
            vec!["modules/a/x".to_string(), "modules/a/y".to_string()]
        );
        assert_eq!(blobs.usage("modules/a/").unwrap(), 6);
        assert_eq!(blobs.usage("modules/").unwrap(), 11);
        assert_eq!(blobs.usage("nothing/").unwrap(), 0);
    }
}
